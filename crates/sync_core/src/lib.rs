use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use shared::domain::{MessageId, MessageKind, SessionId, UserId};
use shared::error::{SyncError, SyncResult};
use shared::model::{ChatMessage, ParticipantActivity, RoomMetadata, UserProfile};
use store::config::StoreConfig;
use store::{BlobStore, DocumentStore};
use tokio::sync::{broadcast, Mutex};

mod coordinator;
mod dispatcher;
mod membership;
mod presence;
mod resolver;
mod session;

pub use coordinator::{AttachOptions, Delivery, MessageChange, Subscription};
pub use dispatcher::{MediaPayload, MessageDraft, MessageUpdate, SendOptions};
pub use resolver::{CreateMode, SessionRequest};
pub use session::{SessionHandle, SessionView};
pub use store::config::CollectionNames;
pub use store::ChangeKind;

use presence::PresenceTracker;
use session::ChatSession;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub current_user: UserId,
    pub store: StoreConfig,
    /// Message kinds whose document may only be removed after their media
    /// blob was successfully deleted.
    pub blob_required_for: BTreeSet<MessageKind>,
}

impl EngineConfig {
    pub fn new(current_user: impl Into<UserId>) -> Self {
        Self {
            current_user: current_user.into(),
            store: StoreConfig::default(),
            blob_required_for: BTreeSet::from([MessageKind::Image, MessageKind::Voice]),
        }
    }
}

/// Everything the engine tells its callers arrives through this channel;
/// no callbacks are registered anywhere.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SessionMaterialized {
        session_id: SessionId,
    },
    /// Full ordered view after a snapshot emission or a local cache change.
    MessagesReplaced {
        session_id: SessionId,
        messages: Vec<ChatMessage>,
    },
    /// Operation-tagged deltas when the attach asked for change delivery.
    MessagesChanged {
        session_id: SessionId,
        changes: Vec<MessageChange>,
    },
    ActivityUpdated {
        session_id: SessionId,
        activity: BTreeMap<UserId, ParticipantActivity>,
    },
    CounterpartTyping {
        session_id: SessionId,
        typing: bool,
    },
    MetadataUpdated {
        session_id: SessionId,
        metadata: RoomMetadata,
    },
    CounterpartProfile {
        session_id: SessionId,
        profile: UserProfile,
    },
    /// The remote write for a locally buffered message failed; the message
    /// stays visible as undelivered until a retry succeeds.
    SendFailed {
        session_id: SessionId,
        message_id: MessageId,
    },
    /// Non-fatal background failure, reported instead of being swallowed.
    Error {
        detail: String,
    },
}

/// One engine instance per signed-in user. All conversation state hangs off
/// the instance; independent callers construct independent engines.
pub struct SyncEngine {
    current_user: UserId,
    paths: StoreConfig,
    blob_required_for: BTreeSet<MessageKind>,
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    session: Mutex<Option<ChatSession>>,
    attach_seq: AtomicU64,
    presence: PresenceTracker,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> SyncResult<Arc<Self>> {
        if config.current_user.is_blank() {
            return Err(SyncError::invalid_argument(
                "current user id must not be empty",
            ));
        }
        config.store.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            current_user: config.current_user,
            paths: config.store,
            blob_required_for: config.blob_required_for,
            store,
            blobs,
            session: Mutex::new(None),
            attach_seq: AtomicU64::new(0),
            presence: PresenceTracker::new(),
            events,
        }))
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Descriptor of the active session, if one has been resolved.
    pub async fn active_session(&self) -> Option<SessionHandle> {
        let active = self.session.lock().await;
        active.as_ref().map(|session| session.handle.clone())
    }

    /// Copy of the locally held view of the active session.
    pub async fn session_view(&self) -> Option<SessionView> {
        let active = self.session.lock().await;
        active.as_ref().map(|session| session.view.clone())
    }

    pub async fn local_messages(&self) -> Vec<ChatMessage> {
        let active = self.session.lock().await;
        active
            .as_ref()
            .map(|session| session.view.messages.clone())
            .unwrap_or_default()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod support;

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod engine_tests;

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod dispatcher_tests;

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod membership_tests;
