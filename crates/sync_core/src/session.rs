use std::collections::BTreeMap;

use shared::domain::{MessageId, SessionId, SessionKind, SessionState, UserId};
use shared::error::{SyncError, SyncResult};
use shared::model::{ChatMessage, ParticipantActivity, RoomMetadata, UserProfile};
use tokio::task::JoinHandle;

use crate::coordinator::Delivery;

/// Descriptor of a resolved conversation. Handed to callers and passed back
/// to address attach and send operations.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub state: SessionState,
    /// Current user first, then the other participants.
    pub participants: Vec<UserId>,
    pub name: Option<String>,
    pub photo_url: Option<String>,
}

impl SessionHandle {
    pub fn is_materialized(&self) -> bool {
        self.state == SessionState::Materialized
    }

    /// The single other participant of a one-to-one session.
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        if self.kind != SessionKind::Direct {
            return None;
        }
        self.participants.iter().find(|user| *user != me)
    }
}

/// Locally held view of the active session. Only the stream coordinator
/// mutates it; callers receive copies.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    /// Ordered by `created_at` ascending.
    pub messages: Vec<ChatMessage>,
    pub activity: BTreeMap<UserId, ParticipantActivity>,
    pub metadata: Option<RoomMetadata>,
    pub counterpart_profile: Option<UserProfile>,
    pub counterpart_typing: bool,
    /// Local echoes whose remote write failed. They stay visible until a
    /// retry succeeds or the session is disposed.
    pub undelivered: Vec<ChatMessage>,
}

impl SessionView {
    pub(crate) fn upsert_message(&mut self, message: ChatMessage) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
        sort_messages(&mut self.messages);
    }

    pub(crate) fn remove_message(&mut self, id: &MessageId) {
        self.messages.retain(|m| m.id != *id);
        self.undelivered.retain(|m| m.id != *id);
    }

    /// Wholesale replacement from a snapshot emission. Undelivered local
    /// echoes missing from the server set are re-appended so a failed send
    /// does not silently vanish from the view.
    pub(crate) fn replace_messages(&mut self, mut messages: Vec<ChatMessage>) {
        for echo in &self.undelivered {
            if !messages.iter().any(|m| m.id == echo.id) {
                messages.push(echo.clone());
            }
        }
        sort_messages(&mut messages);
        self.messages = messages;
    }

    pub(crate) fn mark_undelivered(&mut self, message: &ChatMessage) {
        if !self.undelivered.iter().any(|m| m.id == message.id) {
            self.undelivered.push(message.clone());
        }
        self.upsert_message(message.clone());
    }

    pub(crate) fn clear_undelivered(&mut self, id: &MessageId) {
        self.undelivered.retain(|m| m.id != *id);
    }
}

pub(crate) fn sort_messages(messages: &mut [ChatMessage]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// One attach. Replaced wholesale by a newer attach; `live` stays `None`
/// while the attach is deferred on a pending session.
pub(crate) struct Attachment {
    pub(crate) generation: u64,
    pub(crate) delivery: Delivery,
    pub(crate) live: Option<Vec<JoinHandle<()>>>,
}

impl Attachment {
    pub(crate) fn cancel(&mut self) {
        if let Some(tasks) = self.live.take() {
            for task in tasks {
                task.abort();
            }
        }
    }
}

pub(crate) struct ChatSession {
    pub(crate) handle: SessionHandle,
    pub(crate) view: SessionView,
    pub(crate) attachment: Option<Attachment>,
}

impl ChatSession {
    pub(crate) fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            view: SessionView::default(),
            attachment: None,
        }
    }

    /// The single pending to materialized transition. The id is swapped at
    /// the same time because a pending one-to-one session may adopt a room
    /// another client created first.
    pub(crate) fn materialize(&mut self, session_id: SessionId) -> SyncResult<()> {
        match self.handle.state {
            SessionState::Pending => {
                self.handle.session_id = session_id;
                self.handle.state = SessionState::Materialized;
                Ok(())
            }
            SessionState::Materialized => Err(SyncError::invalid_argument(
                "session is already materialized",
            )),
        }
    }
}
