use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::domain::{MessageId, SessionId, SessionKind, SessionState, TypingStatus, UserId};
use shared::error::{SyncError, SyncResult};
use shared::model::{ChatMessage, ParticipantActivity, RoomMetadata, SessionRecord, UserProfile};
use store::{ChangeKind, Document, DocumentChange, Filter, OrderBy, Query};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::session::{Attachment, ChatSession, SessionView};
use crate::{SessionHandle, SyncEngine, SyncEvent};

/// How message emissions are delivered: full ordered snapshots (wholesale
/// replacement) or operation-tagged change sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    #[default]
    Snapshots,
    Changes,
}

#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub delivery: Delivery,
}

/// Token for one attach. Detaching with a superseded token is a no-op.
#[derive(Debug, Clone)]
pub struct Subscription {
    session_id: SessionId,
    generation: u64,
}

impl Subscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

#[derive(Debug, Clone)]
pub struct MessageChange {
    pub message: ChatMessage,
    pub kind: ChangeKind,
}

impl SyncEngine {
    /// Start the coordinated live subscriptions for the active session:
    /// messages, participant activity, and room metadata (the counterpart's
    /// profile for one-to-one sessions). Attaching again replaces the
    /// previous subscriptions. On a pending session the attach is recorded
    /// and completed once the first send materializes the session.
    pub async fn attach(
        self: &Arc<Self>,
        handle: &SessionHandle,
        options: AttachOptions,
    ) -> SyncResult<Subscription> {
        let generation = self.attach_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (session_id, session_state) = {
            let mut active = self.session.lock().await;
            let session = active
                .as_mut()
                .ok_or_else(|| SyncError::invalid_argument("no active session to attach"))?;
            if session.handle.session_id != handle.session_id {
                return Err(SyncError::invalid_argument(
                    "handle does not refer to the active session",
                ));
            }
            if let Some(attachment) = session.attachment.as_mut() {
                let had_live = attachment.live.is_some();
                attachment.cancel();
                if had_live {
                    // Fresh subscriptions repopulate the view; only the
                    // undelivered echoes survive the reset.
                    let undelivered = std::mem::take(&mut session.view.undelivered);
                    session.view = SessionView {
                        undelivered,
                        ..SessionView::default()
                    };
                }
                debug!(session_id = %session.handle.session_id, "attach: replacing the previous subscriptions");
            }
            session.attachment = Some(Attachment {
                generation,
                delivery: options.delivery,
                live: None,
            });
            (session.handle.session_id.clone(), session.handle.state)
        };
        if session_state == SessionState::Materialized {
            self.start_live_streams(generation).await?;
        } else {
            debug!(session_id = %session_id, "attach: deferred until the first send materializes the session");
        }
        Ok(Subscription {
            session_id,
            generation,
        })
    }

    /// Cancel the subscriptions and dispose the active session together with
    /// its local view. Safe to call with a stale token.
    pub async fn detach(&self, subscription: &Subscription) {
        let mut active = self.session.lock().await;
        let current = active
            .as_ref()
            .and_then(|session| session.attachment.as_ref())
            .map(|attachment| attachment.generation == subscription.generation)
            .unwrap_or(false);
        if !current {
            trace!(
                generation = subscription.generation,
                "detach: superseded token ignored"
            );
            return;
        }
        if let Some(mut session) = active.take() {
            if let Some(attachment) = session.attachment.as_mut() {
                attachment.cancel();
            }
            debug!(session_id = %session.handle.session_id, "detach: session disposed");
        }
    }

    pub(crate) async fn start_live_streams(self: &Arc<Self>, generation: u64) -> SyncResult<()> {
        let (session_id, kind, participants, delivery) = {
            let active = self.session.lock().await;
            let session = match active.as_ref() {
                Some(session) => session,
                None => return Ok(()),
            };
            let attachment = match session.attachment.as_ref() {
                Some(attachment) if attachment.generation == generation => attachment,
                // Superseded before the streams started.
                _ => return Ok(()),
            };
            (
                session.handle.session_id.clone(),
                session.handle.kind,
                session.handle.participants.clone(),
                attachment.delivery,
            )
        };
        let window = match kind {
            SessionKind::Group => self.join_boundary(&session_id, &self.current_user).await,
            SessionKind::Direct => None,
        };
        let messages = self
            .spawn_message_pump(&session_id, generation, delivery, window)
            .await?;
        let activity = match self
            .spawn_activity_pump(&session_id, generation, &participants)
            .await
        {
            Ok(task) => task,
            Err(err) => {
                messages.abort();
                return Err(err);
            }
        };
        let metadata = match self
            .spawn_metadata_pump(&session_id, generation, kind, &participants)
            .await
        {
            Ok(task) => task,
            Err(err) => {
                messages.abort();
                activity.abort();
                return Err(err);
            }
        };
        let mut tasks = vec![messages, activity, metadata];
        let installed = {
            let mut active = self.session.lock().await;
            match active.as_mut().and_then(|session| session.attachment.as_mut()) {
                Some(attachment) if attachment.generation == generation => {
                    attachment.live = Some(std::mem::take(&mut tasks));
                    true
                }
                _ => false,
            }
        };
        if installed {
            debug!(session_id = %session_id, generation, "attach: live subscriptions running");
        } else {
            // A newer attach or a session replacement won the race.
            for task in tasks {
                task.abort();
            }
            debug!(session_id = %session_id, generation, "attach: superseded while starting; streams cancelled");
        }
        Ok(())
    }

    /// Complete an attach that was deferred while the session was pending.
    pub(crate) async fn complete_deferred_attach(self: &Arc<Self>) {
        let deferred = {
            let active = self.session.lock().await;
            match active.as_ref() {
                Some(session) if session.handle.state == SessionState::Materialized => session
                    .attachment
                    .as_ref()
                    .filter(|attachment| attachment.live.is_none())
                    .map(|attachment| attachment.generation),
                _ => None,
            }
        };
        if let Some(generation) = deferred {
            if let Err(err) = self.start_live_streams(generation).await {
                warn!(error = %err, "attach: deferred attach failed");
                self.emit(SyncEvent::Error {
                    detail: format!("deferred attach failed: {err}"),
                });
            }
        }
    }

    async fn spawn_message_pump(
        self: &Arc<Self>,
        session_id: &SessionId,
        generation: u64,
        delivery: Delivery,
        window: Option<DateTime<Utc>>,
    ) -> SyncResult<JoinHandle<()>> {
        let collection = self.paths.messages(session_id.as_str());
        let mut query = Query::new().order_by(OrderBy::asc("created_at"));
        if let Some(boundary) = window {
            query = query.filter(Filter::ge("created_at", boundary.timestamp_millis()));
        }
        let session_id = session_id.clone();
        match delivery {
            Delivery::Snapshots => {
                let mut stream = self.store.subscribe(&collection, query).await.map_err(|err| {
                    SyncError::operation_failed("failed to subscribe to the message stream", err)
                })?;
                let engine = Arc::clone(self);
                Ok(tokio::spawn(async move {
                    while let Some(snapshot) = stream.next().await {
                        engine
                            .apply_message_snapshot(generation, &session_id, snapshot)
                            .await;
                    }
                }))
            }
            Delivery::Changes => {
                let mut stream = self
                    .store
                    .subscribe_changes(&collection, query)
                    .await
                    .map_err(|err| {
                        SyncError::operation_failed("failed to subscribe to the message stream", err)
                    })?;
                let engine = Arc::clone(self);
                Ok(tokio::spawn(async move {
                    while let Some(changes) = stream.next().await {
                        engine
                            .apply_message_changes(generation, &session_id, changes)
                            .await;
                    }
                }))
            }
        }
    }

    async fn spawn_activity_pump(
        self: &Arc<Self>,
        session_id: &SessionId,
        generation: u64,
        participants: &[UserId],
    ) -> SyncResult<JoinHandle<()>> {
        let ids = participants
            .iter()
            .map(|user| Value::from(user.as_str()))
            .collect();
        let query = Query::new().filter(Filter::is_in("user_id", ids));
        let mut stream = self
            .store
            .subscribe(&self.paths.activity(), query)
            .await
            .map_err(|err| {
                SyncError::operation_failed("failed to subscribe to the activity stream", err)
            })?;
        let engine = Arc::clone(self);
        let session_id = session_id.clone();
        Ok(tokio::spawn(async move {
            while let Some(snapshot) = stream.next().await {
                engine
                    .apply_activity_snapshot(generation, &session_id, snapshot)
                    .await;
            }
        }))
    }

    /// Groups follow their own session record; one-to-one sessions derive
    /// their display identity from the counterpart's profile.
    async fn spawn_metadata_pump(
        self: &Arc<Self>,
        session_id: &SessionId,
        generation: u64,
        kind: SessionKind,
        participants: &[UserId],
    ) -> SyncResult<JoinHandle<()>> {
        match kind {
            SessionKind::Group => {
                let query = Query::new().filter(Filter::eq("session_id", session_id.as_str()));
                let mut stream = self
                    .store
                    .subscribe(&self.paths.sessions(), query)
                    .await
                    .map_err(|err| {
                        SyncError::operation_failed(
                            "failed to subscribe to the metadata stream",
                            err,
                        )
                    })?;
                let engine = Arc::clone(self);
                let session_id = session_id.clone();
                Ok(tokio::spawn(async move {
                    while let Some(snapshot) = stream.next().await {
                        engine
                            .apply_metadata_snapshot(generation, &session_id, snapshot)
                            .await;
                    }
                }))
            }
            SessionKind::Direct => {
                let counterpart = participants
                    .iter()
                    .find(|user| **user != self.current_user)
                    .cloned()
                    .ok_or_else(|| {
                        SyncError::invalid_argument("one-to-one session has no counterpart")
                    })?;
                let query = Query::new().filter(Filter::eq("user_id", counterpart.as_str()));
                let mut stream = self
                    .store
                    .subscribe(&self.paths.profiles(), query)
                    .await
                    .map_err(|err| {
                        SyncError::operation_failed(
                            "failed to subscribe to the counterpart profile stream",
                            err,
                        )
                    })?;
                let engine = Arc::clone(self);
                let session_id = session_id.clone();
                Ok(tokio::spawn(async move {
                    while let Some(snapshot) = stream.next().await {
                        engine
                            .apply_profile_snapshot(generation, &session_id, snapshot)
                            .await;
                    }
                }))
            }
        }
    }

    async fn apply_message_snapshot(
        &self,
        generation: u64,
        session_id: &SessionId,
        snapshot: Vec<Document>,
    ) {
        let messages = self.decode_documents::<ChatMessage>(session_id, snapshot);
        let event = {
            let mut active = self.session.lock().await;
            match current_attachment(active.as_mut(), generation) {
                Some(session) => {
                    session.view.replace_messages(messages);
                    Some(SyncEvent::MessagesReplaced {
                        session_id: session.handle.session_id.clone(),
                        messages: session.view.messages.clone(),
                    })
                }
                None => {
                    trace!(session_id = %session_id, "stream: dropping a stale message emission");
                    None
                }
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    async fn apply_message_changes(
        &self,
        generation: u64,
        session_id: &SessionId,
        raw: Vec<DocumentChange>,
    ) {
        let mut changes = Vec::with_capacity(raw.len());
        for change in raw {
            match change.document.decode::<ChatMessage>() {
                Ok(message) => changes.push(MessageChange {
                    message,
                    kind: change.kind,
                }),
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "stream: skipping a malformed message change");
                    self.emit(SyncEvent::Error {
                        detail: err.to_string(),
                    });
                }
            }
        }
        if changes.is_empty() {
            return;
        }
        let event = {
            let mut active = self.session.lock().await;
            match current_attachment(active.as_mut(), generation) {
                Some(session) => {
                    for change in &changes {
                        match change.kind {
                            ChangeKind::Added | ChangeKind::Modified => {
                                session.view.upsert_message(change.message.clone());
                            }
                            ChangeKind::Removed => session.view.remove_message(&change.message.id),
                        }
                    }
                    Some(SyncEvent::MessagesChanged {
                        session_id: session.handle.session_id.clone(),
                        changes,
                    })
                }
                None => {
                    trace!(session_id = %session_id, "stream: dropping a stale change emission");
                    None
                }
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    async fn apply_activity_snapshot(
        &self,
        generation: u64,
        session_id: &SessionId,
        snapshot: Vec<Document>,
    ) {
        let entries = self.decode_documents::<ParticipantActivity>(session_id, snapshot);
        let mut activity = BTreeMap::new();
        for entry in entries {
            activity.insert(entry.user_id.clone(), entry);
        }
        let events = {
            let mut active = self.session.lock().await;
            match current_attachment(active.as_mut(), generation) {
                Some(session) => {
                    session.view.activity = activity.clone();
                    let mut events = vec![SyncEvent::ActivityUpdated {
                        session_id: session.handle.session_id.clone(),
                        activity,
                    }];
                    if session.handle.kind == SessionKind::Direct {
                        let typing = session
                            .handle
                            .counterpart(&self.current_user)
                            .and_then(|peer| session.view.activity.get(peer))
                            .map(|entry| entry.typing_status == TypingStatus::Typing)
                            .unwrap_or(false);
                        session.view.counterpart_typing = typing;
                        events.push(SyncEvent::CounterpartTyping {
                            session_id: session.handle.session_id.clone(),
                            typing,
                        });
                    }
                    events
                }
                None => Vec::new(),
            }
        };
        for event in events {
            self.emit(event);
        }
    }

    async fn apply_metadata_snapshot(
        &self,
        generation: u64,
        session_id: &SessionId,
        snapshot: Vec<Document>,
    ) {
        let records = self.decode_documents::<SessionRecord>(session_id, snapshot);
        let record = match records.into_iter().next() {
            Some(record) => record,
            None => return,
        };
        let event = {
            let mut active = self.session.lock().await;
            match current_attachment(active.as_mut(), generation) {
                Some(session) => {
                    let metadata = RoomMetadata {
                        display_name: record.name.clone(),
                        photo_url: record.photo_url.clone(),
                    };
                    session.view.metadata = Some(metadata.clone());
                    session.handle.name = record.name;
                    session.handle.photo_url = record.photo_url;
                    session.handle.participants = record.members;
                    Some(SyncEvent::MetadataUpdated {
                        session_id: session.handle.session_id.clone(),
                        metadata,
                    })
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    async fn apply_profile_snapshot(
        &self,
        generation: u64,
        session_id: &SessionId,
        snapshot: Vec<Document>,
    ) {
        let profiles = self.decode_documents::<UserProfile>(session_id, snapshot);
        let profile = match profiles.into_iter().next() {
            Some(profile) => profile,
            None => return,
        };
        let events = {
            let mut active = self.session.lock().await;
            match current_attachment(active.as_mut(), generation) {
                Some(session) => {
                    let metadata = RoomMetadata::from(&profile);
                    session.view.metadata = Some(metadata.clone());
                    session.view.counterpart_profile = Some(profile.clone());
                    vec![
                        SyncEvent::CounterpartProfile {
                            session_id: session.handle.session_id.clone(),
                            profile,
                        },
                        SyncEvent::MetadataUpdated {
                            session_id: session.handle.session_id.clone(),
                            metadata,
                        },
                    ]
                }
                None => Vec::new(),
            }
        };
        for event in events {
            self.emit(event);
        }
    }

    fn decode_documents<T: DeserializeOwned>(
        &self,
        session_id: &SessionId,
        docs: Vec<Document>,
    ) -> Vec<T> {
        let mut decoded = Vec::with_capacity(docs.len());
        for doc in docs {
            match doc.decode::<T>() {
                Ok(item) => decoded.push(item),
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "stream: skipping a malformed document");
                    self.emit(SyncEvent::Error {
                        detail: err.to_string(),
                    });
                }
            }
        }
        decoded
    }

    /// Put a local echo into the view before its remote write.
    pub(crate) async fn buffer_local(&self, message: ChatMessage) {
        let event = {
            let mut active = self.session.lock().await;
            match active.as_mut() {
                Some(session) => {
                    session.view.upsert_message(message);
                    Some(SyncEvent::MessagesReplaced {
                        session_id: session.handle.session_id.clone(),
                        messages: session.view.messages.clone(),
                    })
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    pub(crate) async fn mark_undelivered(&self, message: &ChatMessage) {
        let events = {
            let mut active = self.session.lock().await;
            match active.as_mut() {
                Some(session) => {
                    session.view.mark_undelivered(message);
                    vec![
                        SyncEvent::SendFailed {
                            session_id: session.handle.session_id.clone(),
                            message_id: message.id.clone(),
                        },
                        SyncEvent::MessagesReplaced {
                            session_id: session.handle.session_id.clone(),
                            messages: session.view.messages.clone(),
                        },
                    ]
                }
                None => Vec::new(),
            }
        };
        for event in events {
            self.emit(event);
        }
    }

    pub(crate) async fn clear_undelivered(&self, id: &MessageId) {
        let mut active = self.session.lock().await;
        if let Some(session) = active.as_mut() {
            session.view.clear_undelivered(id);
        }
    }

    /// Rewrite the session id of a buffered echo after a pending one-to-one
    /// session adopted an existing room.
    pub(crate) async fn rebind_local(&self, id: &MessageId, session_id: &SessionId) {
        let mut active = self.session.lock().await;
        if let Some(session) = active.as_mut() {
            for message in session
                .view
                .messages
                .iter_mut()
                .chain(session.view.undelivered.iter_mut())
            {
                if message.id == *id {
                    message.session_id = session_id.clone();
                }
            }
        }
    }

    pub(crate) async fn remove_local(&self, id: &MessageId) {
        let event = {
            let mut active = self.session.lock().await;
            match active.as_mut() {
                Some(session) => {
                    session.view.remove_message(id);
                    Some(SyncEvent::MessagesReplaced {
                        session_id: session.handle.session_id.clone(),
                        messages: session.view.messages.clone(),
                    })
                }
                None => None,
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }
}

fn current_attachment(
    active: Option<&mut ChatSession>,
    generation: u64,
) -> Option<&mut ChatSession> {
    match active {
        Some(session)
            if session
                .attachment
                .as_ref()
                .map(|attachment| attachment.generation == generation)
                .unwrap_or(false) =>
        {
            Some(session)
        }
        _ => None,
    }
}
