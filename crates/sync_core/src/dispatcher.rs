use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use serde_json::Value;
use shared::domain::{DeliveryStatus, MessageId, MessageKind, SessionId, SessionState, UserId};
use shared::error::{SyncError, SyncResult};
use shared::model::{ChatMessage, LastMessage};
use store::{OrderBy, Query};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{SyncEngine, SyncEvent};

const SEND_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub kind: MessageKind,
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub extra: Option<Value>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            reply_to: None,
            extra: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Additional write attempts after the first failure.
    pub retry_limit: u32,
    pub media: Option<MediaPayload>,
}

/// Partial edit of a stored message. `Some((user, None))` removes that
/// user's reaction.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub status: Option<DeliveryStatus>,
    pub reaction: Option<(UserId, Option<String>)>,
}

impl MessageUpdate {
    fn is_empty(&self) -> bool {
        self.status.is_none() && self.reaction.is_none()
    }
}

impl SyncEngine {
    /// Send a message to the active session. The first send into a pending
    /// session creates the backing records on the way. A failed remote write
    /// keeps the local echo visible and flagged undelivered; retrying later
    /// through [`SyncEngine::send_raw`] with the same id clears the flag.
    pub async fn send(
        self: &Arc<Self>,
        draft: MessageDraft,
        options: SendOptions,
    ) -> SyncResult<ChatMessage> {
        if draft.content.is_empty() && options.media.is_none() {
            return Err(SyncError::invalid_argument(
                "message content must not be empty",
            ));
        }
        let (session_id, _) = self.active_target().await?;
        let message = ChatMessage {
            id: MessageId::new(Uuid::new_v4().to_string()),
            session_id,
            sender: self.current_user.clone(),
            // Timestamps persist as epoch milliseconds; generate them at that
            // precision so the local echo equals the stored copy.
            created_at: Utc::now().trunc_subsecs(3),
            kind: draft.kind,
            content: draft.content,
            reply_to: draft.reply_to,
            reactions: BTreeMap::new(),
            status: DeliveryStatus::Sent,
            extra: draft.extra,
        };
        self.send_raw(message, options).await
    }

    /// Send a fully formed message. Used directly to retry an undelivered
    /// echo under its original id.
    pub async fn send_raw(
        self: &Arc<Self>,
        message: ChatMessage,
        options: SendOptions,
    ) -> SyncResult<ChatMessage> {
        if message.id.is_blank() {
            return Err(SyncError::invalid_argument("message id must not be empty"));
        }
        if options.media.is_some() && !message.kind.is_media() {
            return Err(SyncError::invalid_argument(
                "media payloads require an image or voice message",
            ));
        }
        let (session_id, state) = self.active_target().await?;
        if message.session_id != session_id {
            return Err(SyncError::invalid_argument(
                "message does not belong to the active session",
            ));
        }
        match state {
            SessionState::Pending => self.send_via_materialization(message, options).await,
            SessionState::Materialized => self.send_direct(message, options).await,
        }
    }

    /// First send into a pending session: buffer the echo, create the
    /// backing records, then write. The echo is rebound when materialization
    /// adopts a room the counterpart created first.
    async fn send_via_materialization(
        self: &Arc<Self>,
        mut message: ChatMessage,
        options: SendOptions,
    ) -> SyncResult<ChatMessage> {
        self.buffer_local(message.clone()).await;
        let session_id = match self.materialize_active().await {
            Ok(session_id) => session_id,
            Err(err) => {
                self.mark_undelivered(&message).await;
                return Err(err);
            }
        };
        if session_id != message.session_id {
            self.rebind_local(&message.id, &session_id).await;
            message.session_id = session_id;
        }
        let message = match self.finish_send(message, &options).await {
            Ok(message) => message,
            Err(err) => {
                return Err(SyncError::partial_failure(
                    "session created",
                    "failed to write the first message",
                    err,
                ));
            }
        };
        self.after_send(&message).await;
        Ok(message)
    }

    async fn send_direct(
        self: &Arc<Self>,
        message: ChatMessage,
        options: SendOptions,
    ) -> SyncResult<ChatMessage> {
        self.buffer_local(message.clone()).await;
        let message = self.finish_send(message, &options).await?;
        self.after_send(&message).await;
        Ok(message)
    }

    async fn finish_send(
        &self,
        mut message: ChatMessage,
        options: &SendOptions,
    ) -> SyncResult<ChatMessage> {
        if let Some(media) = options.media.as_ref() {
            match self.upload_media(&message, media).await {
                Ok(url) => {
                    message.content = url;
                    self.buffer_local(message.clone()).await;
                }
                Err(err) => {
                    self.mark_undelivered(&message).await;
                    return Err(err);
                }
            }
        }
        match self.write_message(&message, options.retry_limit).await {
            Ok(()) => {
                self.clear_undelivered(&message.id).await;
                Ok(message)
            }
            Err(err) => {
                self.mark_undelivered(&message).await;
                Err(err)
            }
        }
    }

    async fn write_message(&self, message: &ChatMessage, retry_limit: u32) -> SyncResult<()> {
        let collection = self.paths.messages(message.session_id.as_str());
        let payload = serde_json::to_value(message)
            .map_err(|err| SyncError::operation_failed("failed to encode message", err))?;
        let mut attempt = 0u32;
        loop {
            match self
                .store
                .write(&collection, message.id.as_str(), payload.clone())
                .await
            {
                Ok(()) => {
                    debug!(message_id = %message.id, session_id = %message.session_id, "dispatch: message written");
                    return Ok(());
                }
                Err(err) if attempt < retry_limit => {
                    attempt += 1;
                    warn!(message_id = %message.id, attempt, error = %err, "dispatch: message write failed; retrying");
                    sleep(SEND_RETRY_DELAY).await;
                }
                Err(err) => {
                    return Err(SyncError::operation_failed("failed to write message", err));
                }
            }
        }
    }

    async fn upload_media(
        &self,
        message: &ChatMessage,
        media: &MediaPayload,
    ) -> SyncResult<String> {
        if media.name.trim().is_empty() {
            return Err(SyncError::invalid_argument("media name must not be empty"));
        }
        let path = format!("media/{}", message.session_id);
        let name = format!("{}-{}", message.id, media.name);
        self.blobs
            .upload(media.bytes.clone(), &path, &name)
            .await
            .map_err(|err| SyncError::operation_failed("failed to upload media", err))
    }

    /// Best-effort bookkeeping after a delivered message: advance the last
    /// message pointer, complete a deferred attach, reset own typing state.
    async fn after_send(self: &Arc<Self>, message: &ChatMessage) {
        if let Err(err) = self.update_last_message(message).await {
            warn!(message_id = %message.id, error = %err, "dispatch: failed to update the last message pointer");
            self.emit(SyncEvent::Error {
                detail: format!("last message pointer update failed: {err}"),
            });
        }
        self.complete_deferred_attach().await;
        self.reset_typing_after_send().await;
    }

    async fn update_last_message(&self, message: &ChatMessage) -> SyncResult<()> {
        let pointer = serde_json::to_value(LastMessage::from(message)).map_err(|err| {
            SyncError::operation_failed("failed to encode last message pointer", err)
        })?;
        let fields = BTreeMap::from([("last_message".to_owned(), pointer)]);
        self.store
            .update(&self.paths.sessions(), message.session_id.as_str(), fields)
            .await
            .map_err(|err| {
                SyncError::operation_failed("failed to update the last message pointer", err)
            })?;
        Ok(())
    }

    /// Merge a status change and/or a reaction into a stored message. An
    /// empty update is skipped rather than rejected.
    pub async fn update_message(
        &self,
        message: &ChatMessage,
        update: MessageUpdate,
    ) -> SyncResult<()> {
        if message.id.is_blank() || message.session_id.is_blank() {
            return Err(SyncError::invalid_argument(
                "message and session ids must not be empty",
            ));
        }
        if update.is_empty() {
            trace!(message_id = %message.id, "dispatch: empty update skipped");
            return Ok(());
        }
        if self.is_pending_local(&message.session_id).await {
            return Err(SyncError::invalid_argument(
                "message has not been delivered yet",
            ));
        }
        let mut fields = BTreeMap::new();
        if let Some(status) = update.status {
            let value = serde_json::to_value(status)
                .map_err(|err| SyncError::operation_failed("failed to encode status", err))?;
            fields.insert("status".to_owned(), value);
        }
        if let Some((user, reaction)) = update.reaction {
            if user.is_blank() {
                return Err(SyncError::invalid_argument(
                    "reaction user id must not be empty",
                ));
            }
            let value = match reaction {
                Some(emoji) => Value::from(emoji),
                None => Value::Null,
            };
            fields.insert(format!("reactions.{user}"), value);
        }
        self.store
            .update(
                &self.paths.messages(message.session_id.as_str()),
                message.id.as_str(),
                fields,
            )
            .await
            .map_err(|err| SyncError::operation_failed("failed to update message", err))?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        message: &ChatMessage,
        status: DeliveryStatus,
    ) -> SyncResult<()> {
        self.update_message(
            message,
            MessageUpdate {
                status: Some(status),
                reaction: None,
            },
        )
        .await
    }

    /// Set or clear the current user's reaction on a message.
    pub async fn react(&self, message: &ChatMessage, reaction: Option<String>) -> SyncResult<()> {
        self.update_message(
            message,
            MessageUpdate {
                status: None,
                reaction: Some((self.current_user.clone(), reaction)),
            },
        )
        .await
    }

    /// Delete a message. For media kinds the blob is removed first; when the
    /// kind requires its blob, a failed blob deletion leaves the message in
    /// place. Afterwards the session's last message pointer is repaired.
    pub async fn delete_message(&self, message: &ChatMessage) -> SyncResult<()> {
        if message.id.is_blank() || message.session_id.is_blank() {
            return Err(SyncError::invalid_argument(
                "message and session ids must not be empty",
            ));
        }
        if self.is_pending_local(&message.session_id).await {
            // Nothing was persisted yet; dropping the echo is the whole delete.
            self.remove_local(&message.id).await;
            return Ok(());
        }
        let required = self.blob_required_for.contains(&message.kind);
        let mut blob_deleted = false;
        let mut blob_error: Option<anyhow::Error> = None;
        if message.kind.is_media() && !message.content.is_empty() {
            match self.blobs.delete(&message.content).await {
                Ok(_) => blob_deleted = true,
                Err(err) if required => {
                    return Err(SyncError::operation_failed(
                        "media blob deletion failed; message retained",
                        err,
                    ));
                }
                Err(err) => {
                    warn!(message_id = %message.id, error = %err, "dispatch: media blob deletion failed; removing the message anyway");
                    blob_error = Some(err);
                }
            }
        }
        if let Err(err) = self
            .store
            .delete(
                &self.paths.messages(message.session_id.as_str()),
                message.id.as_str(),
            )
            .await
        {
            if blob_deleted {
                return Err(SyncError::partial_failure(
                    "media blob deleted",
                    "failed to remove the message document",
                    err,
                ));
            }
            return Err(SyncError::operation_failed(
                "failed to remove the message document",
                err,
            ));
        }
        self.remove_local(&message.id).await;
        self.repair_last_message(&message.session_id, message).await?;
        if let Some(err) = blob_error {
            return Err(SyncError::partial_failure(
                "message removed",
                "media blob could not be deleted",
                err,
            ));
        }
        info!(message_id = %message.id, session_id = %message.session_id, "dispatch: message deleted");
        Ok(())
    }

    /// Recompute the stored last message pointer after a delete. The local
    /// cache answers "was this the most recent" when it holds messages;
    /// otherwise the stored pointer is consulted and a re-scan finds the
    /// replacement.
    async fn repair_last_message(
        &self,
        session_id: &SessionId,
        deleted: &ChatMessage,
    ) -> SyncResult<()> {
        let local: Vec<ChatMessage> = {
            let active = self.session.lock().await;
            match active.as_ref() {
                Some(session) if session.handle.session_id == *session_id => session
                    .view
                    .messages
                    .iter()
                    .filter(|m| m.id != deleted.id)
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            }
        };
        if let Some(newest) = local.iter().max_by_key(|m| m.created_at) {
            if newest.created_at > deleted.created_at {
                return Ok(());
            }
            return self.write_last_message_pointer(session_id, Some(newest)).await;
        }
        let record = match self.load_session_record(session_id).await {
            Ok(record) => record,
            Err(SyncError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(after_removal(err)),
        };
        let pointed_at_deleted = record
            .last_message
            .map(|last| last.message_id == deleted.id)
            .unwrap_or(false);
        if !pointed_at_deleted {
            return Ok(());
        }
        let query = Query::new().order_by(OrderBy::desc("created_at")).limit(1);
        let docs = self
            .store
            .query(&self.paths.messages(session_id.as_str()), query)
            .await
            .map_err(|err| {
                SyncError::partial_failure(
                    "message removed",
                    "failed to re-scan for the previous message",
                    err,
                )
            })?;
        let replacement = match docs.first() {
            Some(doc) => Some(doc.decode::<ChatMessage>().map_err(|err| {
                SyncError::partial_failure(
                    "message removed",
                    "malformed message found during re-scan",
                    err,
                )
            })?),
            None => None,
        };
        self.write_last_message_pointer(session_id, replacement.as_ref())
            .await
    }

    async fn write_last_message_pointer(
        &self,
        session_id: &SessionId,
        message: Option<&ChatMessage>,
    ) -> SyncResult<()> {
        let value = match message {
            Some(message) => serde_json::to_value(LastMessage::from(message)).map_err(|err| {
                SyncError::operation_failed("failed to encode last message pointer", err)
            })?,
            None => Value::Null,
        };
        let fields = BTreeMap::from([("last_message".to_owned(), value)]);
        self.store
            .update(&self.paths.sessions(), session_id.as_str(), fields)
            .await
            .map_err(|err| {
                SyncError::partial_failure(
                    "message removed",
                    "failed to update the last message pointer",
                    err,
                )
            })?;
        Ok(())
    }

    async fn active_target(&self) -> SyncResult<(SessionId, SessionState)> {
        let active = self.session.lock().await;
        match active.as_ref() {
            Some(session) => Ok((session.handle.session_id.clone(), session.handle.state)),
            None => Err(SyncError::invalid_argument("no active session")),
        }
    }

    async fn is_pending_local(&self, session_id: &SessionId) -> bool {
        let active = self.session.lock().await;
        matches!(
            active.as_ref(),
            Some(session)
                if session.handle.session_id == *session_id
                    && session.handle.state == SessionState::Pending
        )
    }
}

fn after_removal(err: SyncError) -> SyncError {
    match err {
        SyncError::OperationFailed { context, source } => SyncError::PartialFailure {
            completed: "message removed".into(),
            context,
            source,
        },
        other => other,
    }
}
