use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use shared::domain::{OnlineStatus, TypingStatus};
use shared::error::{SyncError, SyncResult};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::SyncEngine;

/// Last statuses written for the current user, so redundant writes are
/// skipped. Counterpart typing is read from the activity stream; these
/// setters only publish the local user's state.
#[derive(Default)]
pub(crate) struct PresenceTracker {
    last: Mutex<PresenceSnapshot>,
}

#[derive(Default, Clone, Copy)]
struct PresenceSnapshot {
    online: Option<OnlineStatus>,
    typing: Option<TypingStatus>,
}

impl PresenceTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl SyncEngine {
    pub async fn set_online(&self, status: OnlineStatus) -> SyncResult<()> {
        {
            let last = self.presence.last.lock().await;
            if last.online == Some(status) {
                trace!(status = ?status, "presence: online status unchanged");
                return Ok(());
            }
        }
        self.write_own_activity("online_status", encode_status(&status)?)
            .await?;
        self.presence.last.lock().await.online = Some(status);
        Ok(())
    }

    /// Publish the current user's typing state. Reported manually by the
    /// caller; a successful send resets it.
    pub async fn set_typing(&self, status: TypingStatus) -> SyncResult<()> {
        {
            let last = self.presence.last.lock().await;
            if last.typing == Some(status) {
                trace!(status = ?status, "presence: typing status unchanged");
                return Ok(());
            }
        }
        self.write_own_activity("typing_status", encode_status(&status)?)
            .await?;
        self.presence.last.lock().await.typing = Some(status);
        Ok(())
    }

    pub(crate) async fn reset_typing_after_send(&self) {
        let should_reset =
            { self.presence.last.lock().await.typing == Some(TypingStatus::Typing) };
        if should_reset {
            if let Err(err) = self.set_typing(TypingStatus::Typed).await {
                warn!(error = %err, "presence: failed to reset typing after send");
            }
        }
    }

    /// Merge into the activity document rather than replacing it, so the
    /// two statuses (and any profile denormalization) never clobber each
    /// other.
    async fn write_own_activity(&self, field: &str, value: Value) -> SyncResult<()> {
        let fields = BTreeMap::from([
            (
                "user_id".to_owned(),
                Value::from(self.current_user.as_str()),
            ),
            (field.to_owned(), value),
        ]);
        self.store
            .update(&self.paths.activity(), self.current_user.as_str(), fields)
            .await
            .map_err(|err| {
                SyncError::operation_failed("failed to update own activity record", err)
            })?;
        Ok(())
    }
}

fn encode_status<T: Serialize>(status: &T) -> SyncResult<Value> {
    serde_json::to_value(status)
        .map_err(|err| SyncError::operation_failed("failed to encode status", err))
}
