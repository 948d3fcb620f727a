use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use shared::domain::{ParticipantRole, SessionId, SessionKind, SessionState, UserId};
use shared::error::{SyncError, SyncResult};
use shared::model::{ChatMessage, MembershipRecord, SessionRecord};
use store::Query;
use tracing::{info, warn};

use crate::SyncEngine;

impl SyncEngine {
    /// Earliest-visible-message boundary for a group participant. `None`
    /// means full history; a missing or unreadable membership record also
    /// resolves to full visibility rather than hiding every message.
    pub(crate) async fn join_boundary(
        &self,
        session_id: &SessionId,
        user: &UserId,
    ) -> Option<DateTime<Utc>> {
        let collection = self.paths.members(session_id.as_str());
        match self.store.get(&collection, user.as_str()).await {
            Ok(Some(doc)) => match doc.decode::<MembershipRecord>() {
                Ok(record) => record.joined_at,
                Err(err) => {
                    warn!(session_id = %session_id, user = %user, error = %err, "membership: malformed record; showing full history");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(session_id = %session_id, user = %user, error = %err, "membership: lookup failed; showing full history");
                None
            }
        }
    }

    /// Add a participant to the active group. With `include_history` the new
    /// member sees messages from `since` (or the full history when `since`
    /// is `None`); without it, only messages from now on.
    ///
    /// The activity stream keys off the participant set captured at attach
    /// time; re-attach to start following the new member.
    pub async fn add_participant(
        &self,
        user: UserId,
        role: ParticipantRole,
        include_history: bool,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        if user.is_blank() {
            return Err(SyncError::invalid_argument(
                "participant user id must not be empty",
            ));
        }
        let session_id = self.require_materialized_group().await?;
        let joined_at = if include_history {
            since
        } else {
            Some(Utc::now().trunc_subsecs(3))
        };
        let membership = MembershipRecord {
            user_id: user.clone(),
            role,
            joined_at,
        };
        let payload = serde_json::to_value(&membership)
            .map_err(|err| SyncError::operation_failed("failed to encode membership record", err))?;
        self.store
            .write(
                &self.paths.members(session_id.as_str()),
                user.as_str(),
                payload,
            )
            .await
            .map_err(|err| {
                SyncError::operation_failed("failed to write membership record", err)
            })?;
        if let Err(err) = self.append_member(&session_id, &user).await {
            return Err(SyncError::partial_failure(
                "membership record written",
                "failed to update the session member list",
                err,
            ));
        }
        {
            let mut active = self.session.lock().await;
            if let Some(session) = active.as_mut() {
                if session.handle.session_id == session_id
                    && !session.handle.participants.contains(&user)
                {
                    session.handle.participants.push(user.clone());
                }
            }
        }
        info!(session_id = %session_id, user = %user, role = ?role, "membership: participant added");
        Ok(())
    }

    /// Remove another participant from the active group. The current user
    /// leaves through [`SyncEngine::leave`] instead.
    pub async fn remove_participant(&self, user: UserId) -> SyncResult<()> {
        if user.is_blank() {
            return Err(SyncError::invalid_argument(
                "participant user id must not be empty",
            ));
        }
        if user == self.current_user {
            return Err(SyncError::invalid_argument(
                "removing yourself is a leave, not a removal",
            ));
        }
        let session_id = self.require_materialized_group().await?;
        self.store
            .delete(&self.paths.members(session_id.as_str()), user.as_str())
            .await
            .map_err(|err| {
                SyncError::operation_failed("failed to delete membership record", err)
            })?;
        if let Err(err) = self.drop_member(&session_id, &user).await {
            return Err(SyncError::partial_failure(
                "membership record deleted",
                "failed to update the session member list",
                err,
            ));
        }
        {
            let mut active = self.session.lock().await;
            if let Some(session) = active.as_mut() {
                if session.handle.session_id == session_id {
                    session.handle.participants.retain(|p| *p != user);
                }
            }
        }
        info!(session_id = %session_id, user = %user, "membership: participant removed");
        Ok(())
    }

    /// Leave the active group. The last member to leave deletes the session
    /// together with its messages, memberships and media blobs. The local
    /// session is disposed either way.
    pub async fn leave(&self) -> SyncResult<()> {
        let session_id = self.require_materialized_group().await?;
        self.store
            .delete(
                &self.paths.members(session_id.as_str()),
                self.current_user.as_str(),
            )
            .await
            .map_err(|err| {
                SyncError::operation_failed("failed to delete own membership record", err)
            })?;
        let result = self.finish_leave(&session_id).await;
        {
            let mut active = self.session.lock().await;
            let matches = active
                .as_ref()
                .map(|session| session.handle.session_id == session_id)
                .unwrap_or(false);
            if matches {
                if let Some(mut session) = active.take() {
                    if let Some(attachment) = session.attachment.as_mut() {
                        attachment.cancel();
                    }
                }
            }
        }
        result
    }

    async fn finish_leave(&self, session_id: &SessionId) -> SyncResult<()> {
        let record = match self.load_session_record(session_id).await {
            Ok(record) => record,
            // Already torn down by a concurrent leave.
            Err(SyncError::NotFound(_)) => return Ok(()),
            Err(SyncError::OperationFailed { context, source }) => {
                return Err(SyncError::PartialFailure {
                    completed: "own membership deleted".into(),
                    context,
                    source,
                })
            }
            Err(err) => return Err(err),
        };
        let remaining: Vec<UserId> = record
            .members
            .iter()
            .filter(|member| **member != self.current_user)
            .cloned()
            .collect();
        if remaining.is_empty() {
            self.purge_session(session_id).await?;
            info!(session_id = %session_id, "membership: last participant left; session purged");
        } else {
            let fields = BTreeMap::from([(
                "members".to_owned(),
                serde_json::to_value(&remaining).map_err(|err| {
                    SyncError::operation_failed("failed to encode member list", err)
                })?,
            )]);
            self.store
                .update(&self.paths.sessions(), session_id.as_str(), fields)
                .await
                .map_err(|err| {
                    SyncError::partial_failure(
                        "own membership deleted",
                        "failed to update the session member list",
                        err,
                    )
                })?;
            info!(session_id = %session_id, "membership: left session");
        }
        Ok(())
    }

    /// Full teardown once the group is empty: messages (and their blobs),
    /// membership records, then the session record. Blob failures are
    /// collected rather than aborting the teardown.
    async fn purge_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let messages_collection = self.paths.messages(session_id.as_str());
        let docs = self
            .store
            .query(&messages_collection, Query::new())
            .await
            .map_err(|err| {
                SyncError::partial_failure(
                    "own membership deleted",
                    "failed to list messages for removal",
                    err,
                )
            })?;
        let mut failed_blobs = 0usize;
        let mut first_blob_error: Option<anyhow::Error> = None;
        for doc in &docs {
            match doc.decode::<ChatMessage>() {
                Ok(message) => {
                    if message.kind.is_media() && !message.content.is_empty() {
                        if let Err(err) = self.blobs.delete(&message.content).await {
                            warn!(message_id = %message.id, error = %err, "membership: media blob deletion failed during purge");
                            failed_blobs += 1;
                            if first_blob_error.is_none() {
                                first_blob_error = Some(err);
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(document = %doc.id, error = %err, "membership: skipping a malformed message during purge");
                }
            }
            self.store
                .delete(&messages_collection, &doc.id)
                .await
                .map_err(|err| {
                    SyncError::partial_failure(
                        "some messages removed",
                        "failed to remove all session messages",
                        err,
                    )
                })?;
        }
        let members_collection = self.paths.members(session_id.as_str());
        let member_docs = self
            .store
            .query(&members_collection, Query::new())
            .await
            .map_err(|err| {
                SyncError::partial_failure(
                    "messages removed",
                    "failed to list remaining membership records",
                    err,
                )
            })?;
        for doc in member_docs {
            self.store
                .delete(&members_collection, &doc.id)
                .await
                .map_err(|err| {
                    SyncError::partial_failure(
                        "messages removed",
                        "failed to remove membership records",
                        err,
                    )
                })?;
        }
        self.store
            .delete(&self.paths.sessions(), session_id.as_str())
            .await
            .map_err(|err| {
                SyncError::partial_failure(
                    "messages and memberships removed",
                    "failed to delete the session record",
                    err,
                )
            })?;
        if let Some(err) = first_blob_error {
            return Err(SyncError::partial_failure(
                "session deleted",
                format!("{failed_blobs} media blob(s) could not be deleted"),
                err,
            ));
        }
        Ok(())
    }

    async fn append_member(&self, session_id: &SessionId, user: &UserId) -> anyhow::Result<()> {
        let doc = self
            .store
            .get(&self.paths.sessions(), session_id.as_str())
            .await?;
        let doc = doc.ok_or_else(|| anyhow::anyhow!("session record missing"))?;
        let record: SessionRecord = doc.decode()?;
        if !record.members.contains(user) {
            let mut members = record.members;
            members.push(user.clone());
            let fields = BTreeMap::from([("members".to_owned(), serde_json::to_value(&members)?)]);
            self.store
                .update(&self.paths.sessions(), session_id.as_str(), fields)
                .await?;
        }
        Ok(())
    }

    async fn drop_member(&self, session_id: &SessionId, user: &UserId) -> anyhow::Result<()> {
        let doc = self
            .store
            .get(&self.paths.sessions(), session_id.as_str())
            .await?;
        let doc = match doc {
            Some(doc) => doc,
            None => return Ok(()),
        };
        let record: SessionRecord = doc.decode()?;
        let members: Vec<UserId> = record
            .members
            .into_iter()
            .filter(|member| member != user)
            .collect();
        let fields = BTreeMap::from([("members".to_owned(), serde_json::to_value(&members)?)]);
        self.store
            .update(&self.paths.sessions(), session_id.as_str(), fields)
            .await?;
        Ok(())
    }

    async fn require_materialized_group(&self) -> SyncResult<SessionId> {
        let active = self.session.lock().await;
        match active.as_ref() {
            None => Err(SyncError::invalid_argument("no active session")),
            Some(session) if session.handle.kind != SessionKind::Group => Err(
                SyncError::invalid_argument("participant management applies to group sessions only"),
            ),
            Some(session) if session.handle.state != SessionState::Materialized => Err(
                SyncError::invalid_argument("session has not been materialized yet"),
            ),
            Some(session) => Ok(session.handle.session_id.clone()),
        }
    }
}
