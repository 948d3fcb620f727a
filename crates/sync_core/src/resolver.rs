use chrono::{SubsecRound, Utc};
use shared::domain::{ParticipantRole, SessionId, SessionKind, SessionState, UserId};
use shared::error::{SyncError, SyncResult};
use shared::model::{direct_pair_key, MembershipRecord, SessionRecord, UserProfile};
use store::{Filter, Query};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{ChatSession, SessionHandle};
use crate::{SyncEngine, SyncEvent};

const GROUP_NAME_SEPARATOR: &str = ", ";

#[derive(Debug, Clone)]
pub enum SessionRequest {
    /// Join a known conversation by id.
    ById(SessionId),
    /// One-to-one conversation with a single peer. Reuses the existing room
    /// for the pair when one exists, on either side's initiative.
    Direct { peer: UserId },
    /// Group conversation. A missing `name` defaults to the participants'
    /// display names at creation time.
    Group {
        participants: Vec<UserId>,
        name: Option<String>,
        photo_url: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateMode {
    /// New conversations stay pending until the first send.
    #[default]
    Lazy,
    /// Create the backing record during resolution.
    Immediate,
}

impl SyncEngine {
    /// Decide which conversation the caller is entering and install it as
    /// the active session, replacing (and cancelling) any previous one.
    pub async fn resolve_session(
        &self,
        request: SessionRequest,
        mode: CreateMode,
    ) -> SyncResult<SessionHandle> {
        let handle = match request {
            SessionRequest::ById(session_id) => self.resolve_by_id(&session_id).await?,
            SessionRequest::Direct { peer } => self.resolve_direct(peer).await?,
            SessionRequest::Group {
                participants,
                name,
                photo_url,
            } => self.resolve_group(participants, name, photo_url)?,
        };
        self.install_session(handle.clone()).await;
        if mode == CreateMode::Immediate && handle.state == SessionState::Pending {
            self.materialize_active().await?;
            let active = self.session.lock().await;
            if let Some(session) = active.as_ref() {
                return Ok(session.handle.clone());
            }
        }
        Ok(handle)
    }

    async fn resolve_by_id(&self, session_id: &SessionId) -> SyncResult<SessionHandle> {
        if session_id.is_blank() {
            return Err(SyncError::invalid_argument("session id must not be empty"));
        }
        let record = self.load_session_record(session_id).await?;
        // An outsider cannot tell "exists but not yours" from "does not
        // exist"; both read as not found.
        if record.members.is_empty() || !record.members.contains(&self.current_user) {
            return Err(SyncError::not_found(format!(
                "session '{session_id}' does not exist"
            )));
        }
        debug!(session_id = %record.session_id, kind = ?record.kind, "resolve: joined existing session");
        Ok(handle_from_record(record))
    }

    async fn resolve_direct(&self, peer: UserId) -> SyncResult<SessionHandle> {
        if peer.is_blank() {
            return Err(SyncError::invalid_argument("peer user id must not be empty"));
        }
        if peer == self.current_user {
            return Err(SyncError::invalid_argument(
                "cannot open a one-to-one session with yourself",
            ));
        }
        let pair_key = direct_pair_key(&self.current_user, &peer);
        if let Some(record) = self.find_direct_session(&pair_key).await? {
            debug!(session_id = %record.session_id, "resolve: reusing the existing one-to-one session");
            return Ok(handle_from_record(record));
        }
        debug!(peer = %peer, "resolve: one-to-one session is new; creation deferred");
        Ok(SessionHandle {
            session_id: SessionId::new(Uuid::new_v4().to_string()),
            kind: SessionKind::Direct,
            state: SessionState::Pending,
            participants: vec![self.current_user.clone(), peer],
            name: None,
            photo_url: None,
        })
    }

    fn resolve_group(
        &self,
        participants: Vec<UserId>,
        name: Option<String>,
        photo_url: Option<String>,
    ) -> SyncResult<SessionHandle> {
        if participants.iter().any(UserId::is_blank) {
            return Err(SyncError::invalid_argument(
                "participant ids must not be empty",
            ));
        }
        let mut all = vec![self.current_user.clone()];
        for user in participants {
            if !all.contains(&user) {
                all.push(user);
            }
        }
        if all.len() < 2 {
            return Err(SyncError::invalid_argument(
                "a group needs at least one other participant",
            ));
        }
        Ok(SessionHandle {
            session_id: SessionId::new(Uuid::new_v4().to_string()),
            kind: SessionKind::Group,
            state: SessionState::Pending,
            participants: all,
            name,
            photo_url,
        })
    }

    async fn install_session(&self, handle: SessionHandle) {
        let mut active = self.session.lock().await;
        if let Some(previous) = active.as_mut() {
            if let Some(attachment) = previous.attachment.as_mut() {
                attachment.cancel();
            }
            debug!(
                previous = %previous.handle.session_id,
                next = %handle.session_id,
                "resolve: replacing the active session"
            );
        }
        *active = Some(ChatSession::new(handle));
    }

    /// Create the backing records for the active session if it is still
    /// pending. Returns the materialized id, which differs from the pending
    /// one when an existing one-to-one room is adopted.
    pub(crate) async fn materialize_active(&self) -> SyncResult<SessionId> {
        let handle = {
            let active = self.session.lock().await;
            let session = active
                .as_ref()
                .ok_or_else(|| SyncError::invalid_argument("no active session"))?;
            if session.handle.state == SessionState::Materialized {
                return Ok(session.handle.session_id.clone());
            }
            session.handle.clone()
        };
        let record = match handle.kind {
            SessionKind::Direct => {
                let peer = handle
                    .counterpart(&self.current_user)
                    .cloned()
                    .ok_or_else(|| {
                        SyncError::invalid_argument("one-to-one session has no counterpart")
                    })?;
                let pair_key = direct_pair_key(&self.current_user, &peer);
                // The counterpart may have created the room since resolution.
                if let Some(existing) = self.find_direct_session(&pair_key).await? {
                    debug!(session_id = %existing.session_id, "session: adopting the room created by the counterpart");
                    return self.finish_materialization(&existing).await;
                }
                SessionRecord {
                    session_id: handle.session_id.clone(),
                    kind: SessionKind::Direct,
                    members: handle.participants.clone(),
                    pair_key: Some(pair_key),
                    name: None,
                    photo_url: None,
                    created_by: self.current_user.clone(),
                    created_at: Utc::now().trunc_subsecs(3),
                    last_message: None,
                }
            }
            SessionKind::Group => {
                let name = match handle.name.clone() {
                    Some(name) => name,
                    None => self.default_group_name(&handle.participants).await,
                };
                SessionRecord {
                    session_id: handle.session_id.clone(),
                    kind: SessionKind::Group,
                    members: handle.participants.clone(),
                    pair_key: None,
                    name: Some(name),
                    photo_url: handle.photo_url.clone(),
                    created_by: self.current_user.clone(),
                    created_at: Utc::now().trunc_subsecs(3),
                    last_message: None,
                }
            }
        };
        let payload = serde_json::to_value(&record)
            .map_err(|err| SyncError::operation_failed("failed to encode session record", err))?;
        self.store
            .write(&self.paths.sessions(), record.session_id.as_str(), payload)
            .await
            .map_err(|err| SyncError::operation_failed("failed to create session record", err))?;
        if record.kind == SessionKind::Group {
            self.write_founder_memberships(&record).await?;
        }
        self.finish_materialization(&record).await
    }

    async fn finish_materialization(&self, record: &SessionRecord) -> SyncResult<SessionId> {
        let session_id = record.session_id.clone();
        {
            let mut active = self.session.lock().await;
            let session = active
                .as_mut()
                .ok_or_else(|| SyncError::invalid_argument("no active session"))?;
            if session.handle.state == SessionState::Materialized {
                return Ok(session.handle.session_id.clone());
            }
            session.materialize(session_id.clone())?;
            session.handle.participants = record.members.clone();
            session.handle.name = record.name.clone();
            session.handle.photo_url = record.photo_url.clone();
        }
        info!(session_id = %session_id, kind = ?record.kind, "session: materialized");
        self.emit(SyncEvent::SessionMaterialized {
            session_id: session_id.clone(),
        });
        Ok(session_id)
    }

    async fn find_direct_session(&self, pair_key: &str) -> SyncResult<Option<SessionRecord>> {
        let query = Query::new()
            .filter(Filter::eq("pair_key", pair_key))
            .limit(1);
        let existing = self
            .store
            .query(&self.paths.sessions(), query)
            .await
            .map_err(|err| {
                SyncError::operation_failed("failed to look up the one-to-one session", err)
            })?;
        match existing.first() {
            Some(doc) => doc
                .decode()
                .map(Some)
                .map_err(|err| SyncError::operation_failed("malformed session record", err)),
            None => Ok(None),
        }
    }

    /// The creator becomes the group's admin; every founding member sees the
    /// history from creation.
    async fn write_founder_memberships(&self, record: &SessionRecord) -> SyncResult<()> {
        let collection = self.paths.members(record.session_id.as_str());
        for user in &record.members {
            let role = if *user == record.created_by {
                ParticipantRole::Admin
            } else {
                ParticipantRole::Member
            };
            let membership = MembershipRecord {
                user_id: user.clone(),
                role,
                joined_at: Some(record.created_at),
            };
            let payload = serde_json::to_value(&membership).map_err(|err| {
                SyncError::operation_failed("failed to encode membership record", err)
            })?;
            self.store
                .write(&collection, user.as_str(), payload)
                .await
                .map_err(|err| {
                    SyncError::partial_failure(
                        "session record created",
                        format!("failed to write the membership record for '{user}'"),
                        err,
                    )
                })?;
        }
        Ok(())
    }

    pub(crate) async fn load_session_record(
        &self,
        session_id: &SessionId,
    ) -> SyncResult<SessionRecord> {
        let doc = self
            .store
            .get(&self.paths.sessions(), session_id.as_str())
            .await
            .map_err(|err| SyncError::operation_failed("failed to load session record", err))?;
        match doc {
            Some(doc) => doc
                .decode()
                .map_err(|err| SyncError::operation_failed("malformed session record", err)),
            None => Err(SyncError::not_found(format!(
                "session '{session_id}' does not exist"
            ))),
        }
    }

    async fn default_group_name(&self, participants: &[UserId]) -> String {
        let mut names = Vec::with_capacity(participants.len());
        for user in participants {
            names.push(self.display_name_for(user).await);
        }
        names.join(GROUP_NAME_SEPARATOR)
    }

    async fn display_name_for(&self, user: &UserId) -> String {
        match self.store.get(&self.paths.profiles(), user.as_str()).await {
            Ok(Some(doc)) => match doc.decode::<UserProfile>() {
                Ok(profile) => profile.display_name.unwrap_or_else(|| user.to_string()),
                Err(err) => {
                    warn!(user = %user, error = %err, "resolve: malformed profile; falling back to the id");
                    user.to_string()
                }
            },
            Ok(None) => user.to_string(),
            Err(err) => {
                warn!(user = %user, error = %err, "resolve: profile lookup failed; falling back to the id");
                user.to_string()
            }
        }
    }
}

fn handle_from_record(record: SessionRecord) -> SessionHandle {
    SessionHandle {
        session_id: record.session_id,
        kind: record.kind,
        state: SessionState::Materialized,
        participants: record.members,
        name: record.name,
        photo_url: record.photo_url,
    }
}
