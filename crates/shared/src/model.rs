use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    DeliveryStatus, MessageId, MessageKind, OnlineStatus, ParticipantRole, SessionId, SessionKind,
    TypingStatus, UserId,
};

/// Timestamps are stored as integer epoch milliseconds so that range filters
/// and ordering work on plain numeric comparison in every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<UserId, String>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantActivity {
    pub user_id: UserId,
    #[serde(default)]
    pub online_status: OnlineStatus,
    #[serde(default)]
    pub typing_status: TypingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl ParticipantActivity {
    pub fn offline(user_id: UserId) -> Self {
        Self {
            user_id,
            online_status: OnlineStatus::Offline,
            typing_status: TypingStatus::Typed,
            display_name: None,
            photo_url: None,
        }
    }
}

/// Display identity of a conversation. For groups this mirrors the session
/// record; for one-to-one sessions it is derived from the counterpart's
/// profile and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl From<&UserProfile> for RoomMetadata {
    fn from(profile: &UserProfile) -> Self {
        Self {
            display_name: profile.display_name.clone(),
            photo_url: profile.photo_url.clone(),
        }
    }
}

/// Group-only join record. A missing `joined_at` means the member sees the
/// full history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub user_id: UserId,
    pub role: ParticipantRole,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub message_id: MessageId,
    pub sender: UserId,
    pub kind: MessageKind,
    pub preview: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl From<&ChatMessage> for LastMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            sender: message.sender.clone(),
            kind: message.kind,
            preview: message.content.clone(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub members: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub created_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
}

/// Order-independent identity of a one-to-one conversation. Exactly one
/// session may exist per pair, whichever side creates it first.
pub fn direct_pair_key(a: &UserId, b: &UserId) -> String {
    if a.as_str() <= b.as_str() {
        format!("{a}::{b}")
    } else {
        format!("{b}::{a}")
    }
}
