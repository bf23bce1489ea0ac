use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CorrelationToken, MessageId, MessageKind, NotificationCategory, NotificationId, UserId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<CorrelationToken>,
}

impl MessageRecord {
    /// The other participant of the conversation, seen from `viewer`.
    pub fn peer_of(&self, viewer: UserId) -> UserId {
        if self.sender_id == viewer {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub body: String,
    pub client_token: CorrelationToken,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConversationPageQuery {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkDeliveredRequest {
    pub peer_id: UserId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub category: NotificationCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub category: NotificationCategory,
    pub unread: i64,
}

/// Authoritative unread counts. The server reports signed integers; consumers
/// clamp at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub unread_messages: i64,
    pub unread_likes: i64,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Match,
    Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSummary {
    pub notification_id: NotificationId,
    pub kind: NotificationKind,
    pub actor_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub peer_id: UserId,
    pub peer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub photo_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

/// Inbound realtime frame as delivered by the push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Outbound control frame sent over the push transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlFrame {
    Join { topic: String },
    Leave { topic: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePushed {
    pub message: MessageRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikePushed {
    pub event_id: String,
    pub from_user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPushed {
    pub event_id: String,
    pub peer_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesReadPushed {
    pub reader_id: UserId,
    pub up_to: MessageId,
}
