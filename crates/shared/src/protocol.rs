use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{GroupId, MessageId, MessageKind, MessageStatus, PresenceStatus, UserId},
    error::ApiError,
};

/// Denormalized copy of the message being replied to, captured at send
/// time so it survives the original being edited or unsent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub id: MessageId,
    pub content: String,
    pub sender_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_display_name: Option<String>,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Outgoing message content as composed by a client, before the server
/// has assigned an id. A draft that references `existing_message_id`
/// announces a row the upload endpoint already persisted instead of
/// creating a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
            existing_message_id: None,
            file_url: None,
            file_name: None,
            file_size: None,
            file_type: None,
            waveform: None,
            duration: None,
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SendMessage {
        client_nonce: String,
        recipient_id: UserId,
        draft: MessageDraft,
    },
    SendGroupMessage {
        client_nonce: String,
        group_id: GroupId,
        draft: MessageDraft,
    },
    MarkDelivered {
        message_id: MessageId,
    },
    MarkRead {
        message_id: MessageId,
    },
    React {
        message_id: MessageId,
        emoji: String,
    },
    Unsend {
        message_id: MessageId,
    },
    JoinGroup {
        group_id: GroupId,
    },
    LeaveGroup {
        group_id: GroupId,
    },
    TypingStart {
        recipient_id: UserId,
    },
    TypingStop {
        recipient_id: UserId,
    },
    GhostTyping {
        recipient_id: UserId,
        text: String,
    },
    AudioRecording {
        recipient_id: UserId,
        is_recording: bool,
    },
    AudioListening {
        message_id: MessageId,
        is_listening: bool,
        #[serde(default)]
        is_ended: bool,
    },
    PresenceUpdate {
        status: PresenceStatus,
    },
    PresenceRequest {
        user_ids: Vec<UserId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessagePayload,
    },
    MessageSent {
        client_nonce: String,
        message: MessagePayload,
    },
    /// Rejection of a specific send, correlated by the same nonce the
    /// acknowledgement would have carried.
    SendFailed {
        client_nonce: String,
        error: ApiError,
    },
    MessageStatus {
        message_id: MessageId,
        status: MessageStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read_at: Option<DateTime<Utc>>,
    },
    MessageReaction {
        message_id: MessageId,
        reactions: Vec<Reaction>,
    },
    MessageUnsent {
        message_id: MessageId,
    },
    GroupMessageReceived {
        message: MessagePayload,
    },
    GroupUserJoined {
        group_id: GroupId,
        user_id: UserId,
    },
    GroupUserLeft {
        group_id: GroupId,
        user_id: UserId,
    },
    TypingStatus {
        user_id: UserId,
        is_typing: bool,
    },
    GhostTyping {
        user_id: UserId,
        text: String,
    },
    AudioRecording {
        user_id: UserId,
        is_recording: bool,
    },
    AudioListening {
        user_id: UserId,
        message_id: MessageId,
        is_listening: bool,
        is_ended: bool,
    },
    AudioWaveform {
        message_id: MessageId,
        waveform: Vec<f32>,
    },
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: DateTime<Utc>,
    },
    PresenceSnapshot {
        entries: Vec<PresenceEntry>,
    },
    PresenceResponse {
        entries: Vec<PresenceEntry>,
    },
    Error(ApiError),
}
