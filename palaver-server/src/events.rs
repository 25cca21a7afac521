//! Wire protocol: JSON events exchanged with clients.
//!
//! One JSON object per WebSocket text frame, discriminated by a `type` tag.
//! Event names and field spellings match what the web client consumes
//! (snake_case types, camelCase fields).

use serde::{Deserialize, Serialize};

use crate::db::MessageRow;

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Free text or a `/command args` line.
    Message {
        content: String,
        #[serde(default)]
        channel: Option<String>,
        /// Client-supplied idempotency key for retry-safe sends.
        #[serde(default)]
        dedup_token: Option<String>,
    },
    /// Claim a new nickname.
    Nick { name: String },
    /// Reconnect under an existing nickname.
    CheckNickname { name: String },
    CreateChannel { name: String },
    ListChannels {
        #[serde(default)]
        keyword: Option<String>,
    },
    JoinChannel { name: String },
    QuitChannel { name: String },
    DeleteChannel { name: String },
    RenameChannel { old_name: String, new_name: String },
    /// List a channel's users (defaults to the default channel).
    Users {
        #[serde(default)]
        channel: Option<String>,
    },
    /// Pull a channel's history; with `afterId`, only messages strictly
    /// after that cursor (reconnect catch-up).
    Messages {
        channel: String,
        #[serde(default)]
        after_id: Option<i64>,
    },
    PrivateMessage {
        to: String,
        content: String,
        #[serde(default)]
        dedup_token: Option<String>,
    },
}

/// Events the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    NewMessage {
        id: i64,
        content: String,
        nickname: String,
        channel: String,
        created_at: i64,
    },
    PrivateMessage {
        id: i64,
        content: String,
        from: String,
        to: String,
        channel: String,
        created_at: i64,
    },
    /// History replay, oldest first.
    ChannelMessages {
        channel: String,
        messages: Vec<WireMessage>,
    },
    ChannelsList { channels: Vec<String> },
    UsersList {
        channel: String,
        users: Vec<UserEntry>,
    },
    UserJoined { nickname: String, channel: String },
    UserLeft { nickname: String, channel: String },
    ChannelCreated { name: String },
    ChannelDeleted { name: String },
    ChannelRenamed { old_name: String, new_name: String },
    NickSuccess { nickname: String },
    CheckNicknameSuccess {
        nickname: String,
        channels: Vec<String>,
        current_channel: Option<String>,
    },
    Error { message: String },
}

/// A stored message as serialized on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: i64,
    pub channel: String,
    pub nickname: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub created_at: i64,
}

impl From<MessageRow> for WireMessage {
    fn from(row: MessageRow) -> Self {
        WireMessage {
            id: row.id,
            channel: row.channel,
            nickname: row.sender,
            content: row.content,
            recipient: row.recipient,
            created_at: row.created_at,
        }
    }
}

/// A `users_list` entry: persisted member plus live-connection status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub nickname: String,
    pub is_connected: bool,
}
