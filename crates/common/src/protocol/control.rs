// JSON control channel carried in text frames.

use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;

/// Editor cursor location reported by a client. Any JSON number is accepted
/// and relayed unchanged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CursorPosition {
    pub line: f64,
    pub column: f64,
}

/// One entry of a `users-update` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
}

/// All control messages, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Client -> Server: the sender moved its cursor.
    CursorPosition { position: CursorPosition },

    /// Client -> Server: application-level keepalive.
    Ping,

    /// Server -> Client: answer to `ping`.
    Pong,

    /// Server -> Client: identity assigned to this connection.
    #[serde(rename_all = "camelCase")]
    UserInfo { user_id: String, user_name: String, color: String },

    /// Server -> Room: every open connection with its last known cursor.
    UsersUpdate { room: String, users: Vec<UserSummary> },

    /// Server -> Room (except sender): a peer moved its cursor.
    #[serde(rename_all = "camelCase")]
    CursorUpdate { user_id: String, user_name: String, color: String, position: CursorPosition },

    /// Any `type` this build does not recognize.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CursorPosition { .. } => "cursor-position",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::UserInfo { .. } => "user-info",
            Self::UsersUpdate { .. } => "users-update",
            Self::CursorUpdate { .. } => "cursor-update",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlDecodeError {
    #[error("control frame is not valid JSON: {0}")]
    Syntax(serde_json::Error),
    #[error("control frame has an invalid shape: {0}")]
    Shape(serde_json::Error),
}

pub fn decode_control(raw: &str) -> Result<ControlMessage, ControlDecodeError> {
    serde_json::from_str::<ControlMessage>(raw).map_err(|err| match err.classify() {
        Category::Data => ControlDecodeError::Shape(err),
        _ => ControlDecodeError::Syntax(err),
    })
}

pub fn encode_control(message: &ControlMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
