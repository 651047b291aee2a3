use tandem_common::protocol::frame::FrameError;
use thiserror::Error;

/// Failures while handling a single connection's traffic.
///
/// None of these are fatal to the process; callers log them against the
/// owning connection and keep serving.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed binary frame: {0}")]
    Frame(#[from] FrameError),

    #[error("awareness update failed: {0}")]
    Awareness(#[from] yrs::sync::awareness::Error),

    #[error("unsupported message type tag {0}")]
    Unsupported(u8),

    #[error("failed to decode document update: {0}")]
    UpdateDecode(#[from] yrs::encoding::read::Error),

    #[error("document rejected update for room {room}")]
    UpdateRejected { room: String },

    #[error("failed to observe document updates for room {room}")]
    Observe { room: String },

    #[error("failed to encode control message: {0}")]
    ControlEncode(#[from] serde_json::Error),

    #[error("websocket send failed: {0}")]
    Send(#[from] axum::Error),
}

impl RelayError {
    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Frame(_) => "frame",
            Self::Awareness(_) => "awareness",
            Self::Unsupported(_) => "unsupported",
            Self::UpdateDecode(_) => "update_decode",
            Self::UpdateRejected { .. } => "update_rejected",
            Self::Observe { .. } => "observe",
            Self::ControlEncode(_) => "control_encode",
            Self::Send(_) => "send",
        }
    }
}
