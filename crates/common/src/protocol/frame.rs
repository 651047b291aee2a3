// Binary frames are y-sync messages: `[varint message type][payload]`.
//
// Decoding and encoding are yrs's own (`yrs::sync::Message`); this module adds
// frame-level helpers: batch decoding, the three handshake encoders, empty
// update detection and the labels used in logs and metrics.

use thiserror::Error;
use yrs::encoding::read::Cursor;
use yrs::sync::{AwarenessUpdate, MessageReader};
use yrs::updates::decoder::DecoderV1;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

pub use yrs::sync::protocol::{MSG_AWARENESS, MSG_SYNC, MSG_SYNC_STEP_1, MSG_SYNC_STEP_2, MSG_SYNC_UPDATE};
pub use yrs::sync::{Message, SyncMessage};

/// v1 encoding of an update with no structs and an empty delete set.
pub const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("binary frame carried no complete message")]
    Incomplete,
    #[error("malformed y-sync message: {0}")]
    Malformed(#[from] yrs::encoding::read::Error),
}

/// Decodes every message packed into one binary frame, in order.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<Message>, FrameError> {
    let mut decoder = DecoderV1::new(Cursor::new(bytes));
    let messages = MessageReader::new(&mut decoder).collect::<Result<Vec<_>, _>>()?;
    if messages.is_empty() {
        return Err(FrameError::Incomplete);
    }
    Ok(messages)
}

/// Sync step 1: "send me what I am missing".
pub fn request_state(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Sync step 2: the v1 update answering a request-state.
pub fn state_diff(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
}

pub fn update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

/// Short label used in logs and metrics.
pub fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Sync(SyncMessage::SyncStep1(_)) => "request_state",
        Message::Sync(SyncMessage::SyncStep2(_)) => "state_diff",
        Message::Sync(SyncMessage::Update(_)) => "update",
        Message::Awareness(_) => "awareness",
        Message::AwarenessQuery => "awareness_query",
        Message::Auth(_) => "auth",
        Message::Custom(..) => "custom",
    }
}

/// True when a v1 update carries neither structs nor deletions.
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE_V1.as_slice()
}
