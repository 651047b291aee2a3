// Binary frame dispatch: state reconciliation, update relay, presence.

use std::collections::HashSet;

use tandem_common::protocol::frame::{self, decode_frame, is_empty_update, message_kind, Message, SyncMessage};
use yrs::block::ClientID;

use crate::connection::ConnectionId;
use crate::error::RelayError;
use crate::sync::SharedDoc;

/// Message type tag of `auth` messages, which the relay does not accept.
const MSG_AUTH: u8 = 2;

/// Result of handling one inbound binary frame.
#[derive(Debug, Default, PartialEq)]
pub struct SyncOutcome {
    /// One label per message in the frame, for logs and metrics.
    pub kinds: Vec<&'static str>,
    /// Encoded frames to send straight back to the sender, in order.
    pub replies: Vec<Vec<u8>>,
}

/// Applies every message of one binary frame from connection `id` to `doc`.
///
/// Document updates and presence changes are tagged with the connection's
/// origin, so peers are notified through their own subscriptions and the
/// sender is not. `controlled` tracks the presence clients this connection
/// has introduced. Messages before a failing one stay applied.
pub async fn handle_sync_frame(
    doc: &SharedDoc,
    id: ConnectionId,
    controlled: &mut HashSet<ClientID>,
    payload: &[u8],
) -> Result<SyncOutcome, RelayError> {
    let messages = decode_frame(payload)?;
    let state = doc.lock().await;
    let mut outcome = SyncOutcome::default();

    for message in messages {
        outcome.kinds.push(message_kind(&message));
        match message {
            Message::Sync(SyncMessage::SyncStep1(remote)) => {
                let diff = state.encode_diff(&remote);
                if !is_empty_update(&diff) {
                    outcome.replies.push(frame::state_diff(diff));
                }
            }
            Message::Sync(SyncMessage::SyncStep2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                if !is_empty_update(&update) {
                    state.apply_update(doc.name(), &update, id.origin())?;
                }
            }
            Message::Awareness(update) => {
                if let Some(change) = state.awareness.apply_update_summary_with(update, id.origin())? {
                    controlled.extend(change.added.iter().chain(&change.updated).copied());
                    for client_id in &change.removed {
                        controlled.remove(client_id);
                    }
                }
            }
            Message::AwarenessQuery => {
                if let Some(snapshot) = state.presence_snapshot()? {
                    outcome.replies.push(frame::awareness(snapshot));
                }
            }
            Message::Auth(_) => return Err(RelayError::Unsupported(MSG_AUTH)),
            Message::Custom(tag, _) => return Err(RelayError::Unsupported(tag)),
        }
    }

    Ok(outcome)
}
