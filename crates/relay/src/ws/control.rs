// JSON control channel: cursor broadcast, keepalive, room roster.

use tandem_common::protocol::control::{decode_control, ControlMessage};

use crate::connection::{ConnectionHandle, Outbound};
use crate::metrics;
use crate::rooms::BroadcastReport;
use crate::state::RelayState;

/// Handles one text frame from `handle`'s connection in `room`.
///
/// Returns the direct reply for the sender, if any. Malformed frames and
/// unknown message types are logged and dropped.
pub async fn handle_control_frame(
    state: &RelayState,
    room: &str,
    user_id: &str,
    handle: &ConnectionHandle,
    raw: &str,
) -> Option<ControlMessage> {
    let message = match decode_control(raw) {
        Ok(message) => message,
        Err(error) => {
            metrics::record_frame("control", true);
            tracing::warn!(
                connection_id = %handle.id,
                user_id,
                room,
                error = %error,
                "dropping malformed control frame",
            );
            return None;
        }
    };
    metrics::record_frame(message.kind(), false);

    match message {
        ControlMessage::CursorPosition { position } => {
            let Some(member) = state.rooms.set_cursor(room, handle.id, position).await else {
                tracing::debug!(connection_id = %handle.id, room, "cursor from a connection outside the room");
                return None;
            };
            let update = ControlMessage::CursorUpdate {
                user_id: member.user_id,
                user_name: member.identity.name,
                color: member.identity.color,
                position,
            };
            let report = state.rooms.broadcast(room, Outbound::Control(update), Some(handle.id)).await;
            metrics::record_broadcast("cursor", report.delivered);
            None
        }
        ControlMessage::Ping => {
            handle.mark_alive();
            Some(ControlMessage::Pong)
        }
        ControlMessage::Unknown => {
            tracing::info!(connection_id = %handle.id, user_id, room, "ignoring unknown control message type");
            None
        }
        other => {
            tracing::info!(
                connection_id = %handle.id,
                user_id,
                room,
                kind = other.kind(),
                "ignoring server-bound control message sent by client",
            );
            None
        }
    }
}

/// Sends every open member of `room` the current roster.
pub async fn broadcast_users_update(state: &RelayState, room: &str) -> BroadcastReport {
    let users = state.rooms.user_summaries(room).await;
    let message = ControlMessage::UsersUpdate { room: room.to_string(), users };
    let report = state.rooms.broadcast(room, Outbound::Control(message), None).await;
    metrics::record_broadcast("users", report.delivered);
    report
}
