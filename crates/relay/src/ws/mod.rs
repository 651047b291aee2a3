pub mod control;
pub mod session;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tandem_common::protocol::control::encode_control;

use crate::config::RelayConfig;
use crate::connection::Outbound;
use crate::error::RelayError;
use crate::identity::generate_user_id;
use crate::metrics;
use crate::state::RelayState;
use control::{broadcast_users_update, handle_control_frame};
use session::Session;

/// Consecutive socket read errors tolerated before the socket is treated as
/// gone.
const MAX_CONSECUTIVE_SOCKET_ERRORS: u32 = 3;
const SHUTDOWN_CLOSE_REASON: &str = "server shutting down";

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub room: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

pub fn router() -> Router<Arc<RelayState>> {
    Router::new().route("/", get(ws_root)).route("/{*path}", get(ws_path))
}

async fn ws_root(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    upgrade(ws, params, None, state)
}

async fn ws_path(
    ws: WebSocketUpgrade,
    Path(path): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    upgrade(ws, params, Some(path), state)
}

fn upgrade(
    ws: WebSocketUpgrade,
    params: ConnectParams,
    path: Option<String>,
    state: Arc<RelayState>,
) -> impl IntoResponse {
    let room = resolve_room(params.room.as_deref(), path.as_deref(), &state.config);
    let user_id = params
        .user_id
        .filter(|user_id| !user_id.trim().is_empty())
        .unwrap_or_else(generate_user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, room, user_id))
}

/// Room named by the `room` parameter, else (when enabled) the URL path,
/// else the configured default.
pub fn resolve_room(query_room: Option<&str>, path: Option<&str>, config: &RelayConfig) -> String {
    if let Some(room) = query_room.map(str::trim).filter(|room| !room.is_empty()) {
        return room.to_string();
    }
    if config.room_from_path {
        if let Some(room) = path.map(|path| path.trim_matches('/')).filter(|room| !room.is_empty()) {
            return room.to_string();
        }
    }
    config.default_room.clone()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<RelayState>, room: String, user_id: String) {
    let (mut session, mut outbound) = match Session::open(&state, room.clone(), user_id.clone()).await {
        Ok(opened) => opened,
        Err(error) => {
            tracing::error!(room = %room, user_id = %user_id, error = %error, "failed to open session");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    metrics::record_connection_opened();
    tracing::info!(
        connection_id = %session.id,
        user_id = %session.user_id,
        room = %session.room,
        "connection opened",
    );

    schedule_users_update(Arc::clone(&state), session.room.clone(), state.config.users_update_delay);

    let mut consecutive_errors = 0u32;
    'connection: loop {
        tokio::select! {
            maybe_outbound = outbound.recv() => {
                match maybe_outbound {
                    Some(Outbound::Terminate) => {
                        tracing::warn!(
                            connection_id = %session.id,
                            user_id = %session.user_id,
                            "heartbeat missed, terminating connection",
                        );
                        break;
                    }
                    Some(Outbound::Close) => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: SHUTDOWN_CLOSE_REASON.into(),
                            })))
                            .await;
                        break;
                    }
                    Some(item) => {
                        if let Err(error) = send_outbound(&mut socket, item).await {
                            tracing::warn!(
                                connection_id = %session.id,
                                user_id = %session.user_id,
                                error = %error,
                                "failed to send to socket",
                            );
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Binary(payload)) => {
                        consecutive_errors = 0;
                        match session.handle_binary(&payload).await {
                            Ok(outcome) => {
                                for kind in &outcome.kinds {
                                    metrics::record_frame(kind, false);
                                }
                                tracing::debug!(connection_id = %session.id, kinds = ?outcome.kinds, "binary frame handled");
                                for reply in outcome.replies {
                                    if socket.send(Message::Binary(reply.into())).await.is_err() {
                                        break 'connection;
                                    }
                                }
                            }
                            Err(error) => {
                                metrics::record_frame(error.kind(), true);
                                tracing::warn!(
                                    connection_id = %session.id,
                                    user_id = %session.user_id,
                                    room = %session.room,
                                    error = %error,
                                    "dropping binary frame",
                                );
                            }
                        }
                    }
                    Ok(Message::Text(raw)) => {
                        consecutive_errors = 0;
                        let reply = handle_control_frame(
                            &state,
                            &session.room,
                            &session.user_id,
                            &session.handle,
                            raw.as_str(),
                        )
                        .await;
                        if let Some(reply) = reply {
                            if let Err(error) = send_outbound(&mut socket, Outbound::Control(reply)).await {
                                tracing::warn!(connection_id = %session.id, error = %error, "failed to send reply");
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        consecutive_errors = 0;
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        consecutive_errors = 0;
                        session.handle.mark_alive();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        consecutive_errors += 1;
                        tracing::warn!(
                            connection_id = %session.id,
                            user_id = %session.user_id,
                            error = %error,
                            "websocket error",
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_SOCKET_ERRORS {
                            break;
                        }
                    }
                }
            }
        }
    }

    let id = session.id;
    let user_id = session.user_id.clone();
    let room = session.room.clone();
    session.close(&state).await;
    metrics::record_connection_closed();
    tracing::info!(connection_id = %id, user_id = %user_id, room = %room, "connection closed");
}

async fn send_outbound(socket: &mut WebSocket, item: Outbound) -> Result<(), RelayError> {
    let message = match item {
        Outbound::Binary(bytes) => Message::Binary(bytes.into()),
        Outbound::Control(control) => Message::Text(encode_control(&control)?.into()),
        Outbound::Ping => Message::Ping(Vec::new().into()),
        Outbound::Close => Message::Close(None),
        Outbound::Terminate => return Ok(()),
    };
    socket.send(message).await?;
    Ok(())
}

/// Roster broadcast after a join, delayed so the new socket's opening frames
/// go out first.
fn schedule_users_update(state: Arc<RelayState>, room: String, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        broadcast_users_update(&state, &room).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_room_wins() {
        let config = RelayConfig { room_from_path: true, ..RelayConfig::default() };
        assert_eq!(resolve_room(Some("doc1"), Some("other"), &config), "doc1");
    }

    #[test]
    fn path_is_used_only_when_enabled() {
        let by_path = RelayConfig { room_from_path: true, ..RelayConfig::default() };
        assert_eq!(resolve_room(None, Some("notes/today/"), &by_path), "notes/today");

        let fixed = RelayConfig::default();
        assert_eq!(resolve_room(None, Some("notes"), &fixed), "default");
    }

    #[test]
    fn blank_values_fall_back_to_default_room() {
        let config = RelayConfig {
            room_from_path: true,
            default_room: "lobby".to_string(),
            ..RelayConfig::default()
        };
        assert_eq!(resolve_room(Some("  "), Some("/"), &config), "lobby");
        assert_eq!(resolve_room(None, None, &config), "lobby");
    }

    #[test]
    fn connect_params_use_camel_case_user_id() {
        let params: ConnectParams =
            serde_json::from_value(serde_json::json!({ "room": "doc1", "userId": "alice" }))
                .expect("params should deserialize");
        assert_eq!(params.room.as_deref(), Some("doc1"));
        assert_eq!(params.user_id.as_deref(), Some("alice"));
    }
}
