// One connection's stake in a room: membership, document subscriptions and
// the presence clients it controls.

use std::collections::HashSet;
use std::sync::Arc;

use tandem_common::protocol::control::ControlMessage;
use tandem_common::protocol::frame;
use tokio::sync::mpsc::UnboundedReceiver;
use yrs::block::ClientID;

use crate::connection::{ConnectionHandle, ConnectionId, Outbound};
use crate::error::RelayError;
use crate::identity::Identity;
use crate::metrics;
use crate::rooms::Member;
use crate::state::RelayState;
use crate::sync::SharedDoc;
use crate::ws::control::broadcast_users_update;
use crate::ws::sync::{handle_sync_frame, SyncOutcome};

/// Observers forwarding document and presence changes to this connection.
/// Dropping them detaches both.
struct Subscriptions {
    _document: yrs::Subscription,
    _presence: yrs::Subscription,
}

pub struct Session {
    pub id: ConnectionId,
    pub user_id: String,
    pub room: String,
    pub identity: Identity,
    pub handle: ConnectionHandle,
    doc: Arc<SharedDoc>,
    controlled: HashSet<ClientID>,
    subscriptions: Option<Subscriptions>,
}

impl Session {
    /// Resolves the room's document, subscribes to it, joins the room and
    /// queues the opening frames: a state request, a presence snapshot when
    /// one exists, and the assigned identity.
    pub async fn open(
        state: &RelayState,
        room: String,
        user_id: String,
    ) -> Result<(Self, UnboundedReceiver<Outbound>), RelayError> {
        let id = state.next_connection_id();
        let identity = state.identities.identify(&user_id);
        let (handle, outbound) = ConnectionHandle::new(id);
        let doc = state.docs.resolve(&room).await;

        let subscriptions = match subscribe(&doc, &handle).await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                state.docs.release(&room).await;
                return Err(error);
            }
        };

        state
            .rooms
            .join(
                &room,
                Member {
                    user_id: user_id.clone(),
                    identity: identity.clone(),
                    handle: handle.clone(),
                    cursor: None,
                },
            )
            .await;

        {
            let doc_state = doc.lock().await;
            queue_opening(&handle, "request_state", Outbound::Binary(frame::request_state(doc_state.state_vector())));
            match doc_state.presence_snapshot() {
                Ok(Some(snapshot)) => {
                    queue_opening(&handle, "presence_snapshot", Outbound::Binary(frame::awareness(snapshot)));
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(connection_id = %id, room = %room, error = %error, "failed to encode presence snapshot");
                }
            }
        }
        queue_opening(
            &handle,
            "user_info",
            Outbound::Control(ControlMessage::UserInfo {
                user_id: user_id.clone(),
                user_name: identity.name.clone(),
                color: identity.color.clone(),
            }),
        );

        let session = Self {
            id,
            user_id,
            room,
            identity,
            handle,
            doc,
            controlled: HashSet::new(),
            subscriptions: Some(subscriptions),
        };
        Ok((session, outbound))
    }

    pub async fn handle_binary(&mut self, payload: &[u8]) -> Result<SyncOutcome, RelayError> {
        handle_sync_frame(&self.doc, self.id, &mut self.controlled, payload).await
    }

    pub fn controlled_clients(&self) -> &HashSet<ClientID> {
        &self.controlled
    }

    /// Detaches the connection: stops delivery, leaves the room, clears the
    /// presence it controlled, releases the document and tells the remaining
    /// members who is left.
    pub async fn close(mut self, state: &RelayState) {
        self.handle.mark_closed();
        self.subscriptions = None;

        state.rooms.leave(&self.room, self.id).await;

        if !self.controlled.is_empty() {
            let cleared = self.doc.lock().await.clear_presence(self.controlled.drain());
            if !cleared.is_empty() {
                tracing::debug!(
                    connection_id = %self.id,
                    room = %self.room,
                    clients = ?cleared,
                    "cleared presence for closed connection",
                );
            }
        }

        state.docs.release(&self.room).await;
        broadcast_users_update(state, &self.room).await;
    }
}

async fn subscribe(doc: &SharedDoc, handle: &ConnectionHandle) -> Result<Subscriptions, RelayError> {
    let own_origin = handle.id.origin();
    let peer = handle.clone();
    let document = doc
        .observe_updates(move |txn, update| {
            if txn.origin() == Some(&own_origin) || !peer.is_open() {
                return;
            }
            deliver(&peer, "document", frame::update(update.to_vec()));
        })
        .await?;

    let own_origin = handle.id.origin();
    let peer = handle.clone();
    let presence = doc
        .observe_presence(move |awareness, event, origin| {
            if origin == Some(&own_origin) || !peer.is_open() {
                return;
            }
            match awareness.update_with_clients(event.all_changes()) {
                Ok(update) => deliver(&peer, "awareness", frame::awareness(update)),
                Err(error) => {
                    tracing::warn!(connection_id = %peer.id, error = %error, "failed to encode presence change");
                }
            }
        })
        .await;

    Ok(Subscriptions { _document: document, _presence: presence })
}

/// Queues one of the frames a connection receives on open. The receiver is
/// still held by the caller, so a failure here means the session is unusable.
fn queue_opening(handle: &ConnectionHandle, frame: &'static str, item: Outbound) {
    if handle.send(item).is_err() {
        tracing::warn!(connection_id = %handle.id, frame, "failed to queue opening frame");
    }
}

fn deliver(peer: &ConnectionHandle, channel: &str, frame: Vec<u8>) {
    match peer.send(Outbound::Binary(frame)) {
        Ok(()) => metrics::record_broadcast(channel, 1),
        Err(_) => {
            metrics::increment_broadcast_send_failures();
            tracing::warn!(connection_id = %peer.id, channel, "failed to queue broadcast for peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use std::collections::HashMap;
    use tandem_common::protocol::frame::{decode_frame, message_kind, Message, SyncMessage};
    use yrs::sync::awareness::AwarenessUpdateEntry;
    use yrs::sync::AwarenessUpdate;
    use yrs::{Doc, ReadTxn, StateVector, Text, Transact};

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn update_frame(client_id: u64, content: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(client_id);
        let text = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            text.push(&mut txn, content);
        }
        let update = doc.transact().encode_diff_v1(&StateVector::default());
        frame::update(update)
    }

    fn presence_frame(client_id: ClientID, clock: u32, json: &str) -> Vec<u8> {
        let mut clients = HashMap::new();
        clients.insert(client_id, AwarenessUpdateEntry { clock, json: json.into() });
        frame::awareness(AwarenessUpdate { clients })
    }

    fn bold_seal(client_id: ClientID) -> Vec<u8> {
        presence_frame(client_id, 1, r#"{"user":{"name":"Bold Seal"}}"#)
    }

    /// The single presence update carried by a queued binary frame.
    fn presence_of(item: &Outbound) -> AwarenessUpdate {
        let Outbound::Binary(bytes) = item else { panic!("expected a binary frame") };
        let mut messages = decode_frame(bytes).expect("frame decodes");
        assert_eq!(messages.len(), 1);
        let Some(Message::Awareness(update)) = messages.pop() else { panic!("expected an awareness frame") };
        update
    }

    async fn open_pair(state: &RelayState) -> ((Session, UnboundedReceiver<Outbound>), (Session, UnboundedReceiver<Outbound>)) {
        let (alice, mut alice_rx) =
            Session::open(state, "doc1".to_string(), "alice".to_string()).await.expect("alice opens");
        let (bob, mut bob_rx) = Session::open(state, "doc1".to_string(), "bob".to_string()).await.expect("bob opens");
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        ((alice, alice_rx), (bob, bob_rx))
    }

    #[tokio::test]
    async fn open_queues_state_request_then_user_info() {
        let state = RelayState::new(RelayConfig::default());
        let (session, mut rx) =
            Session::open(&state, "doc1".to_string(), "alice".to_string()).await.expect("session opens");

        let items = drain(&mut rx);
        assert_eq!(items.len(), 2);
        let Outbound::Binary(first) = &items[0] else { panic!("first item should be binary") };
        assert!(matches!(
            decode_frame(first).expect("frame decodes").as_slice(),
            [Message::Sync(SyncMessage::SyncStep1(_))]
        ));
        assert_eq!(
            items[1],
            Outbound::Control(ControlMessage::UserInfo {
                user_id: "alice".to_string(),
                user_name: session.identity.name.clone(),
                color: session.identity.color.clone(),
            })
        );
        assert_eq!(state.rooms.connection_count().await, 1);
        assert_eq!(state.docs.holders("doc1").await, Some(1));
    }

    #[tokio::test]
    async fn open_includes_presence_snapshot_when_present() {
        let state = RelayState::new(RelayConfig::default());
        let (mut alice, _alice_rx) =
            Session::open(&state, "doc1".to_string(), "alice".to_string()).await.expect("alice opens");
        alice.handle_binary(&bold_seal(77)).await.expect("presence applies");

        let (_bob, mut bob_rx) =
            Session::open(&state, "doc1".to_string(), "bob".to_string()).await.expect("bob opens");
        let items = drain(&mut bob_rx);
        assert_eq!(items.len(), 3);
        let snapshot = presence_of(&items[1]);
        assert_eq!(snapshot.clients.keys().copied().collect::<Vec<_>>(), vec![77]);
    }

    #[tokio::test]
    async fn updates_reach_peers_but_not_their_origin() {
        let state = RelayState::new(RelayConfig::default());
        let ((mut alice, mut alice_rx), (_bob, mut bob_rx)) = open_pair(&state).await;

        alice.handle_binary(&update_frame(5, "hi")).await.expect("update applies");
        alice.handle_binary(&bold_seal(5)).await.expect("presence applies");

        assert!(drain(&mut alice_rx).is_empty(), "origin must not receive its own changes");
        let to_bob = drain(&mut bob_rx);
        let kinds: Vec<&str> = to_bob
            .iter()
            .map(|item| match item {
                Outbound::Binary(bytes) => message_kind(&decode_frame(bytes).expect("frame decodes")[0]),
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["update", "awareness"]);
    }

    #[tokio::test]
    async fn presence_renewal_reaches_peers() {
        let state = RelayState::new(RelayConfig::default());
        let ((mut alice, mut alice_rx), (_bob, mut bob_rx)) = open_pair(&state).await;
        let cursor = r#"{"cursor":{"line":1}}"#;

        alice.handle_binary(&presence_frame(5, 1, cursor)).await.expect("presence applies");
        let first = drain(&mut bob_rx);
        assert_eq!(first.len(), 1);
        assert_eq!(presence_of(&first[0]).clients[&5].clock, 1);

        alice.handle_binary(&presence_frame(5, 2, cursor)).await.expect("renewal applies");
        let renewal = drain(&mut bob_rx);
        assert_eq!(renewal.len(), 1, "a newer clock with the same state is still relayed");
        let entry = &presence_of(&renewal[0]).clients[&5];
        assert_eq!(entry.clock, 2);
        assert_eq!(entry.json.as_ref(), cursor);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn presence_change_carries_new_state() {
        let state = RelayState::new(RelayConfig::default());
        let ((mut alice, _alice_rx), (_bob, mut bob_rx)) = open_pair(&state).await;

        alice.handle_binary(&presence_frame(5, 1, r#"{"cursor":{"line":1}}"#)).await.expect("presence applies");
        alice.handle_binary(&presence_frame(5, 2, r#"{"cursor":{"line":4}}"#)).await.expect("change applies");

        let to_bob = drain(&mut bob_rx);
        assert_eq!(to_bob.len(), 2);
        assert_eq!(presence_of(&to_bob[1]).clients[&5].json.as_ref(), r#"{"cursor":{"line":4}}"#);
    }

    #[tokio::test]
    async fn close_clears_presence_and_notifies_remaining_members() {
        let state = RelayState::new(RelayConfig::default());
        let ((mut alice, mut alice_rx), (_bob, mut bob_rx)) = open_pair(&state).await;
        alice.handle_binary(&bold_seal(9)).await.expect("presence applies");
        assert!(alice.controlled_clients().contains(&9));
        drain(&mut bob_rx);

        let doc = state.docs.get("doc1").await.expect("document exists");
        alice.close(&state).await;

        assert!(doc.lock().await.present_clients().is_empty());
        assert_eq!(state.docs.holders("doc1").await, Some(1));
        assert!(drain(&mut alice_rx).is_empty(), "closed connection receives nothing");

        let to_bob = drain(&mut bob_rx);
        let removal = presence_of(&to_bob[0]);
        let entry = &removal.clients[&9];
        assert_eq!((entry.clock, entry.json.as_ref()), (2, "null"));

        let Outbound::Control(ControlMessage::UsersUpdate { users, .. }) = &to_bob[1] else {
            panic!("roster update should follow");
        };
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "bob");
    }
}
