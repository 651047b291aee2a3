use std::collections::{BTreeMap, HashMap};

use tandem_common::protocol::control::{CursorPosition, UserSummary};
use tokio::sync::RwLock;

use crate::connection::{ConnectionHandle, ConnectionId, Outbound};
use crate::identity::Identity;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: String,
    pub identity: Identity,
    pub handle: ConnectionHandle,
    pub cursor: Option<CursorPosition>,
}

impl Member {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.user_id.clone(),
            name: self.identity.name.clone(),
            color: self.identity.color.clone(),
            cursor: self.cursor,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: u64,
    pub failed: u64,
}

/// Room name to the sockets currently joined. Independent of document
/// lifetime: a room disappears when its last member leaves, its document
/// does not.
#[derive(Debug, Default)]
pub struct RoomMembership {
    rooms: RwLock<HashMap<String, BTreeMap<ConnectionId, Member>>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, room: &str, member: Member) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room.to_string()).or_default().insert(member.handle.id, member);
    }

    pub async fn leave(&self, room: &str, id: ConnectionId) -> Option<Member> {
        let mut rooms = self.rooms.write().await;
        let members = rooms.get_mut(room)?;
        let removed = members.remove(&id);
        if members.is_empty() {
            rooms.remove(room);
        }
        removed
    }

    /// Records the member's cursor and returns the updated member.
    pub async fn set_cursor(
        &self,
        room: &str,
        id: ConnectionId,
        position: CursorPosition,
    ) -> Option<Member> {
        let mut rooms = self.rooms.write().await;
        let member = rooms.get_mut(room)?.get_mut(&id)?;
        member.cursor = Some(position);
        Some(member.clone())
    }

    pub async fn members(&self, room: &str) -> Vec<Member> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Open members of `room` in join order.
    pub async fn user_summaries(&self, room: &str) -> Vec<UserSummary> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|members| {
                members
                    .values()
                    .filter(|member| member.handle.is_open())
                    .map(Member::summary)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Queues `item` for every open member of `room` except `exclude`.
    ///
    /// A failed send is logged and counted; the remaining members are still
    /// served.
    pub async fn broadcast(
        &self,
        room: &str,
        item: Outbound,
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        let recipients: Vec<(String, ConnectionHandle)> = self
            .rooms
            .read()
            .await
            .get(room)
            .map(|members| {
                members
                    .values()
                    .filter(|member| Some(member.handle.id) != exclude && member.handle.is_open())
                    .map(|member| (member.user_id.clone(), member.handle.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = BroadcastReport::default();
        for (user_id, handle) in recipients {
            match handle.send(item.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    report.failed += 1;
                    metrics::increment_broadcast_send_failures();
                    tracing::warn!(
                        room,
                        user_id = %user_id,
                        connection_id = %handle.id,
                        "failed to queue broadcast for peer",
                    );
                }
            }
        }
        report
    }

    pub async fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.rooms
            .read()
            .await
            .values()
            .flat_map(|members| members.values().map(|member| member.handle.clone()))
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.rooms.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_common::protocol::control::ControlMessage;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn member(id: u64, user_id: &str) -> (Member, UnboundedReceiver<Outbound>) {
        let (handle, rx) = ConnectionHandle::new(ConnectionId(id));
        let member = Member {
            user_id: user_id.to_string(),
            identity: Identity { name: format!("Name {id}"), color: "#61afef".to_string() },
            handle,
            cursor: None,
        };
        (member, rx)
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_closed_members() {
        let rooms = RoomMembership::new();
        let (alice, mut alice_rx) = member(1, "alice");
        let (bob, mut bob_rx) = member(2, "bob");
        let (carol, mut carol_rx) = member(3, "carol");
        carol.handle.mark_closed();
        rooms.join("doc1", alice).await;
        rooms.join("doc1", bob).await;
        rooms.join("doc1", carol).await;

        let report = rooms.broadcast("doc1", Outbound::Control(ControlMessage::Pong), Some(ConnectionId(1))).await;

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(bob_rx.try_recv().expect("bob should receive"), Outbound::Control(ControlMessage::Pong));
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_peer_does_not_stop_broadcast() {
        let rooms = RoomMembership::new();
        let (alice, alice_rx) = member(1, "alice");
        let (bob, mut bob_rx) = member(2, "bob");
        rooms.join("doc1", alice).await;
        rooms.join("doc1", bob).await;
        drop(alice_rx);

        let report = rooms.broadcast("doc1", Outbound::Ping, None).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(bob_rx.try_recv().expect("bob should receive"), Outbound::Ping);
    }

    #[tokio::test]
    async fn leaving_last_member_drops_room() {
        let rooms = RoomMembership::new();
        let (alice, _alice_rx) = member(1, "alice");
        rooms.join("doc1", alice).await;
        assert_eq!(rooms.room_count().await, 1);

        let left = rooms.leave("doc1", ConnectionId(1)).await.expect("member should leave");
        assert_eq!(left.user_id, "alice");
        assert_eq!(rooms.room_count().await, 0);
        assert!(rooms.leave("doc1", ConnectionId(1)).await.is_none());
    }

    #[tokio::test]
    async fn cursor_is_reported_in_summaries() {
        let rooms = RoomMembership::new();
        let (alice, _alice_rx) = member(1, "alice");
        let (bob, _bob_rx) = member(2, "bob");
        rooms.join("doc1", alice).await;
        rooms.join("doc1", bob).await;

        let position = CursorPosition { line: 3.0, column: 7.0 };
        let updated = rooms
            .set_cursor("doc1", ConnectionId(2), position)
            .await
            .expect("bob is a member");
        assert_eq!(updated.cursor, Some(position));
        assert!(rooms.set_cursor("doc2", ConnectionId(2), position).await.is_none());

        let summaries = rooms.user_summaries("doc1").await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, "alice");
        assert_eq!(summaries[0].cursor, None);
        assert_eq!(summaries[1].cursor, Some(position));
    }

    #[tokio::test]
    async fn counts_span_all_rooms() {
        let rooms = RoomMembership::new();
        let (alice, _alice_rx) = member(1, "alice");
        let (bob, _bob_rx) = member(2, "bob");
        rooms.join("doc1", alice).await;
        rooms.join("doc2", bob).await;

        assert_eq!(rooms.connection_count().await, 2);
        assert_eq!(rooms.all_handles().await.len(), 2);
        assert_eq!(rooms.members("doc2").await[0].user_id, "bob");
    }
}
