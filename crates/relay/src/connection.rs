// Per-socket handle shared between the socket task and the rest of the relay.
//
// The socket task owns the websocket itself; everything else talks to it by
// pushing `Outbound` items onto its queue.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tandem_common::protocol::control::ControlMessage;
use tokio::sync::mpsc;
use yrs::Origin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Transaction origin used for changes this connection applies.
    pub fn origin(&self) -> Origin {
        Origin::from(self.to_string().as_str())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Work queued for a socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Control(ControlMessage),
    /// Transport-level ping.
    Ping,
    /// Drop the socket without a closing handshake.
    Terminate,
    /// Close with the normal closure code.
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    alive: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct SendError;

impl ConnectionHandle {
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            outbound,
            alive: Arc::new(AtomicBool::new(true)),
            open: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    pub fn send(&self, item: Outbound) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError);
        }
        self.outbound.send(item).map_err(|_| SendError)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Clears the liveness flag, returning whether it was set.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_renders_with_prefix_and_origin_matches() {
        let id = ConnectionId(7);
        assert_eq!(id.to_string(), "conn-7");
        assert_eq!(id.origin(), Origin::from("conn-7"));
        assert_ne!(id.origin(), ConnectionId(8).origin());
    }

    #[test]
    fn send_delivers_until_closed() {
        let (handle, mut rx) = ConnectionHandle::new(ConnectionId(1));
        handle.send(Outbound::Ping).expect("open handle should accept sends");
        assert_eq!(rx.try_recv().expect("ping should be queued"), Outbound::Ping);

        handle.mark_closed();
        assert!(!handle.is_open());
        assert!(handle.send(Outbound::Ping).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_marks_handle_not_open() {
        let (handle, rx) = ConnectionHandle::new(ConnectionId(2));
        drop(rx);
        assert!(!handle.is_open());
        assert!(handle.send(Outbound::Close).is_err());
    }

    #[test]
    fn take_alive_reports_previous_flag() {
        let (handle, _rx) = ConnectionHandle::new(ConnectionId(3));
        assert!(handle.take_alive());
        assert!(!handle.take_alive());
        handle.mark_alive();
        assert!(handle.is_alive());
    }
}
