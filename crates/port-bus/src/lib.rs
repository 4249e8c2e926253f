//! In-process channel primitives for host ↔ applet isolation.
//!
//! Two delivery paths exist between an embedding host and the isolated
//! context it spawns, and both live here:
//!
//! * [`port_pair`]: a private, ordered, duplex byte channel. One end is
//!   transferred to the guest during the connection handshake; all protocol
//!   traffic after the handshake flows through it.
//! * [`mailbox`]: the permissive pre-handshake path. Guests post their
//!   `connect` announcement to the host's mailbox; the host posts an
//!   [`Envelope`] carrying the transferred [`Port`] back into the guest's
//!   inbox.
//!
//! Payloads are opaque [`Bytes`]; serialization happens above this crate so
//! that no shared object graph can cross the boundary.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port closed")]
    Closed,
    #[error("mailbox closed")]
    MailboxClosed,
}

pub type PortResult<T> = Result<T, PortError>;

/// One end of a private duplex channel. Sends are ordered and at-most-once
/// relative to other sends on the same pair; nothing is guaranteed across
/// distinct pairs.
#[derive(Debug)]
pub struct Port {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Port {
    pub fn send(&self, payload: Bytes) -> PortResult<()> {
        let tx = self.tx.as_ref().ok_or(PortError::Closed)?;
        tx.send(payload).map_err(|_| PortError::Closed)
    }

    /// Receives the next payload, or `None` once the peer end is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Closes this end. The peer observes `None` from `recv` after draining;
    /// further sends from either side fail. A closed port is never reused;
    /// reconnection allocates a fresh pair.
    pub fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        match &self.tx {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

/// Creates a connected pair of ports.
pub fn port_pair() -> (Port, Port) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Port {
            tx: Some(a_tx),
            rx: b_rx,
        },
        Port {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

/// A mailbox delivery: an opaque payload, optionally accompanied by a
/// transferred port (the handshake's channel upgrade).
#[derive(Debug)]
pub struct Envelope {
    pub payload: Bytes,
    pub port: Option<Port>,
}

#[derive(Debug, Clone)]
pub struct MailboxSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MailboxSender {
    pub fn post(&self, payload: Bytes, port: Option<Port>) -> PortResult<()> {
        self.tx
            .send(Envelope { payload, port })
            .map_err(|_| PortError::MailboxClosed)
    }
}

#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Mailbox {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// Creates a mailbox and a cloneable sender for it. Many producers, one
/// consumer: the broadcast-style delivery available before any private
/// channel exists.
pub fn mailbox() -> (MailboxSender, Mailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MailboxSender { tx }, Mailbox { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_pair_round_trip_preserves_order() {
        let (left, mut right) = port_pair();
        left.send(Bytes::from_static(b"one")).expect("send ok");
        left.send(Bytes::from_static(b"two")).expect("send ok");
        assert_eq!(right.recv().await.expect("recv"), Bytes::from_static(b"one"));
        assert_eq!(right.recv().await.expect("recv"), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn closed_port_drains_then_ends() {
        let (mut left, mut right) = port_pair();
        left.send(Bytes::from_static(b"last")).expect("send ok");
        left.close();
        assert_eq!(right.recv().await.expect("recv"), Bytes::from_static(b"last"));
        assert!(right.recv().await.is_none());
        assert!(matches!(
            right.send(Bytes::from_static(b"late")),
            Err(PortError::Closed)
        ));
    }

    #[tokio::test]
    async fn mailbox_transfers_a_port() {
        let (sender, mut inbox) = mailbox();
        let (kept, transferred) = port_pair();
        sender
            .post(Bytes::from_static(b"connect"), Some(transferred))
            .expect("post ok");

        let envelope = inbox.recv().await.expect("envelope");
        assert_eq!(envelope.payload, Bytes::from_static(b"connect"));
        let mut received = envelope.port.expect("port transferred");

        kept.send(Bytes::from_static(b"hello")).expect("send ok");
        assert_eq!(
            received.recv().await.expect("recv"),
            Bytes::from_static(b"hello")
        );
    }

    #[tokio::test]
    async fn independent_pairs_do_not_cross_talk() {
        let (a_left, mut a_right) = port_pair();
        let (b_left, mut b_right) = port_pair();
        a_left.send(Bytes::from_static(b"a")).expect("send ok");
        b_left.send(Bytes::from_static(b"b")).expect("send ok");
        assert_eq!(a_right.recv().await.expect("recv"), Bytes::from_static(b"a"));
        assert_eq!(b_right.recv().await.expect("recv"), Bytes::from_static(b"b"));
    }
}
