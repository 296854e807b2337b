//! Live WebSocket sessions on this node, keyed by project host.
//!
//! Each session registers the sending side of its outbound frame queue. A
//! writer task owned by the session drains the queue into the socket, so
//! delivering a frame never waits on the client.

use backhaul_core::Frame;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Outbound frame queue of one session.
pub type FrameSender = mpsc::Sender<Frame>;

/// Result of handing a frame to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Queued,
    /// No session is registered for the host.
    NoSession,
    /// The session's queue is full; the client is not keeping up.
    Backlogged,
    /// The session is shutting down.
    Closed,
}

/// One live socket per host. A second registration for the same host
/// replaces the first.
pub struct SocketMap {
    sockets: RwLock<HashMap<String, FrameSender>>,
}

impl SocketMap {
    pub fn new() -> Self {
        Self {
            sockets: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session's outbound queue under `host`.
    pub async fn register(&self, host: &str, sender: FrameSender) {
        let mut sockets = self.sockets.write().await;
        if sockets.insert(host.to_string(), sender).is_some() {
            warn!(host = %host, "replaced existing websocket session");
        } else {
            debug!(host = %host, "websocket session registered");
        }
    }

    /// Remove whatever session is registered under `host`.
    pub async fn remove(&self, host: &str) {
        if self.sockets.write().await.remove(host).is_some() {
            debug!(host = %host, "websocket session removed");
        }
    }

    /// Queue `frame` for the session on `host` without waiting.
    pub async fn deliver(&self, host: &str, frame: Frame) -> Delivered {
        let Some(sender) = self.sockets.read().await.get(host).cloned() else {
            return Delivered::NoSession;
        };
        match sender.try_send(frame) {
            Ok(()) => Delivered::Queued,
            Err(TrySendError::Full(_)) => Delivered::Backlogged,
            Err(TrySendError::Closed(_)) => Delivered::Closed,
        }
    }

    pub async fn contains(&self, host: &str) -> bool {
        self.sockets.read().await.contains_key(host)
    }

    pub async fn count(&self) -> usize {
        self.sockets.read().await.len()
    }
}

impl Default for SocketMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_deliver_remove() {
        let map = SocketMap::new();
        let (tx, mut rx) = mpsc::channel(4);
        map.register("acme.io", tx).await;
        assert!(map.contains("acme.io").await);
        assert_eq!(map.count().await, 1);

        assert_eq!(map.deliver("acme.io", Frame::text("hi")).await, Delivered::Queued);
        assert_eq!(rx.recv().await, Some(Frame::text("hi")));

        map.remove("acme.io").await;
        assert!(!map.contains("acme.io").await);
        assert_eq!(map.deliver("acme.io", Frame::text("x")).await, Delivered::NoSession);
        map.remove("acme.io").await;
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let map = SocketMap::new();
        let (first, mut first_rx) = mpsc::channel(4);
        let (second, mut second_rx) = mpsc::channel(4);
        map.register("acme.io", first).await;
        map.register("acme.io", second).await;
        assert_eq!(map.count().await, 1);

        map.deliver("acme.io", Frame::text("hi")).await;
        assert!(first_rx.try_recv().is_err());
        assert_eq!(second_rx.try_recv().ok(), Some(Frame::text("hi")));
    }

    #[tokio::test]
    async fn test_full_or_closed_queue_never_waits() {
        let map = SocketMap::new();
        let (tx, rx) = mpsc::channel(1);
        map.register("slow.io", tx).await;

        assert_eq!(map.deliver("slow.io", Frame::text("1")).await, Delivered::Queued);
        assert_eq!(map.deliver("slow.io", Frame::text("2")).await, Delivered::Backlogged);

        drop(rx);
        assert_eq!(map.deliver("slow.io", Frame::text("3")).await, Delivered::Closed);
    }
}
