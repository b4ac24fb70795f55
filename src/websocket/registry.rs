use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::broadcast::BroadcastMessage;
use super::session::{ConnectionHandle, ConnectionId, Outbound, OutboundSender};

/// The broadcast group: every established connection that has not started
/// tearing down.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, OutboundSender>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns false if the handle was already registered.
    pub async fn register(&self, handle: &ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&handle.id()) {
            return false;
        }
        connections.insert(handle.id(), handle.sender());
        info!("Registered connection {} ({} in group)", handle.id(), connections.len());
        true
    }

    pub async fn remove(&self, id: &ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(id).is_some();
        if removed {
            info!("Removed connection {} ({} in group)", id, connections.len());
        }
        removed
    }

    /// Queues `message` on every registered connection and returns how many
    /// accepted it. A connection whose writer is already gone is skipped.
    pub async fn broadcast_all(&self, message: &BroadcastMessage) -> usize {
        let connections = self.connections.read().await;
        let text = message.text();
        let mut delivered = 0;

        for (id, sender) in connections.iter() {
            match sender.send(Outbound::Broadcast(Arc::clone(&text))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!("Failed to broadcast to connection {}: writer closed", id),
            }
        }

        debug!(
            sender = message.sender(),
            recipients = connections.len(),
            delivered,
            "broadcast"
        );
        delivered
    }

    /// Asks every registered connection to close. Membership is left to the
    /// connections' own teardown.
    pub async fn close_all(&self) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|sender| sender.send(Outbound::Close).is_ok())
            .count()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::broadcast::BroadcastFormatter;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        (ConnectionHandle::new(peer, None, tx), rx)
    }

    fn broadcast_text(out: Outbound) -> Arc<str> {
        match out {
            Outbound::Broadcast(text) => text,
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_and_remove_are_idempotent() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle();

        assert!(registry.register(&h1).await);
        assert!(!registry.register(&h1).await);
        assert_eq!(registry.connection_count().await, 1);
        assert!(registry.contains(&h1.id()).await);

        assert!(registry.remove(&h1.id()).await);
        assert!(!registry.remove(&h1.id()).await);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection_once() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (h, rx) = handle();
            registry.register(&h).await;
            receivers.push((h, rx));
        }

        let message = BroadcastFormatter::default().message("sender", "hello");
        assert_eq!(registry.broadcast_all(&message).await, 5);

        let expected = message.text();
        for (_, rx) in receivers.iter_mut() {
            let text = broadcast_text(rx.try_recv().expect("one copy"));
            assert!(Arc::ptr_eq(&text, &expected));
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_writers() {
        let registry = ConnectionRegistry::new();
        let (alive, mut alive_rx) = handle();
        let (dead, dead_rx) = handle();
        registry.register(&alive).await;
        registry.register(&dead).await;
        drop(dead_rx);

        let message = BroadcastFormatter::default().message("x", "y");
        assert_eq!(registry.broadcast_all(&message).await, 1);
        assert!(alive_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_removed_connection_gets_nothing() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        registry.register(&h1).await;
        registry.register(&h2).await;
        registry.remove(&h2.id()).await;

        let message = BroadcastFormatter::default().message("x", "y");
        assert_eq!(registry.broadcast_all(&message).await, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_membership_changes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (h, rx) = handle();
                registry.register(&h).await;
                registry.register(&h).await;
                let message = BroadcastFormatter::default().message("load", "tick");
                registry.broadcast_all(&message).await;
                // Odd handles leave, even ones stay.
                if i % 2 == 1 {
                    registry.remove(&h.id()).await;
                    registry.remove(&h.id()).await;
                }
                (h.id(), i % 2 == 0, rx)
            }));
        }

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        assert_eq!(registry.connection_count().await, 32);
        for (id, stays, _rx) in &outcomes {
            assert_eq!(registry.contains(id).await, *stays);
        }
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        registry.register(&h1).await;
        registry.register(&h2).await;

        assert_eq!(registry.close_all().await, 2);
        assert!(matches!(rx1.try_recv(), Ok(Outbound::Close)));
        assert!(matches!(rx2.try_recv(), Ok(Outbound::Close)));
        assert_eq!(registry.connection_count().await, 2);
    }
}
