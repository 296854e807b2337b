//! Bus topology: declares the queues and exchanges each tenant needs.
//!
//! Every `ensure_*` call declares on first use and remembers it for the rest
//! of the process. The memo only saves round-trips; declarations are
//! idempotent on the transport, so concurrent first callers are harmless.

use backhaul_core::names;
use backhaul_core::{ExchangeKind, MessageBus, RelayResult};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Idempotent, memoized bus declarations.
pub struct TopologyManager {
    bus: Arc<dyn MessageBus>,
    declared: RwLock<HashSet<String>>,
}

impl TopologyManager {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            declared: RwLock::new(HashSet::new()),
        }
    }

    async fn is_declared(&self, key: &str) -> bool {
        self.declared.read().await.contains(key)
    }

    async fn remember(&self, key: String) {
        self.declared.write().await.insert(key);
    }

    /// Declare `queue`, optionally with `exchange` bound under `routing_key`.
    async fn ensure(
        &self,
        queue: &str,
        binding: Option<(&str, &str)>,
    ) -> RelayResult<()> {
        let key = match binding {
            Some((exchange, routing_key)) => format!("{exchange}/{routing_key}/{queue}"),
            None => queue.to_string(),
        };
        if self.is_declared(&key).await {
            return Ok(());
        }

        if let Some((exchange, _)) = binding {
            self.bus.declare_exchange(exchange, ExchangeKind::Direct).await?;
        }
        self.bus.declare_queue(queue).await?;
        if let Some((exchange, routing_key)) = binding {
            self.bus.bind_queue(queue, exchange, routing_key).await?;
        }

        debug!(queue = %queue, exchange = ?binding.map(|b| b.0), "declared");
        self.remember(key).await;
        Ok(())
    }

    /// `{username}_request_bus` on the `request` exchange, keyed by username.
    pub async fn ensure_tenant_request_queue(&self, username: &str) -> RelayResult<()> {
        let queue = names::tenant_request_queue(username);
        self.ensure(&queue, Some((names::REQUEST_EXCHANGE, username)))
            .await
    }

    /// `response_bus` on the `response` exchange with an empty routing key.
    pub async fn ensure_response_queue(&self) -> RelayResult<()> {
        self.ensure(names::RESPONSE_QUEUE, Some((names::RESPONSE_EXCHANGE, "")))
            .await
    }

    /// `{username}_websocket_server_bus` on `websocket_bus`, keyed by its own name.
    pub async fn ensure_tenant_websocket_queue(&self, username: &str) -> RelayResult<()> {
        let queue = names::tenant_websocket_queue(username);
        self.ensure(&queue, Some((names::WEBSOCKET_EXCHANGE, queue.as_str())))
            .await
    }

    /// `{username}_client_bus` on `client_bus`, keyed by username.
    pub async fn ensure_client_queue(&self, username: &str) -> RelayResult<()> {
        let queue = names::client_queue(username);
        self.ensure(&queue, Some((names::CLIENT_EXCHANGE, username)))
            .await
    }

    /// A plain queue reached through the default exchange.
    pub async fn ensure_forward_queue(&self, name: &str) -> RelayResult<()> {
        self.ensure(name, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingBus;
    use backhaul_core::{MemoryBus, Message};

    #[tokio::test]
    async fn test_request_queue_bound_by_username() {
        let bus = Arc::new(MemoryBus::new());
        let topology = TopologyManager::new(bus.clone());
        topology.ensure_tenant_request_queue("alice").await.unwrap();

        assert!(bus.has_exchange("request").await);
        bus.publish("request", "alice", Message::new("x")).await.unwrap();
        assert_eq!(bus.depth("alice_request_bus").await, Some(1));
    }

    #[tokio::test]
    async fn test_websocket_queue_bound_by_queue_name() {
        let bus = Arc::new(MemoryBus::new());
        let topology = TopologyManager::new(bus.clone());
        topology.ensure_tenant_websocket_queue("alice").await.unwrap();

        bus.publish("websocket_bus", "alice_websocket_server_bus", Message::new("f"))
            .await
            .unwrap();
        assert_eq!(bus.depth("alice_websocket_server_bus").await, Some(1));
    }

    #[tokio::test]
    async fn test_response_queue_uses_empty_routing_key() {
        let bus = Arc::new(MemoryBus::new());
        let topology = TopologyManager::new(bus.clone());
        topology.ensure_response_queue().await.unwrap();

        bus.publish("response", "", Message::new("r")).await.unwrap();
        assert_eq!(bus.depth("response_bus").await, Some(1));
    }

    #[tokio::test]
    async fn test_declarations_are_memoized() {
        let bus = Arc::new(CountingBus::new());
        let topology = TopologyManager::new(bus.clone());
        for _ in 0..3 {
            topology.ensure_tenant_request_queue("alice").await.unwrap();
            topology.ensure_forward_queue("bob_client_useport_network_packets").await.unwrap();
        }
        assert_eq!(bus.queue_declarations(), 2);

        topology.ensure_tenant_request_queue("bob").await.unwrap();
        assert_eq!(bus.queue_declarations(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_first_callers_are_safe() {
        let bus = Arc::new(MemoryBus::new());
        let topology = Arc::new(TopologyManager::new(bus.clone()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = topology.clone();
            handles.push(tokio::spawn(async move {
                t.ensure_tenant_request_queue("alice").await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        bus.publish("request", "alice", Message::new("x")).await.unwrap();
        assert_eq!(bus.depth("alice_request_bus").await, Some(1));
    }
}
