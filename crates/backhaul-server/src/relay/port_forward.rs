//! Port-forward multiplexer.
//!
//! Raw packets are relayed between use-port and share-port agents without
//! being inspected. All connection state travels in the `useport_*` headers,
//! so the relay keeps none of its own.

use crate::consumer::{start_consumer, DeliveryHandler};
use crate::directory::RouteDirectory;
use crate::topology::TopologyManager;
use backhaul_core::names::{self, headers};
use backhaul_core::{
    BoxFuture, Message, MessageBus, Properties, RelayError, RelayResult,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// The three headers identifying one forwarded connection.
const CONNECTION_HEADERS: [&str; 3] = [
    headers::USEPORT_USERNAME,
    headers::USEPORT_PORT,
    headers::USEPORT_CONNECTION_ID,
];

/// Relays packets for port-forward pairs.
pub struct PortForwardRelay {
    directory: Arc<RouteDirectory>,
    topology: Arc<TopologyManager>,
    bus: Arc<dyn MessageBus>,
}

impl PortForwardRelay {
    pub fn new(
        directory: Arc<RouteDirectory>,
        topology: Arc<TopologyManager>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            directory,
            topology,
            bus,
        }
    }

    /// Start both directions: use-port to share-port and back.
    pub async fn start(self: &Arc<Self>) -> RelayResult<Vec<JoinHandle<()>>> {
        self.topology
            .ensure_forward_queue(names::NETWORK_REQUESTS_QUEUE)
            .await?;
        self.topology
            .ensure_forward_queue(names::NETWORK_RESPONSES_QUEUE)
            .await?;

        let requests = start_consumer(
            self.bus.as_ref(),
            names::NETWORK_REQUESTS_QUEUE,
            Arc::new(RequestDirection(self.clone())),
        )
        .await?;
        let responses = start_consumer(
            self.bus.as_ref(),
            names::NETWORK_RESPONSES_QUEUE,
            Arc::new(ResponseDirection(self.clone())),
        )
        .await?;
        Ok(vec![requests, responses])
    }

    /// Forward a use-port packet to the linked share-port's tenant.
    ///
    /// Returns whether the packet was republished.
    pub async fn forward_request(&self, message: &Message) -> RelayResult<bool> {
        let (username, port) = connection_key(&message.properties)?;

        let source = match self.directory.resolve_app_project(&username, port).await {
            Ok(source) => source,
            Err(e) => return dropped(e),
        };
        let Some(target_view) = source.forward_target() else {
            debug!(username = %username, port, "not a use-port entry; packet dropped");
            return Ok(false);
        };
        let target = match self.directory.resolve_app_project_by_view(target_view).await {
            Ok(target) => target,
            Err(e) => return dropped(e),
        };

        let queue = names::shareport_queue(&target.customer.username);
        self.topology.ensure_forward_queue(&queue).await?;
        let properties = carry_connection_headers(&message.properties)
            .with_header(headers::SHAREDPORT_PORT, target.internal_port);
        self.republish(&queue, message, properties).await?;
        Ok(true)
    }

    /// Return a share-port packet to the originating use-port's tenant.
    ///
    /// Any entry matching the connection key is accepted; the forwarding
    /// link is not re-checked on the way back.
    pub async fn forward_response(&self, message: &Message) -> RelayResult<bool> {
        let (username, port) = connection_key(&message.properties)?;

        let origin = match self.directory.resolve_app_project(&username, port).await {
            Ok(origin) => origin,
            Err(e) => return dropped(e),
        };

        let queue = names::useport_queue(&origin.customer.username);
        self.topology.ensure_forward_queue(&queue).await?;
        let properties = carry_connection_headers(&message.properties);
        self.republish(&queue, message, properties).await?;
        Ok(true)
    }

    async fn republish(
        &self,
        queue: &str,
        message: &Message,
        properties: Properties,
    ) -> RelayResult<()> {
        let packet = Message::new(message.body.clone()).with_properties(properties);
        self.bus
            .publish(names::DEFAULT_EXCHANGE, queue, packet)
            .await
    }
}

/// `(useport_username, useport_port)` from the packet headers. The
/// connection id must be present too, even though routing ignores it.
fn connection_key(properties: &Properties) -> RelayResult<(String, u16)> {
    let username = properties.text(headers::USEPORT_USERNAME)?;
    let port = properties.int(headers::USEPORT_PORT)?;
    let port = u16::try_from(port)
        .map_err(|_| RelayError::MalformedEnvelope(format!("port out of range: {port}")))?;
    properties.text(headers::USEPORT_CONNECTION_ID)?;
    Ok((username, port))
}

/// Copy the connection headers as received, preserving their encoding.
fn carry_connection_headers(properties: &Properties) -> Properties {
    let mut out = Properties::default();
    for name in CONNECTION_HEADERS {
        if let Some(value) = properties.headers.get(name) {
            out.headers.insert(name.to_string(), value.clone());
        }
    }
    out
}

fn dropped(e: RelayError) -> RelayResult<bool> {
    debug!(error = %e, "no route for packet; dropped");
    Ok(false)
}

struct RequestDirection(Arc<PortForwardRelay>);

impl DeliveryHandler for RequestDirection {
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move { self.0.forward_request(message).await.map(|_| ()) })
    }
}

struct ResponseDirection(Arc<PortForwardRelay>);

impl DeliveryHandler for ResponseDirection {
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move { self.0.forward_response(message).await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{app_project, CountingBus};
    use backhaul_core::HeaderValue;
    use std::time::Duration;
    use uuid::Uuid;

    struct Harness {
        bus: Arc<CountingBus>,
        relay: Arc<PortForwardRelay>,
    }

    /// bob's port 5000 is linked to carol's share-port on 5432; dave's port
    /// 6000 has no link; erin's port 7000 links to a share-port that is not
    /// in the directory.
    async fn harness() -> Harness {
        let bus = Arc::new(CountingBus::new());
        let directory = Arc::new(RouteDirectory::new(".app.example.com"));
        let share = app_project("carol", 5432, None);
        let use_port = app_project("bob", 5000, Some(share.view_id));
        let unlinked = app_project("dave", 6000, None);
        let dangling = app_project("erin", 7000, Some(Uuid::new_v4()));
        directory
            .refresh_app_projects(vec![share, use_port, unlinked, dangling])
            .await;
        let topology = Arc::new(TopologyManager::new(bus.clone()));
        let relay = Arc::new(PortForwardRelay::new(directory, topology, bus.clone()));
        Harness { bus, relay }
    }

    fn packet(username: &str, port: i64, connection: &str) -> Message {
        Message::new(vec![0xde, 0xad, 0xbe, 0xef]).with_properties(
            Properties::default()
                .with_header("useport_username", username)
                .with_header("useport_port", port)
                .with_header("useport_connectionid", connection),
        )
    }

    #[tokio::test]
    async fn test_linked_use_port_reaches_share_port() {
        let h = harness().await;
        assert!(h.relay.forward_request(&packet("bob", 5000, "c-1")).await.unwrap());

        let out = h.bus.memory().get("carol_client_shareport_network_packets").await.unwrap();
        assert_eq!(out.body, vec![0xde, 0xad, 0xbe, 0xef]);
        let props = &out.properties;
        assert_eq!(props.text("useport_username").unwrap(), "bob");
        assert_eq!(props.headers.get("useport_port"), Some(&HeaderValue::Int(5000)));
        assert_eq!(props.text("useport_connectionid").unwrap(), "c-1");
        assert_eq!(props.int("sharedport_port").unwrap(), 5432);
    }

    #[tokio::test]
    async fn test_unlinked_or_unknown_is_dropped() {
        let h = harness().await;
        assert!(!h.relay.forward_request(&packet("dave", 6000, "c")).await.unwrap());
        assert!(!h.relay.forward_request(&packet("bob", 5999, "c")).await.unwrap());
        assert!(!h.relay.forward_request(&packet("nobody", 5000, "c")).await.unwrap());
        assert_eq!(h.bus.publishes(), 0);
    }

    #[tokio::test]
    async fn test_link_to_missing_share_port_is_dropped() {
        let h = harness().await;
        assert!(!h.relay.forward_request(&packet("erin", 7000, "c")).await.unwrap());
        assert_eq!(h.bus.publishes(), 0);
        assert_eq!(h.bus.queue_declarations(), 0);
    }

    #[tokio::test]
    async fn test_missing_header_is_an_error() {
        let h = harness().await;
        let bare = Message::new("x")
            .with_properties(Properties::default().with_header("useport_username", "bob"));
        assert!(matches!(
            h.relay.forward_request(&bare).await,
            Err(RelayError::MissingHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_response_returns_to_use_port_without_link_check() {
        let h = harness().await;
        assert!(h.relay.forward_response(&packet("dave", 6000, "c-9")).await.unwrap());

        let out = h.bus.memory().get("dave_client_useport_network_packets").await.unwrap();
        assert_eq!(out.body, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(out.properties.text("useport_connectionid").unwrap(), "c-9");
        assert!(out.properties.headers.get("sharedport_port").is_none());

        assert!(!h.relay.forward_response(&packet("nobody", 1, "c")).await.unwrap());
    }

    #[tokio::test]
    async fn test_consumers_relay_packets_end_to_end() {
        let h = harness().await;
        h.relay.start().await.unwrap();

        h.bus
            .publish("", "server_network_requests", packet("bob", 5000, "c-2"))
            .await
            .unwrap();
        h.bus
            .publish("", "server_network_requests", packet("dave", 6000, "c-3"))
            .await
            .unwrap();
        h.bus
            .publish("", "server_network_responses", packet("bob", 5000, "c-2"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let settled = h.bus.memory().depth("server_network_requests").await == Some(0)
                    && h.bus.memory().in_flight("server_network_requests").await == Some(0)
                    && h.bus.memory().depth("server_network_responses").await == Some(0)
                    && h.bus.memory().in_flight("server_network_responses").await == Some(0);
                if settled {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let back = h.bus.memory().get("bob_client_useport_network_packets").await.unwrap();
        assert_eq!(back.properties.text("useport_connectionid").unwrap(), "c-2");

        let forwarded = h.bus.memory().get("carol_client_shareport_network_packets").await.unwrap();
        assert_eq!(forwarded.properties.text("useport_connectionid").unwrap(), "c-2");
        assert!(h.bus.memory().get("carol_client_shareport_network_packets").await.is_none());
    }
}
