//! Agent queries for app-project lists.
//!
//! An agent asks on `server_bus` with its `username` header and gets its
//! customer's active app-projects back on its own `{username}_client_bus`.

use super::client::ControlPlane;
use crate::consumer::{start_consumer, DeliveryHandler};
use crate::topology::TopologyManager;
use backhaul_core::names::{self, headers};
use backhaul_core::{AppProject, BoxFuture, Message, MessageBus, RelayResult};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Answers app-project queries from tenant agents.
pub struct AgentQueryService {
    control: Arc<dyn ControlPlane>,
    topology: Arc<TopologyManager>,
    bus: Arc<dyn MessageBus>,
}

impl AgentQueryService {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        topology: Arc<TopologyManager>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            control,
            topology,
            bus,
        }
    }

    pub async fn start(self: &Arc<Self>) -> RelayResult<JoinHandle<()>> {
        self.topology
            .ensure_forward_queue(names::SERVER_BUS_QUEUE)
            .await?;
        start_consumer(self.bus.as_ref(), names::SERVER_BUS_QUEUE, self.clone()).await
    }

    /// Publish `username`'s active app-projects to its client queue.
    ///
    /// The control plane lists every customer's app-projects; the reply
    /// carries only the requester's own and never another tenant's ports.
    pub async fn answer(&self, username: &str) -> RelayResult<usize> {
        self.topology.ensure_client_queue(username).await?;

        let owned: Vec<AppProject> = self
            .control
            .fetch_active_app_projects()
            .await?
            .into_iter()
            .filter(|ap| ap.is_active() && ap.customer.username == username)
            .collect();

        let body = serde_json::to_vec(&owned)?;
        self.bus
            .publish(names::CLIENT_EXCHANGE, username, Message::new(body))
            .await?;
        debug!(username = %username, count = owned.len(), "answered app-project query");
        Ok(owned.len())
    }
}

impl DeliveryHandler for AgentQueryService {
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            let username = message.properties.text(headers::USERNAME)?;
            self.answer(&username).await.map(|_| ())
        })
    }
}
