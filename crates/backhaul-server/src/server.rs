//! Core server: wires the relays to the bus and the public listeners.
//!
//! Owns the shared tables (route directory, socket map, pending requests) and
//! hands them to each relay, then starts every bus consumer before opening
//! the listeners.

use crate::config::ServerConfig;
use crate::control::{AgentQueryService, ControlPlane, DirectorySync};
use crate::directory::{RouteDirectory, SocketMap};
use crate::relay::{HttpRelay, PortForwardRelay, RequestCorrelator, WebSocketRelay};
use crate::topology::TopologyManager;
use crate::transport::websocket::{self, AcceptedSocket};
use crate::transport::http;
use backhaul_core::{MessageBus, RelayError, RelayResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The backhaul relay instance.
pub struct BackhaulServer {
    config: ServerConfig,
    bus: Arc<dyn MessageBus>,
    directory: Arc<RouteDirectory>,
    topology: Arc<TopologyManager>,
    http_relay: Arc<HttpRelay>,
    websocket_relay: Arc<WebSocketRelay>,
    port_forward: Arc<PortForwardRelay>,
    directory_sync: Arc<DirectorySync>,
    agent_queries: Arc<AgentQueryService>,
}

impl BackhaulServer {
    pub fn new(
        config: ServerConfig,
        bus: Arc<dyn MessageBus>,
        control: Arc<dyn ControlPlane>,
    ) -> Self {
        let directory = Arc::new(RouteDirectory::new(config.platform_suffix.clone()));
        let sockets = Arc::new(SocketMap::new());
        let topology = Arc::new(TopologyManager::new(bus.clone()));
        let correlator = Arc::new(RequestCorrelator::new());

        let http_relay = Arc::new(HttpRelay::new(
            directory.clone(),
            topology.clone(),
            bus.clone(),
            correlator,
            config.response_timeout,
        ));
        let websocket_relay = Arc::new(WebSocketRelay::new(
            directory.clone(),
            sockets,
            topology.clone(),
            bus.clone(),
        ));
        let port_forward = Arc::new(PortForwardRelay::new(
            directory.clone(),
            topology.clone(),
            bus.clone(),
        ));
        let directory_sync = Arc::new(DirectorySync::new(control.clone(), directory.clone()));
        let agent_queries = Arc::new(AgentQueryService::new(control, topology.clone(), bus.clone()));

        Self {
            config,
            bus,
            directory,
            topology,
            http_relay,
            websocket_relay,
            port_forward,
            directory_sync,
            agent_queries,
        }
    }

    /// Load the directory and start every bus consumer. A consumer that
    /// cannot declare or attach to its queue aborts startup.
    pub async fn start_consumers(&self) -> RelayResult<Vec<JoinHandle<()>>> {
        let mut tasks = Vec::new();
        tasks.push(
            self.directory_sync
                .start(self.bus.as_ref(), &self.topology)
                .await?,
        );
        tasks.push(self.http_relay.start_response_consumer().await?);
        tasks.push(self.websocket_relay.start_client_consumer().await?);
        tasks.extend(self.port_forward.start().await?);
        tasks.push(self.agent_queries.start().await?);
        info!(consumers = tasks.len(), "bus consumers started");
        Ok(tasks)
    }

    /// Start consumers and listeners, then serve until a listener fails.
    pub async fn run(self) -> RelayResult<()> {
        let server = Arc::new(self);
        let _consumers = server.start_consumers().await?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], server.config.http_port));
        let ws_addr = SocketAddr::from(([0, 0, 0, 0], server.config.websocket_port));

        let mut ws_rx = websocket::start_listener(ws_addr, server.config.internal_timeout).await?;
        let front = http::FrontDoor {
            http: server.http_relay.clone(),
            websocket: server.websocket_relay.clone(),
        };
        let http_server = http::start_http_server(http_addr, front);
        tokio::pin!(http_server);

        let projects = server.directory.project_count().await;
        info!(
            http_port = server.config.http_port,
            ws_port = server.config.websocket_port,
            platform_suffix = %server.config.platform_suffix,
            projects,
            "backhaul-server ready"
        );

        loop {
            tokio::select! {
                result = &mut http_server => {
                    return match result {
                        Ok(()) => Err(RelayError::Transport("HTTP server stopped".into())),
                        Err(e) => Err(e),
                    };
                }
                Some(socket) = ws_rx.recv() => {
                    let srv = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = srv.handle_websocket(socket).await {
                            warn!(error = %e, "WebSocket session error");
                        }
                    });
                }
                else => {
                    info!("all listeners closed, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Attach an accepted socket to its project's session, or turn it away.
    async fn handle_websocket(&self, socket: AcceptedSocket) -> RelayResult<()> {
        let AcceptedSocket {
            ws_stream,
            host,
            remote_addr,
        } = socket;

        let project = match self.websocket_relay.project_for(&host).await {
            Ok(project) => project,
            Err(e) => {
                debug!(remote = %remote_addr, host = %host, "WebSocket for unknown host rejected");
                websocket::reject(ws_stream, "unknown host").await;
                return Err(e);
            }
        };

        let (mut source, sink) = websocket::split(ws_stream);
        self.websocket_relay
            .initialize(&project, &mut source, Arc::new(sink))
            .await
    }
}
