//! WebSocket relay.
//!
//! Each upgraded connection streams its inbound frames onto the tenant's
//! websocket queue until it closes. Frames coming back from agents arrive on
//! one shared queue and are routed to the live socket by their `Host` header.
//! The shared consumer only queues frames; each session writes its own socket.

use crate::consumer::{start_consumer, DeliveryHandler};
use crate::directory::sockets::Delivered;
use crate::directory::{RouteDirectory, SocketMap};
use crate::topology::TopologyManager;
use backhaul_core::names::{self, headers};
use backhaul_core::{
    BoxFuture, Frame, FrameSink, FrameSource, Message, MessageBus, MessageType, Project,
    Properties, RelayError, RelayResult, WebSocketData,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Frames buffered per session before agent frames are dropped.
pub const OUTBOUND_FRAME_BUFFER: usize = 256;

/// Relays WebSocket sessions between front-door sockets and tenant agents.
pub struct WebSocketRelay {
    directory: Arc<RouteDirectory>,
    sockets: Arc<SocketMap>,
    topology: Arc<TopologyManager>,
    bus: Arc<dyn MessageBus>,
}

impl WebSocketRelay {
    pub fn new(
        directory: Arc<RouteDirectory>,
        sockets: Arc<SocketMap>,
        topology: Arc<TopologyManager>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            directory,
            sockets,
            topology,
            bus,
        }
    }

    /// Project served on `host`, for deciding whether to accept an upgrade.
    pub async fn project_for(&self, host: &str) -> RelayResult<Project> {
        self.directory.resolve(host).await
    }

    /// Start the shared consumer delivering agent frames to live sockets.
    pub async fn start_client_consumer(&self) -> RelayResult<JoinHandle<()>> {
        self.topology
            .ensure_forward_queue(names::WEBSOCKET_CLIENT_QUEUE)
            .await?;
        let handler = Arc::new(ClientFrameHandler {
            sockets: self.sockets.clone(),
        });
        start_consumer(self.bus.as_ref(), names::WEBSOCKET_CLIENT_QUEUE, handler).await
    }

    /// Run one session for `project` until the client closes or the socket
    /// fails. The host entry is removed on every exit path.
    pub async fn initialize(
        &self,
        project: &Project,
        source: &mut dyn FrameSource,
        sink: Arc<dyn FrameSink>,
    ) -> RelayResult<()> {
        let host = self.directory.project_host(project).to_ascii_lowercase();
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_FRAME_BUFFER);
        let writer = tokio::spawn(write_frames(host.clone(), frames_rx, sink));

        self.sockets.register(&host, frames_tx).await;
        let live_sessions = self.sockets.count().await;
        info!(
            host = %host,
            username = %project.customer.username,
            live_sessions,
            "websocket session opened"
        );

        let result = self.stream(project, &host, source).await;

        self.sockets.remove(&host).await;
        writer.abort();
        match &result {
            Ok(frames) => info!(host = %host, frames, "websocket session closed"),
            Err(e) => info!(host = %host, error = %e, "websocket session ended with error"),
        }
        result.map(|_| ())
    }

    /// Inbound loop. Returns the number of frames published.
    async fn stream(
        &self,
        project: &Project,
        host: &str,
        source: &mut dyn FrameSource,
    ) -> RelayResult<u64> {
        let username = project.customer.username.as_str();
        self.topology.ensure_tenant_websocket_queue(username).await?;
        let routing_key = names::tenant_websocket_queue(username);

        let mut published = 0u64;
        loop {
            let frame = match source.recv_frame().await? {
                Some(frame) if frame.message_type != MessageType::Close => frame,
                _ => break,
            };
            let data = WebSocketData::new(frame.payload, frame.message_type, frame.end_of_message);
            let properties = Properties::default()
                .with_header(headers::INTERNAL_URL, project.internal_url.as_str())
                .with_header(headers::HOST, host);
            let message = Message::new(serde_json::to_vec(&data)?).with_properties(properties);
            self.bus
                .publish(names::WEBSOCKET_EXCHANGE, &routing_key, message)
                .await?;
            published += 1;
        }
        Ok(published)
    }
}

/// Drain one session's outbound queue into its socket.
async fn write_frames(host: String, mut frames: mpsc::Receiver<Frame>, sink: Arc<dyn FrameSink>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sink.send_frame(frame).await {
            debug!(host = %host, error = %e, "websocket write failed; writer stopped");
            break;
        }
    }
}

/// Delivers frames from `websocket_client_bus` to the socket for their host.
struct ClientFrameHandler {
    sockets: Arc<SocketMap>,
}

impl DeliveryHandler for ClientFrameHandler {
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            let host = message.properties.text(headers::HOST)?.to_ascii_lowercase();
            let data: WebSocketData = serde_json::from_slice(&message.body)
                .map_err(|e| RelayError::MalformedEnvelope(e.to_string()))?;

            let frame = Frame {
                payload: data.payload().to_vec(),
                message_type: data.message_type,
                end_of_message: data.end_of_message,
            };
            match self.sockets.deliver(&host, frame).await {
                Delivered::Queued => {}
                Delivered::NoSession | Delivered::Closed => {
                    debug!(host = %host, "no live socket; frame dropped")
                }
                Delivered::Backlogged => {
                    warn!(host = %host, "client not reading; frame dropped")
                }
            }
            Ok(())
        })
    }
}
