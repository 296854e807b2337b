//! Test doubles and fixtures shared by the server's unit tests.

use crate::control::ControlPlane;
use backhaul_core::{
    AppProject, BoxFuture, Delivery, ExchangeKind, Frame, FrameSink, FrameSource,
    HttpResponseModel, MemoryBus, Message, MessageBus, Project, Properties, RelayError,
    RelayResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub use backhaul_core::model::fixtures::{app_project, project};

/// Sink that remembers every frame sent to it.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Frame>>,
}

impl RecordingSink {
    pub async fn frames(&self) -> Vec<Frame> {
        self.frames.lock().await.clone()
    }
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, frame: Frame) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            self.frames.lock().await.push(frame);
            Ok(())
        })
    }
}

/// Source fed from a channel. Dropping the sender ends the stream.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<RelayResult<Frame>>,
}

impl FrameSource for ChannelSource {
    fn recv_frame(&mut self) -> BoxFuture<'_, RelayResult<Option<Frame>>> {
        Box::pin(async move { self.rx.recv().await.transpose() })
    }
}

pub fn channel_source() -> (mpsc::UnboundedSender<RelayResult<Frame>>, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelSource { rx })
}

/// A [`MemoryBus`] that counts queue declarations and publishes.
pub struct CountingBus {
    inner: MemoryBus,
    queue_declarations: AtomicUsize,
    publishes: AtomicUsize,
}

impl CountingBus {
    pub fn new() -> Self {
        Self {
            inner: MemoryBus::new(),
            queue_declarations: AtomicUsize::new(0),
            publishes: AtomicUsize::new(0),
        }
    }

    pub fn queue_declarations(&self) -> usize {
        self.queue_declarations.load(Ordering::SeqCst)
    }

    pub fn publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    /// The wrapped bus, for inspecting queues.
    pub fn memory(&self) -> &MemoryBus {
        &self.inner
    }
}

impl MessageBus for CountingBus {
    fn declare_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
    ) -> BoxFuture<'a, RelayResult<()>> {
        self.inner.declare_exchange(name, kind)
    }

    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, RelayResult<()>> {
        self.queue_declarations.fetch_add(1, Ordering::SeqCst);
        self.inner.declare_queue(name)
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, RelayResult<()>> {
        self.inner.bind_queue(queue, exchange, routing_key)
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: Message,
    ) -> BoxFuture<'a, RelayResult<()>> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        self.inner.publish(exchange, routing_key, message)
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
    ) -> BoxFuture<'a, RelayResult<mpsc::Receiver<Delivery>>> {
        self.inner.consume(queue)
    }
}

/// Control plane serving whatever the test last set.
#[derive(Default)]
pub struct StaticControlPlane {
    projects: Mutex<Vec<Project>>,
    app_projects: Mutex<Vec<AppProject>>,
    failure: Mutex<Option<String>>,
}

impl StaticControlPlane {
    pub async fn set_projects(&self, projects: Vec<Project>) {
        *self.projects.lock().await = projects;
    }

    pub async fn set_app_projects(&self, app_projects: Vec<AppProject>) {
        *self.app_projects.lock().await = app_projects;
    }

    /// Make every fetch fail with `reason`.
    pub async fn fail_with(&self, reason: &str) {
        *self.failure.lock().await = Some(reason.to_string());
    }

    async fn check(&self) -> RelayResult<()> {
        match self.failure.lock().await.as_ref() {
            Some(reason) => Err(RelayError::ControlPlane(reason.clone())),
            None => Ok(()),
        }
    }
}

impl ControlPlane for StaticControlPlane {
    fn fetch_active_projects(&self) -> BoxFuture<'_, RelayResult<Vec<Project>>> {
        Box::pin(async move {
            self.check().await?;
            Ok(self.projects.lock().await.clone())
        })
    }

    fn fetch_active_app_projects(&self) -> BoxFuture<'_, RelayResult<Vec<AppProject>>> {
        Box::pin(async move {
            self.check().await?;
            Ok(self.app_projects.lock().await.clone())
        })
    }
}

/// Stand-in tenant agent: answers every request on `{username}_request_bus`
/// with `response`, correlated by message id.
pub async fn spawn_echo_agent(bus: Arc<MemoryBus>, username: &str, response: HttpResponseModel) {
    let queue = format!("{username}_request_bus");
    bus.declare_queue(&queue).await.unwrap();
    let mut deliveries = bus.consume(&queue).await.unwrap();
    let body = serde_json::to_vec(&response).unwrap();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let id = delivery.message.properties.message_id.clone().unwrap_or_default();
            let reply = Message::new(body.clone())
                .with_properties(Properties::default().with_message_id(id));
            bus.publish("response", "", reply).await.unwrap();
            delivery.ack().await.unwrap();
        }
    });
}
