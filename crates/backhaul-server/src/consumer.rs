//! Queue consumer loop.
//!
//! Each consumed queue gets one task that hands deliveries to a handler one
//! at a time, in queue order. A delivery is acknowledged after its handler
//! returns, whether it succeeded or not, so one bad message never blocks the
//! next.

use backhaul_core::{BoxFuture, Delivery, Message, MessageBus, RelayResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Processes one delivered message.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, RelayResult<()>>;
}

/// Start consuming `queue` and spawn the loop feeding `handler`.
///
/// The queue must already be declared. Failing to attach is returned to the
/// caller; everything after that is handled inside the loop.
pub async fn start_consumer(
    bus: &dyn MessageBus,
    queue: &str,
    handler: Arc<dyn DeliveryHandler>,
) -> RelayResult<JoinHandle<()>> {
    let deliveries = bus.consume(queue).await?;
    let queue = queue.to_string();
    info!(queue = %queue, "consumer started");
    Ok(tokio::spawn(run_consumer(queue, deliveries, handler)))
}

/// Drive `handler` until the delivery channel closes.
pub async fn run_consumer(
    queue: String,
    mut deliveries: mpsc::Receiver<Delivery>,
    handler: Arc<dyn DeliveryHandler>,
) {
    while let Some(delivery) = deliveries.recv().await {
        if let Err(e) = handler.handle(&delivery.message).await {
            warn!(queue = %queue, error = %e, "message dropped");
        }
        if let Err(e) = delivery.ack().await {
            warn!(queue = %queue, error = %e, "ack failed");
        }
    }
    debug!(queue = %queue, "consumer stopped");
}
