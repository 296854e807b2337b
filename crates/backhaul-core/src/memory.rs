//! In-process [`MessageBus`] backed by tokio primitives.
//!
//! Queues are FIFO buffers with at most one consumer each. Exchanges route by
//! exact routing key (direct) or to every binding (fanout). Rejected
//! deliveries can be requeued at the head of their queue.

use crate::bus::{Acknowledge, BoxFuture, Delivery, ExchangeKind, Message, MessageBus};
use crate::error::{RelayError, RelayResult};
use crate::names::DEFAULT_EXCHANGE;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tracing::{debug, trace};

struct Queue {
    name: String,
    buffer: Mutex<VecDeque<Message>>,
    notify: Notify,
    in_flight: AtomicUsize,
    consuming: AtomicBool,
}

impl Queue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            consuming: AtomicBool::new(false),
        }
    }

    async fn push(&self, message: Message) {
        self.buffer.lock().await.push_back(message);
        self.notify.notify_one();
    }

    async fn push_front(&self, message: Message) {
        self.buffer.lock().await.push_front(message);
        self.notify.notify_one();
    }

    /// Wait for the next message. Cancel-safe: a message is only removed
    /// from the buffer once it is about to be returned.
    async fn pop(&self) -> Message {
        loop {
            if let Some(message) = self.buffer.lock().await.pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

struct Exchange {
    kind: ExchangeKind,
    /// `(routing_key, queue)` pairs.
    bindings: Vec<(String, String)>,
}

/// How a delivery was settled. `Some(message)` goes back to the queue head.
type Settlement = Option<Message>;

struct MemoryAcker {
    queue: Arc<Queue>,
    /// Taken on first settlement.
    pending: StdMutex<Option<(Message, oneshot::Sender<Settlement>)>>,
}

impl MemoryAcker {
    fn new(queue: Arc<Queue>, message: Message, settled: oneshot::Sender<Settlement>) -> Self {
        Self {
            queue,
            pending: StdMutex::new(Some((message, settled))),
        }
    }

    fn settle(&self, requeue: bool) {
        let taken = match self.pending.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((message, settled)) = taken {
            self.queue.in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = settled.send(requeue.then_some(message));
        }
    }
}

impl Acknowledge for MemoryAcker {
    fn ack(&self) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            self.settle(false);
            Ok(())
        })
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            if !requeue {
                debug!(queue = %self.queue.name, "rejected message discarded");
            }
            self.settle(requeue);
            Ok(())
        })
    }
}

impl Drop for MemoryAcker {
    /// A delivery dropped without settlement is redelivered.
    fn drop(&mut self) {
        self.settle(true);
    }
}

/// An in-process message bus.
pub struct MemoryBus {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    exchanges: RwLock<HashMap<String, Exchange>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            exchanges: RwLock::new(HashMap::new()),
        }
    }

    async fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().await.get(name).cloned()
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.queues.read().await.contains_key(name)
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.read().await.contains_key(name)
    }

    /// Number of messages waiting in a queue (not yet handed to a consumer).
    pub async fn depth(&self, queue: &str) -> Option<usize> {
        let queue = self.queue(queue).await?;
        let depth = queue.buffer.lock().await.len();
        Some(depth)
    }

    /// Number of delivered messages not yet acknowledged or rejected.
    pub async fn in_flight(&self, queue: &str) -> Option<usize> {
        let queue = self.queue(queue).await?;
        Some(queue.in_flight.load(Ordering::SeqCst))
    }

    /// Take the next waiting message without a consumer, auto-acknowledged.
    pub async fn get(&self, queue: &str) -> Option<Message> {
        let queue = self.queue(queue).await?;
        let message = queue.buffer.lock().await.pop_front();
        message
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for MemoryBus {
    fn declare_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
    ) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            if name.is_empty() {
                return Err(RelayError::Declare {
                    name: name.to_string(),
                    reason: "the default exchange cannot be redeclared".to_string(),
                });
            }
            let mut exchanges = self.exchanges.write().await;
            match exchanges.get(name) {
                Some(existing) if existing.kind != kind => Err(RelayError::Declare {
                    name: name.to_string(),
                    reason: format!("already declared as {:?}", existing.kind),
                }),
                Some(_) => Ok(()),
                None => {
                    exchanges.insert(
                        name.to_string(),
                        Exchange {
                            kind,
                            bindings: Vec::new(),
                        },
                    );
                    trace!(exchange = %name, ?kind, "exchange declared");
                    Ok(())
                }
            }
        })
    }

    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            if name.is_empty() {
                return Err(RelayError::Declare {
                    name: name.to_string(),
                    reason: "queue name must not be empty".to_string(),
                });
            }
            let mut queues = self.queues.write().await;
            if !queues.contains_key(name) {
                queues.insert(name.to_string(), Arc::new(Queue::new(name)));
                trace!(queue = %name, "queue declared");
            }
            Ok(())
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            if !self.has_queue(queue).await {
                return Err(RelayError::Declare {
                    name: queue.to_string(),
                    reason: "cannot bind undeclared queue".to_string(),
                });
            }
            let mut exchanges = self.exchanges.write().await;
            let entry = exchanges.get_mut(exchange).ok_or_else(|| RelayError::Declare {
                name: exchange.to_string(),
                reason: "cannot bind to undeclared exchange".to_string(),
            })?;
            let binding = (routing_key.to_string(), queue.to_string());
            if !entry.bindings.contains(&binding) {
                entry.bindings.push(binding);
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: Message,
    ) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
                vec![routing_key.to_string()]
            } else {
                let exchanges = self.exchanges.read().await;
                let entry = exchanges.get(exchange).ok_or_else(|| {
                    RelayError::Transport(format!("no exchange '{exchange}'"))
                })?;
                let mut targets: Vec<String> = entry
                    .bindings
                    .iter()
                    .filter(|(key, _)| entry.kind == ExchangeKind::Fanout || key == routing_key)
                    .map(|(_, queue)| queue.clone())
                    .collect();
                targets.dedup();
                targets
            };

            let mut delivered = 0;
            for name in &targets {
                if let Some(queue) = self.queue(name).await {
                    queue.push(message.clone()).await;
                    delivered += 1;
                }
            }
            if delivered == 0 {
                debug!(exchange = %exchange, routing_key = %routing_key, "message unroutable, dropped");
            }
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
    ) -> BoxFuture<'a, RelayResult<mpsc::Receiver<Delivery>>> {
        Box::pin(async move {
            let queue = self
                .queue(queue)
                .await
                .ok_or_else(|| RelayError::Transport(format!("no queue '{queue}'")))?;
            if queue.consuming.swap(true, Ordering::SeqCst) {
                return Err(RelayError::Transport(format!(
                    "queue '{}' already has a consumer",
                    queue.name
                )));
            }

            // One unsettled delivery per consumer: the pump waits for each
            // settlement before taking the next message.
            let (tx, rx) = mpsc::channel::<Delivery>(1);
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        message = queue.pop() => message,
                        _ = tx.closed() => break,
                    };
                    queue.in_flight.fetch_add(1, Ordering::SeqCst);
                    let (settled_tx, settled_rx) = oneshot::channel();
                    let acker = MemoryAcker::new(queue.clone(), message.clone(), settled_tx);
                    // A failed send drops the delivery, which requeues it.
                    let sent = tx.send(Delivery::new(message, Box::new(acker))).await.is_ok();
                    if let Ok(Some(returned)) = settled_rx.await {
                        queue.push_front(returned).await;
                    }
                    if !sent {
                        break;
                    }
                }
                queue.consuming.store(false, Ordering::SeqCst);
                debug!(queue = %queue.name, "consumer detached");
            });
            Ok(rx)
        })
    }
}
