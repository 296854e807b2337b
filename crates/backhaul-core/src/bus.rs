//! Abstract message bus for backhaul.
//!
//! The relay assumes an external ordered publish/subscribe transport with
//! named queues and exchanges, per-message headers, and explicit
//! acknowledgement. Broker-backed and in-process implementations must both
//! satisfy [`MessageBus`].

use crate::error::{RelayError, RelayResult};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// A boxed, sendable future, used so the bus traits stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Deliver to queues bound with exactly the message's routing key.
    Direct,
    /// Deliver to every bound queue.
    Fanout,
}

/// A single message header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Text form of the value. Byte values must be valid UTF-8.
    pub fn as_text(&self) -> Option<String> {
        match self {
            HeaderValue::Str(s) => Some(s.clone()),
            HeaderValue::Int(i) => Some(i.to_string()),
            HeaderValue::Bytes(b) => String::from_utf8(b.clone()).ok(),
        }
    }

    /// Integer form of the value. Text values are parsed.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            other => other.as_text()?.trim().parse().ok(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

impl From<u16> for HeaderValue {
    fn from(i: u16) -> Self {
        HeaderValue::Int(i64::from(i))
    }
}

/// Message properties: correlation id plus a header table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl Properties {
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// Required text header.
    pub fn text(&self, name: &str) -> RelayResult<String> {
        self.headers
            .get(name)
            .ok_or_else(|| RelayError::MissingHeader(name.to_string()))?
            .as_text()
            .ok_or_else(|| RelayError::MalformedEnvelope(format!("header {name} is not text")))
    }

    /// Required integer header.
    pub fn int(&self, name: &str) -> RelayResult<i64> {
        self.headers
            .get(name)
            .ok_or_else(|| RelayError::MissingHeader(name.to_string()))?
            .as_int()
            .ok_or_else(|| {
                RelayError::MalformedEnvelope(format!("header {name} is not an integer"))
            })
    }
}

/// A message body plus its properties, as published or delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: Properties::default(),
            body: body.into(),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Settles a delivered message with the transport.
pub trait Acknowledge: Send + Sync {
    /// Confirm the message was processed.
    fn ack(&self) -> BoxFuture<'_, RelayResult<()>>;

    /// Refuse the message, optionally handing it back to the queue.
    fn reject(&self, requeue: bool) -> BoxFuture<'_, RelayResult<()>>;
}

/// A message received from a queue, awaiting acknowledgement.
pub struct Delivery {
    pub message: Message,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledge>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(self) -> RelayResult<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> RelayResult<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Abstract publish/subscribe transport.
///
/// Declarations are idempotent: declaring an existing queue or exchange with
/// the same shape succeeds without side effects.
pub trait MessageBus: Send + Sync {
    /// Declare a named exchange.
    fn declare_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
    ) -> BoxFuture<'a, RelayResult<()>>;

    /// Declare a named queue.
    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, RelayResult<()>>;

    /// Bind `queue` to `exchange` under `routing_key`.
    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, RelayResult<()>>;

    /// Publish a message. An empty `exchange` delivers directly to the queue
    /// named by `routing_key`.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: Message,
    ) -> BoxFuture<'a, RelayResult<()>>;

    /// Start consuming a declared queue. Deliveries arrive in queue order.
    fn consume<'a>(&'a self, queue: &'a str)
        -> BoxFuture<'a, RelayResult<mpsc::Receiver<Delivery>>>;
}
