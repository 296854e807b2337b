//! backhaul-core: shared library for the backhaul relay.
//!
//! Provides the tenant model served by the control plane, the JSON envelopes
//! exchanged with tenant agents, the bus naming contract, the abstract
//! message bus with AMQP and in-process implementations, and the WebSocket
//! frame capability traits.

pub mod amqp;
pub mod bus;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod model;
pub mod names;
pub mod socket;

// Re-export commonly used items at crate root.
pub use amqp::AmqpBus;
pub use bus::{BoxFuture, Delivery, ExchangeKind, HeaderValue, Message, MessageBus, Properties};
pub use envelope::{HttpRequestModel, HttpResponseModel, MessageType, WebSocketData};
pub use error::{RelayError, RelayResult};
pub use memory::MemoryBus;
pub use model::{AppProject, AppProjectType, Customer, DomainType, Project, ProjectState};
pub use socket::{Frame, FrameSink, FrameSource};
