//! Relays between the public edge and tenant agents.

pub mod correlator;
pub mod http;
pub mod port_forward;
pub mod websocket;

pub use correlator::RequestCorrelator;
pub use http::{HttpRelay, InboundRequest, OutboundResponse};
pub use port_forward::PortForwardRelay;
pub use websocket::WebSocketRelay;
