//! Public listeners: HTTP and WebSocket.

pub mod http;
pub mod websocket;
