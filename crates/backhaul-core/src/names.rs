//! Queue, exchange and header names shared with tenant agents.
//!
//! These strings are part of the wire contract and must not change.

/// Direct exchange carrying HTTP requests to tenant agents.
pub const REQUEST_EXCHANGE: &str = "request";
/// Direct exchange carrying agent responses back to the server.
pub const RESPONSE_EXCHANGE: &str = "response";
pub const RESPONSE_QUEUE: &str = "response_bus";
/// Direct exchange carrying WebSocket frames to tenant agents.
pub const WEBSOCKET_EXCHANGE: &str = "websocket_bus";
/// Frames from agents back to live client sockets.
pub const WEBSOCKET_CLIENT_QUEUE: &str = "websocket_client_bus";
pub const NETWORK_REQUESTS_QUEUE: &str = "server_network_requests";
pub const NETWORK_RESPONSES_QUEUE: &str = "server_network_responses";
/// Control-plane change feed.
pub const EXTERNAL_BUS_QUEUE: &str = "api_to_server_external_bus";
/// Agent queries for their app-project list.
pub const SERVER_BUS_QUEUE: &str = "server_bus";
pub const CLIENT_EXCHANGE: &str = "client_bus";

/// The default exchange: routing key names the destination queue.
pub const DEFAULT_EXCHANGE: &str = "";

pub mod headers {
    pub const INTERNAL_URL: &str = "IntUrl";
    pub const HOST: &str = "Host";
    pub const USERNAME: &str = "username";
    pub const USEPORT_USERNAME: &str = "useport_username";
    pub const USEPORT_PORT: &str = "useport_port";
    pub const USEPORT_CONNECTION_ID: &str = "useport_connectionid";
    pub const SHAREDPORT_PORT: &str = "sharedport_port";
}

pub fn tenant_request_queue(username: &str) -> String {
    format!("{username}_request_bus")
}

pub fn tenant_websocket_queue(username: &str) -> String {
    format!("{username}_websocket_server_bus")
}

pub fn shareport_queue(username: &str) -> String {
    format!("{username}_client_shareport_network_packets")
}

pub fn useport_queue(username: &str) -> String {
    format!("{username}_client_useport_network_packets")
}

pub fn client_queue(username: &str) -> String {
    format!("{username}_client_bus")
}
