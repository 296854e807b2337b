//! Route directory and live-socket map.
//!
//! The directory is rebuilt from the control plane; the socket map tracks
//! WebSocket sessions currently attached to this node.

pub mod routes;
pub mod sockets;

pub use routes::RouteDirectory;
pub use sockets::SocketMap;
