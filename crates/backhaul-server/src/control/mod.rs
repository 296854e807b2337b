//! Control-plane integration: API client, change feed, agent queries.

pub mod agent_query;
pub mod client;
pub mod feed;

pub use agent_query::AgentQueryService;
pub use client::{ApiClient, ControlPlane};
pub use feed::DirectorySync;
