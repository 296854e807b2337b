use thiserror::Error;

/// Errors produced by the relay core and its transports.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("timed out waiting for response")]
    ResponseTimeout,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("missing header: {0}")]
    MissingHeader(String),

    #[error("declare failed for {name}: {reason}")]
    Declare { name: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("control plane error: {0}")]
    ControlPlane(String),

    #[error("unrecognized notification: {0}")]
    UnknownNotification(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
