use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Missing URL parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Malformed provider address: {0}")]
    MalformedAddress(String),

    #[error("Failed to connect to {address}: {reason}")]
    ConnectionEstablish { address: String, reason: String },

    #[error("Connect to {address} timed out after {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    #[error("No providers available for service: {0}")]
    EmptyTopology(String),

    #[error("Listener {listener} failed: {reason}")]
    Listener { listener: &'static str, reason: String },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True when the error is scoped to a single provider address.
    pub fn is_per_address(&self) -> bool {
        matches!(
            self,
            CoreError::MalformedAddress(_)
                | CoreError::ConnectionEstablish { .. }
                | CoreError::ConnectTimeout { .. }
        )
    }
}
