use irpc_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Ephemeral node cannot have children: {0}")]
    EphemeralParent(String),

    #[error("Undecodable store data: {0}")]
    Serialization(String),

    #[error("Invalid registry configuration: {0}")]
    Config(String),

    #[error("Failed to register {path}: {source}")]
    Registration {
        path: String,
        #[source]
        source: Box<RegistryError>,
    },

    #[error("Failed to subscribe {path}: {source}")]
    Subscription {
        path: String,
        #[source]
        source: Box<RegistryError>,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RegistryError {
    /// Connectivity or session loss, as opposed to a node-state conflict.
    pub fn is_unavailable(&self) -> bool {
        match self {
            RegistryError::StoreUnavailable(_) => true,
            RegistryError::Registration { source, .. }
            | RegistryError::Subscription { source, .. } => source.is_unavailable(),
            _ => false,
        }
    }
}
