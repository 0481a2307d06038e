//! Core discovery types for the irpc framework
//!
//! This library provides:
//! - Endpoint descriptors and coordination-store path building
//! - Provider connections and the per-service connection pool
//! - Typed change event bus
//! - Reconciliation of the pool against provider topology snapshots

pub mod connection;
pub mod error;
pub mod event;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod url;

pub use connection::{
    Connection, ConnectionRecord, Connector, ConnectorConfig, TcpConnection, TcpConnector,
};
pub use error::{CoreError, Result};
pub use event::{Event, EventBus, EventKind, EventListener, UrlChangeWrapper};
pub use listener::{ReconcileOutcome, ServiceUpdateListener};
pub use metrics::DiscoveryMetrics;
pub use pool::{ConnectionList, ConnectionPool};
pub use url::{ProviderAddress, Url};
