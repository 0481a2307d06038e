//! Coordination-store backed service registry
//!
//! Providers register ephemeral nodes under `{root}/{service}/provider`,
//! consumers register sequential nodes under `{root}/{service}/consumer`
//! and get a [`irpc_core::Event::ServiceUpdate`] for every change of the
//! provider set.

pub mod client;
pub mod config;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod registry;
pub mod watcher;

pub use client::{ChildWatch, CoordinationClient, WatchEventKind, WatchedEvent};
pub use config::{
    EtcdConfig, RegistryConfig, StoreConfig, WatchBackoff, DEFAULT_ETCD_ENDPOINT, DEFAULT_ROOT,
};
pub use error::{RegistryError, Result};
pub use etcd::EtcdClient;
pub use memory::{MemoryClient, MemoryStore};
pub use registry::{RegistryService, ServiceRegistry};
pub use watcher::ProviderWatcher;
