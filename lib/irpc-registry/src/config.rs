//! Registry configuration

use crate::client::validate_path;
use crate::{RegistryError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ROOT: &str = "/irpc";
pub const DEFAULT_ETCD_ENDPOINT: &str = "http://localhost:2379";

/// Backoff applied when a watch cannot be re-armed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchBackoff {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 10_000,
        }
    }
}

impl WatchBackoff {
    /// Exponential delay for the given attempt, capped at `max_ms`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponential = 2u64.saturating_pow(attempt.min(32));
        let delay_ms = self.initial_ms.saturating_mul(exponential).min(self.max_ms);
        Duration::from_millis(delay_ms)
    }

    /// Base delay with up to 20% random jitter added.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = (base.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Path prefix every service lives under
    pub root: String,
    pub watch_backoff: WatchBackoff,
    /// Publish the current provider set as soon as a watch is first armed
    pub initial_snapshot: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            watch_backoff: WatchBackoff::default(),
            initial_snapshot: true,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.root == "/" || validate_path(&self.root).is_err() {
            return Err(RegistryError::Config(format!(
                "root must be an absolute path below /, got {:?}",
                self.root
            )));
        }
        if self.watch_backoff.initial_ms == 0 || self.watch_backoff.initial_ms > self.watch_backoff.max_ms {
            return Err(RegistryError::Config(format!(
                "watch_backoff.initial_ms must be between 1 and max_ms ({})",
                self.watch_backoff.max_ms
            )));
        }
        Ok(())
    }
}

/// Connection settings for an etcd cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Lease TTL backing this process's ephemeral nodes
    pub session_ttl_secs: i64,
    pub connect_timeout_ms: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ETCD_ENDPOINT.to_string()],
            session_ttl_secs: 10,
            connect_timeout_ms: 5_000,
        }
    }
}

impl EtcdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(RegistryError::Config("etcd endpoints are empty".to_string()));
        }
        if self.session_ttl_secs < 1 {
            return Err(RegistryError::Config(format!(
                "session_ttl_secs must be at least 1, got {}",
                self.session_ttl_secs
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// How often the session lease is refreshed.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis((self.session_ttl_secs.max(1) as u64) * 1000 / 3)
    }
}

/// Which coordination store backs the registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store, visible to this process only
    Memory,
    Etcd(EtcdConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Etcd(EtcdConfig::default())
    }
}
