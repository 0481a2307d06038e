//! Daemon configuration loaded from YAML with environment overrides

use anyhow::{Context, Result};
use irpc_core::ConnectorConfig;
use irpc_registry::{EtcdConfig, RegistryConfig, StoreConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_ENV: &str = "IRPC_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "irpc-discovery.yaml";

/// A provider this process announces
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ProviderEntry {
    pub service: String,
    pub port: u16,
    /// Bind a listener on the port so consumers can connect
    #[serde(default)]
    pub serve: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub application: String,
    pub host: String,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub connector: ConnectorConfig,
    pub providers: Vec<ProviderEntry>,
    /// Service names to consume
    pub subscriptions: Vec<String>,
    pub report_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            application: "irpc-discovery".to_string(),
            host: "127.0.0.1".to_string(),
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            connector: ConnectorConfig::default(),
            providers: Vec::new(),
            subscriptions: Vec::new(),
            report_interval_ms: 30_000,
        }
    }
}

impl DiscoveryConfig {
    /// Load from `IRPC_CONFIG` (or the default path if present), then apply
    /// `IRPC_STORE`, `IRPC_ETCD_ENDPOINTS`, `IRPC_ROOT` and
    /// `IRPC_CONNECT_TIMEOUT_MS`.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.registry.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        match lookup("IRPC_STORE").as_deref() {
            Some("memory") => self.store = StoreConfig::Memory,
            Some("etcd") if !matches!(self.store, StoreConfig::Etcd(_)) => {
                self.store = StoreConfig::Etcd(EtcdConfig::default());
            }
            Some("etcd") | None => {}
            Some(other) => anyhow::bail!("Invalid IRPC_STORE: {other} (expected memory or etcd)"),
        }
        if let Some(endpoints) = lookup("IRPC_ETCD_ENDPOINTS") {
            let endpoints: Vec<String> = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
            match &mut self.store {
                StoreConfig::Etcd(etcd) => etcd.endpoints = endpoints,
                StoreConfig::Memory => {
                    self.store = StoreConfig::Etcd(EtcdConfig {
                        endpoints,
                        ..EtcdConfig::default()
                    });
                }
            }
        }
        if let Some(root) = lookup("IRPC_ROOT") {
            self.registry.root = root;
        }
        if let Some(timeout) = lookup("IRPC_CONNECT_TIMEOUT_MS") {
            self.connector.connect_timeout_ms = timeout
                .parse()
                .with_context(|| format!("Invalid IRPC_CONNECT_TIMEOUT_MS: {timeout}"))?;
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}
