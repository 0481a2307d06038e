//! Prometheus metrics for discovery and reconciliation

use crate::{CoreError, Result};
use prometheus::{Counter, CounterVec, Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector shared by the reconciliation path.
///
/// Clones share the same registry and series.
#[derive(Clone)]
pub struct DiscoveryMetrics {
    /// Topology snapshots applied to the pool
    pub snapshots_applied_total: CounterVec,
    /// Connections opened to newly appeared providers
    pub connections_opened_total: CounterVec,
    /// Connections closed because their provider disappeared
    pub connections_retired_total: CounterVec,
    /// Failed connection attempts
    pub connect_failures_total: CounterVec,
    /// Provider addresses that could not be parsed
    pub malformed_addresses_total: Counter,
    /// Live connections per service
    pub pool_connections: IntGaugeVec,
    pub registry: Arc<Registry>,
}

impl DiscoveryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let snapshots_applied_total = CounterVec::new(
            Opts::new("irpc_snapshots_applied_total", "Topology snapshots applied"),
            &["service"],
        )?;
        let connections_opened_total = CounterVec::new(
            Opts::new("irpc_connections_opened_total", "Provider connections opened"),
            &["service"],
        )?;
        let connections_retired_total = CounterVec::new(
            Opts::new("irpc_connections_retired_total", "Provider connections retired"),
            &["service"],
        )?;
        let connect_failures_total = CounterVec::new(
            Opts::new("irpc_connect_failures_total", "Failed provider connection attempts"),
            &["service"],
        )?;
        let malformed_addresses_total = Counter::new(
            "irpc_malformed_addresses_total",
            "Provider addresses that failed to parse",
        )?;
        let pool_connections = IntGaugeVec::new(
            Opts::new("irpc_pool_connections", "Live connections per service"),
            &["service"],
        )?;

        registry.register(Box::new(snapshots_applied_total.clone()))?;
        registry.register(Box::new(connections_opened_total.clone()))?;
        registry.register(Box::new(connections_retired_total.clone()))?;
        registry.register(Box::new(connect_failures_total.clone()))?;
        registry.register(Box::new(malformed_addresses_total.clone()))?;
        registry.register(Box::new(pool_connections.clone()))?;

        Ok(Self {
            snapshots_applied_total,
            connections_opened_total,
            connections_retired_total,
            connect_failures_total,
            malformed_addresses_total,
            pool_connections,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| CoreError::Internal(e.to_string()))
    }
}
