//! Per-service pool of live provider connections

use crate::{ConnectionRecord, CoreError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Immutable view of one service's connections.
pub type ConnectionList = Arc<Vec<Arc<ConnectionRecord>>>;

/// Slot for a single service. Writers swap the whole list, so readers
/// always see either the previous or the next sequence.
#[derive(Default)]
struct ServiceSlot {
    connections: RwLock<ConnectionList>,
    cursor: AtomicUsize,
}

/// ConnectionPool maps service names to their ordered connection lists.
///
/// The outer map lock is only taken to look up or create a slot; all
/// mutation of a service's list is scoped to that service's slot.
pub struct ConnectionPool {
    services: RwLock<HashMap<String, Arc<ServiceSlot>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, service_name: &str) -> Option<Arc<ServiceSlot>> {
        self.services.read().await.get(service_name).cloned()
    }

    async fn slot_or_insert(&self, service_name: &str) -> Arc<ServiceSlot> {
        if let Some(slot) = self.slot(service_name).await {
            return slot;
        }
        let mut services = self.services.write().await;
        services
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(ServiceSlot::default()))
            .clone()
    }

    /// Whether the service has an entry (possibly empty).
    pub async fn contains(&self, service_name: &str) -> bool {
        self.services.read().await.contains_key(service_name)
    }

    /// Create an empty entry for a service if none exists.
    pub async fn init_service(&self, service_name: &str) {
        self.slot_or_insert(service_name).await;
    }

    /// Current connections for a service, empty if unknown.
    pub async fn get(&self, service_name: &str) -> ConnectionList {
        match self.slot(service_name).await {
            Some(slot) => slot.connections.read().await.clone(),
            None => Arc::new(Vec::new()),
        }
    }

    /// Swap in a new list and return the one it replaced.
    pub async fn replace(
        &self,
        service_name: &str,
        connections: Vec<Arc<ConnectionRecord>>,
    ) -> ConnectionList {
        let slot = self.slot_or_insert(service_name).await;
        let mut current = slot.connections.write().await;
        let previous = std::mem::replace(&mut *current, Arc::new(connections));
        debug!(
            "Replaced pool for {}: {} -> {} connections",
            service_name,
            previous.len(),
            current.len()
        );
        previous
    }

    /// Round-robin pick among open connections of a service.
    pub async fn select(&self, service_name: &str) -> Result<Arc<ConnectionRecord>> {
        let Some(slot) = self.slot(service_name).await else {
            warn!("No connection pool for service {}", service_name);
            return Err(CoreError::EmptyTopology(service_name.to_string()));
        };
        let connections = slot.connections.read().await.clone();
        let open: Vec<&Arc<ConnectionRecord>> =
            connections.iter().filter(|c| c.is_open()).collect();
        if open.is_empty() {
            warn!("No live connections for service {}", service_name);
            return Err(CoreError::EmptyTopology(service_name.to_string()));
        }
        let current = slot.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(open[current % open.len()].clone())
    }

    pub async fn len(&self, service_name: &str) -> usize {
        self.get(service_name).await.len()
    }

    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
