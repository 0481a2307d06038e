//! Reconciles the connection pool against provider topology snapshots

use crate::{
    ConnectionPool, ConnectionRecord, Connector, CoreError, DiscoveryMetrics, Event,
    EventListener, ProviderAddress, Result, UrlChangeWrapper,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of one reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub retained: usize,
    pub added: usize,
    pub retired: usize,
    pub malformed: usize,
    /// Per-address connection failures; these addresses stay out of the pool
    pub failures: Vec<CoreError>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.retired == 0 && self.failures.is_empty()
    }
}

/// ServiceUpdateListener turns topology snapshots into pool updates.
///
/// Existing connections whose address is still listed are kept as-is, new
/// addresses are connected, and connections to vanished providers are
/// closed once the new list is visible to readers.
pub struct ServiceUpdateListener {
    pool: Arc<ConnectionPool>,
    connector: Arc<dyn Connector>,
    metrics: Option<DiscoveryMetrics>,
}

impl ServiceUpdateListener {
    pub fn new(pool: Arc<ConnectionPool>, connector: Arc<dyn Connector>) -> Self {
        Self {
            pool,
            connector,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Parse and dedupe snapshot entries, keeping first-seen order.
    fn desired_addresses(&self, update: &UrlChangeWrapper, outcome: &mut ReconcileOutcome) -> Vec<ProviderAddress> {
        let mut seen = HashSet::new();
        let mut desired = Vec::with_capacity(update.provider_urls.len());
        for raw in &update.provider_urls {
            match raw.parse::<ProviderAddress>() {
                Ok(address) => {
                    if seen.insert(address.clone()) {
                        desired.push(address);
                    }
                }
                Err(e) => {
                    warn!("Skipping provider of {}: {}", update.service_name, e);
                    outcome.malformed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.malformed_addresses_total.inc();
                    }
                }
            }
        }
        desired
    }

    /// Apply one snapshot to the pool entry of its service.
    pub async fn reconcile(&self, update: &UrlChangeWrapper) -> ReconcileOutcome {
        let service = update.service_name.as_str();
        let mut outcome = ReconcileOutcome::default();
        let desired = self.desired_addresses(update, &mut outcome);

        if !self.pool.contains(service).await {
            if desired.is_empty() {
                debug!("Ignoring empty topology for untracked service {}", service);
                return outcome;
            }
            info!("Initializing connection pool for {}", service);
        }

        let current = self.pool.get(service).await;
        let wanted: HashSet<&ProviderAddress> = desired.iter().collect();
        let mut kept_addresses = HashSet::new();
        let mut next: Vec<Arc<ConnectionRecord>> = Vec::with_capacity(desired.len());
        for record in current.iter() {
            if wanted.contains(record.address())
                && record.is_open()
                && kept_addresses.insert(record.address().clone())
            {
                next.push(record.clone());
            }
        }
        outcome.retained = next.len();

        // connect outside any pool lock
        let to_add: Vec<&ProviderAddress> = desired
            .iter()
            .filter(|address| !kept_addresses.contains(*address))
            .collect();
        let attempts = join_all(to_add.into_iter().map(|address| async move {
            (address, self.connector.connect(address).await)
        }))
        .await;

        for (address, attempt) in attempts {
            match attempt {
                Ok(connection) => {
                    next.push(Arc::new(ConnectionRecord::new(address.clone(), connection)));
                    outcome.added += 1;
                }
                Err(e) => {
                    warn!("Could not connect to {} provider {}: {}", service, address, e);
                    outcome.failures.push(e);
                }
            }
        }

        let live = next.len();
        let previous = self.pool.replace(service, next.clone()).await;

        // removal is visible now; safe to close what was dropped
        for record in previous.iter() {
            if !next.iter().any(|kept| Arc::ptr_eq(kept, record)) {
                debug!("Retiring connection to {} provider {}", service, record.address());
                record.close().await;
                outcome.retired += 1;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.snapshots_applied_total.with_label_values(&[service]).inc();
            metrics
                .connections_opened_total
                .with_label_values(&[service])
                .inc_by(outcome.added as f64);
            metrics
                .connections_retired_total
                .with_label_values(&[service])
                .inc_by(outcome.retired as f64);
            metrics
                .connect_failures_total
                .with_label_values(&[service])
                .inc_by(outcome.failures.len() as f64);
            metrics
                .pool_connections
                .with_label_values(&[service])
                .set(live as i64);
        }

        if live == 0 {
            warn!("Service {} has no live provider connections", service);
        }
        info!(
            "Reconciled {}: {} retained, {} added, {} retired, {} failed",
            service,
            outcome.retained,
            outcome.added,
            outcome.retired,
            outcome.failures.len()
        );
        outcome
    }
}

#[async_trait::async_trait]
impl EventListener for ServiceUpdateListener {
    fn name(&self) -> &'static str {
        "ServiceUpdateListener"
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        match event {
            Event::ServiceUpdate(update) => {
                self.reconcile(update).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FakeConnection {
        open: AtomicBool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn close(&self) {
            if self.open.swap(false, Ordering::SeqCst) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    /// Connector that refuses a fixed set of hosts and counts opens.
    #[derive(Default)]
    struct ScriptedConnector {
        refuse: Mutex<HashSet<String>>,
        opened: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn refusing(hosts: &[&str]) -> Self {
            let connector = Self::default();
            connector
                .refuse
                .lock()
                .unwrap()
                .extend(hosts.iter().map(|h| h.to_string()));
            connector
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, address: &ProviderAddress) -> Result<Box<dyn Connection>> {
            if self.refuse.lock().unwrap().contains(&address.host) {
                return Err(CoreError::ConnectionEstablish {
                    address: address.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                open: AtomicBool::new(true),
                closes: self.closes.clone(),
            }))
        }
    }

    fn setup(connector: ScriptedConnector) -> (ServiceUpdateListener, Arc<ScriptedConnector>) {
        let connector = Arc::new(connector);
        let listener = ServiceUpdateListener::new(Arc::new(ConnectionPool::new()), connector.clone());
        (listener, connector)
    }

    fn snapshot(service: &str, addresses: &[&str]) -> UrlChangeWrapper {
        UrlChangeWrapper::new(service, addresses.iter().map(|a| a.to_string()).collect())
    }

    fn hosts(pool: &[Arc<ConnectionRecord>]) -> Vec<String> {
        pool.iter().map(|r| r.address().to_string()).collect()
    }

    #[tokio::test]
    async fn test_order_service_convergence() {
        let (listener, connector) = setup(ScriptedConnector::default());
        listener
            .reconcile(&snapshot("OrderService", &["10.0.0.1:20880", "10.0.0.2:20880"]))
            .await;
        let before = listener.pool().get("OrderService").await;
        let old_a = before[0].clone();
        let old_b = before[1].clone();

        let outcome = listener
            .reconcile(&snapshot("OrderService", &["10.0.0.2:20880", "10.0.0.3:20880"]))
            .await;

        let after = listener.pool().get("OrderService").await;
        assert_eq!(hosts(&after), vec!["10.0.0.2:20880", "10.0.0.3:20880"]);
        assert!(Arc::ptr_eq(&after[0], &old_b));
        assert!(!old_a.is_open());
        assert!(after.iter().all(|r| r.is_open()));
        assert_eq!(outcome.retained, 1);
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.retired, 1);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 3);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unchanged_topology_opens_nothing() {
        let (listener, connector) = setup(ScriptedConnector::default());
        let update = snapshot("svc", &["a:1", "b:2"]);
        listener.reconcile(&update).await;
        let outcome = listener.reconcile(&update).await;

        assert!(outcome.is_noop());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(listener.pool().len("svc").await, 2);
    }

    #[tokio::test]
    async fn test_partial_failure_commits_successes() {
        let (listener, connector) = setup(ScriptedConnector::refusing(&["bad"]));
        let outcome = listener
            .reconcile(&snapshot("svc", &["a:1", "bad:2", "c:3"]))
            .await;

        assert_eq!(hosts(&listener.pool().get("svc").await), vec!["a:1", "c:3"]);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].is_per_address());

        // a later pass picks the address up once it accepts connections
        connector.refuse.lock().unwrap().clear();
        let outcome = listener
            .reconcile(&snapshot("svc", &["a:1", "bad:2", "c:3"]))
            .await;
        assert_eq!(outcome.added, 1);
        assert_eq!(listener.pool().len("svc").await, 3);
    }

    #[tokio::test]
    async fn test_empty_snapshot_empties_pool() {
        let (listener, connector) = setup(ScriptedConnector::default());
        listener.reconcile(&snapshot("svc", &["a:1", "b:2"])).await;
        let outcome = listener.reconcile(&snapshot("svc", &[])).await;

        assert_eq!(outcome.retired, 2);
        assert!(listener.pool().get("svc").await.is_empty());
        assert!(listener.pool().contains("svc").await);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_snapshot_for_untracked_service() {
        let (listener, _) = setup(ScriptedConnector::default());
        let outcome = listener.reconcile(&snapshot("svc", &[])).await;
        assert!(outcome.is_noop());
        assert!(!listener.pool().contains("svc").await);
    }

    #[tokio::test]
    async fn test_duplicates_and_malformed_addresses() {
        let (listener, connector) = setup(ScriptedConnector::default());
        let outcome = listener
            .reconcile(&snapshot("svc", &["a:1", "a:1", "garbage", "b:x", "b:2"]))
            .await;

        assert_eq!(hosts(&listener.pool().get("svc").await), vec!["a:1", "b:2"]);
        assert_eq!(outcome.malformed, 2);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_connection_is_reestablished() {
        let (listener, connector) = setup(ScriptedConnector::default());
        listener.reconcile(&snapshot("svc", &["a:1"])).await;
        listener.pool().get("svc").await[0].close().await;

        let outcome = listener.reconcile(&snapshot("svc", &["a:1"])).await;
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.retired, 1);
        assert!(listener.pool().get("svc").await[0].is_open());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_on_event_updates_metrics() {
        let metrics = DiscoveryMetrics::new().unwrap();
        let listener = ServiceUpdateListener::new(
            Arc::new(ConnectionPool::new()),
            Arc::new(ScriptedConnector::refusing(&["bad"])),
        )
        .with_metrics(metrics.clone());

        let event = Event::ServiceUpdate(snapshot("svc", &["a:1", "bad:2"]));
        listener.on_event(&event).await.unwrap();

        assert_eq!(metrics.pool_connections.with_label_values(&["svc"]).get(), 1);
        assert_eq!(
            metrics.connect_failures_total.with_label_values(&["svc"]).get(),
            1.0
        );
    }

    /// Connects instantly except to host `slow`, which waits for the gate.
    struct GatedConnector {
        entered: Arc<tokio::sync::Notify>,
        gate: Arc<tokio::sync::Notify>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(&self, address: &ProviderAddress) -> Result<Box<dyn Connection>> {
            if address.host == "slow" {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            Ok(Box::new(FakeConnection {
                open: AtomicBool::new(true),
                closes: self.closes.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_slow_connect_blocks_neither_other_services_nor_readers() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        let pool = Arc::new(ConnectionPool::new());
        let listener = Arc::new(ServiceUpdateListener::new(
            pool.clone(),
            Arc::new(GatedConnector {
                entered: entered.clone(),
                gate: gate.clone(),
                closes: Arc::new(AtomicUsize::new(0)),
            }),
        ));
        listener.reconcile(&snapshot("A", &["a:1"])).await;

        let pending = tokio::spawn({
            let listener = listener.clone();
            async move { listener.reconcile(&snapshot("A", &["a:1", "slow:2"])).await }
        });
        entered.notified().await;

        let within = std::time::Duration::from_secs(1);
        let outcome = tokio::time::timeout(within, listener.reconcile(&snapshot("B", &["b:1"])))
            .await
            .expect("reconcile of B waited on A's connect");
        assert_eq!(outcome.added, 1);
        let readable = tokio::time::timeout(within, pool.get("A"))
            .await
            .expect("pool read waited on A's connect");
        assert_eq!(hosts(&readable), vec!["a:1"]);
        let selected = tokio::time::timeout(within, pool.select("A"))
            .await
            .expect("select waited on A's connect")
            .unwrap();
        assert_eq!(selected.address().to_string(), "a:1");
        assert!(!pending.is_finished());

        gate.notify_one();
        let outcome = pending.await.unwrap();
        assert_eq!(outcome.retained, 1);
        assert_eq!(outcome.added, 1);
        assert_eq!(hosts(&pool.get("A").await), vec!["a:1", "slow:2"]);
        assert_eq!(hosts(&pool.get("B").await), vec!["b:1"]);
    }
}
