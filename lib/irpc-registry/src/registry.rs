//! Provider registration and consumer subscription over a coordination store

use crate::client::CoordinationClient;
use crate::config::RegistryConfig;
use crate::watcher::ProviderWatcher;
use crate::{RegistryError, Result};
use irpc_core::url::{provider_dir, service_name_from_path};
use irpc_core::{EventBus, Url};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry operations, one call per provider/consumer lifecycle event.
#[async_trait::async_trait]
pub trait RegistryService: Send + Sync {
    async fn register(&self, url: &Url) -> Result<()>;

    async fn un_register(&self, url: &Url) -> Result<()>;

    async fn subscribe(&self, url: &Url) -> Result<()>;

    async fn un_subscribe(&self, url: &Url) -> Result<()>;

    /// Current `host:port` children of the service's provider path,
    /// read straight from the store.
    async fn get_provider_ips(&self, service_name: &str) -> Result<Vec<String>>;
}

#[derive(Clone, Debug)]
struct Subscription {
    url: Url,
    node_path: String,
}

/// ServiceRegistry maps registry operations onto coordination-store nodes
/// and owns one watch loop per subscribed service.
pub struct ServiceRegistry {
    client: Arc<dyn CoordinationClient>,
    bus: Arc<EventBus>,
    config: RegistryConfig,
    registered: RwLock<HashSet<Url>>,
    // keyed by consumer node prefix
    subscribed: RwLock<HashMap<String, Subscription>>,
    // keyed by provider directory
    watches: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ServiceRegistry {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        bus: Arc<EventBus>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            client,
            bus,
            config,
            registered: RwLock::new(HashSet::new()),
            subscribed: RwLock::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &str {
        &self.config.root
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    async fn ensure_persistent(&self, path: &str) -> Result<()> {
        if self.client.exist_node(path).await? {
            return Ok(());
        }
        match self.client.create_persistent_data(path, "").await {
            // lost a creation race with another process
            Ok(()) | Err(RegistryError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_if_present(&self, path: &str) -> Result<()> {
        match self.client.delete_node(path).await {
            Ok(()) | Err(RegistryError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn do_register(&self, url: &Url, path: &str) -> Result<()> {
        self.ensure_persistent(&self.config.root).await?;
        let value = url.to_provider_string()?;
        if self.client.exist_node(path).await? {
            debug!("Removing stale provider node {}", path);
            self.delete_if_present(path).await?;
        }
        self.client.create_temporary_data(path, &value).await
    }

    async fn do_subscribe(&self, url: &Url, prefix: &str) -> Result<String> {
        self.ensure_persistent(&self.config.root).await?;
        let value = url.to_consumer_string()?;
        // only our own earlier node; siblings with the same prefix belong to
        // other live consumers on the same host
        let previous = self
            .subscribed
            .read()
            .await
            .get(prefix)
            .map(|s| s.node_path.clone());
        if let Some(stale) = previous {
            debug!("Removing previous consumer node {}", stale);
            self.delete_if_present(&stale).await?;
        }
        if self.client.exist_node(prefix).await? {
            debug!("Removing stale consumer node {}", prefix);
            self.delete_if_present(prefix).await?;
        }
        self.client.create_temporary_seq_data(prefix, &value).await
    }

    /// Arm the provider watch for the subscribed service, once per service.
    pub async fn do_after_subscribe(&self, url: &Url) -> Result<()> {
        let path = provider_dir(&self.config.root, url.service_name());
        let mut watches = self.watches.lock().await;
        if let Some(handle) = watches.get(&path) {
            if !handle.is_finished() {
                debug!("Provider watch on {} already running", path);
                return Ok(());
            }
        }

        self.ensure_persistent(&path).await?;
        let service_name = service_name_from_path(&self.config.root, &path)
            .ok_or_else(|| RegistryError::InvalidPath(path.clone()))?
            .to_string();
        let watcher = ProviderWatcher::new(
            self.client.clone(),
            self.bus.clone(),
            path.clone(),
            service_name,
            self.config.watch_backoff.clone(),
            self.config.initial_snapshot,
        );
        watches.insert(path, tokio::spawn(watcher.run()));
        Ok(())
    }

    /// Full provider node values for a service, keyed by `host:port`.
    pub async fn get_provider_nodes(&self, service_name: &str) -> Result<Vec<(String, String)>> {
        let dir = provider_dir(&self.config.root, service_name);
        let mut nodes = Vec::new();
        for child in self.get_provider_ips(service_name).await? {
            match self.client.get_node_data(&format!("{dir}/{child}")).await {
                Ok(value) => nodes.push((child, value)),
                // vanished between list and read
                Err(RegistryError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(nodes)
    }

    pub async fn registered_urls(&self) -> Vec<Url> {
        self.registered.read().await.iter().cloned().collect()
    }

    pub async fn subscribed_urls(&self) -> Vec<Url> {
        self.subscribed
            .read()
            .await
            .values()
            .map(|s| s.url.clone())
            .collect()
    }

    /// Consumer node created for a subscription, if any.
    pub async fn consumer_node(&self, url: &Url) -> Option<String> {
        let prefix = url.consumer_path(&self.config.root).ok()?;
        self.subscribed
            .read()
            .await
            .get(&prefix)
            .map(|s| s.node_path.clone())
    }

    pub async fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.watches.lock().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Stop every watch loop.
    pub async fn shutdown(&self) {
        let mut watches = self.watches.lock().await;
        for (path, handle) in watches.drain() {
            debug!("Stopping watch on {}", path);
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl RegistryService for ServiceRegistry {
    async fn register(&self, url: &Url) -> Result<()> {
        let path = url.provider_path(&self.config.root)?;
        self.do_register(url, &path)
            .await
            .map_err(|e| RegistryError::Registration {
                path: path.clone(),
                source: Box::new(e),
            })?;
        self.registered.write().await.insert(url.clone());
        info!("Registered provider {}", path);
        Ok(())
    }

    async fn un_register(&self, url: &Url) -> Result<()> {
        let path = url.provider_path(&self.config.root)?;
        self.delete_if_present(&path).await?;
        self.registered.write().await.remove(url);
        info!("Unregistered provider {}", path);
        Ok(())
    }

    async fn subscribe(&self, url: &Url) -> Result<()> {
        let prefix = url.consumer_path(&self.config.root)?;
        let node_path = self
            .do_subscribe(url, &prefix)
            .await
            .map_err(|e| RegistryError::Subscription {
                path: prefix.clone(),
                source: Box::new(e),
            })?;
        self.subscribed.write().await.insert(
            prefix,
            Subscription {
                url: url.clone(),
                node_path: node_path.clone(),
            },
        );
        info!("Subscribed consumer {}", node_path);
        self.do_after_subscribe(url).await
    }

    async fn un_subscribe(&self, url: &Url) -> Result<()> {
        let prefix = url.consumer_path(&self.config.root)?;
        let subscription = self.subscribed.write().await.remove(&prefix);
        match subscription {
            Some(subscription) => {
                self.delete_if_present(&subscription.node_path).await?;
                info!("Unsubscribed consumer {}", subscription.node_path);
            }
            None => warn!("No subscription to remove for {}", prefix),
        }
        Ok(())
    }

    async fn get_provider_ips(&self, service_name: &str) -> Result<Vec<String>> {
        let dir = provider_dir(&self.config.root, service_name);
        match self.client.get_children_data(&dir).await {
            Ok(children) => Ok(children),
            Err(RegistryError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryClient, MemoryStore};
    use irpc_core::{CoreError, Event, EventKind, EventListener, UrlChangeWrapper};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<UrlChangeWrapper>);

    #[async_trait::async_trait]
    impl EventListener for Forward {
        async fn on_event(&self, event: &Event) -> irpc_core::Result<()> {
            let Event::ServiceUpdate(update) = event;
            self.0
                .send(update.clone())
                .map_err(|e| CoreError::Internal(e.to_string()))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        client: Arc<MemoryClient>,
        registry: ServiceRegistry,
        updates: mpsc::UnboundedReceiver<UrlChangeWrapper>,
    }

    async fn harness(config: RegistryConfig) -> Harness {
        let store = MemoryStore::new();
        let client = Arc::new(store.connect());
        let bus = Arc::new(EventBus::new());
        let (tx, updates) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::ServiceUpdate, Arc::new(Forward(tx))).await;
        let registry = ServiceRegistry::new(client.clone(), bus, config);
        Harness {
            store,
            client,
            registry,
            updates,
        }
    }

    fn no_initial() -> RegistryConfig {
        RegistryConfig {
            initial_snapshot: false,
            ..RegistryConfig::default()
        }
    }

    async fn next_update(updates: &mut mpsc::UnboundedReceiver<UrlChangeWrapper>) -> UrlChangeWrapper {
        tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("timed out waiting for topology update")
            .expect("update channel closed")
    }

    async fn wait_for_watch(store: &MemoryStore, path: &str) {
        for _ in 0..200 {
            if store.armed_watches(path) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watch on {path} never armed");
    }

    #[tokio::test]
    async fn test_register_creates_ephemeral_provider() {
        let h = harness(RegistryConfig::default()).await;
        let url = Url::new("OrderService", "shop", "10.0.0.1", 20880);
        h.registry.register(&url).await.unwrap();

        let value = h
            .client
            .get_node_data("/irpc/OrderService/provider/10.0.0.1:20880")
            .await
            .unwrap();
        assert!(value.starts_with("shop;OrderService;10.0.0.1:20880;"));
        assert_eq!(
            h.registry.get_provider_ips("OrderService").await.unwrap(),
            vec!["10.0.0.1:20880".to_string()]
        );
        assert_eq!(h.registry.registered_urls().await, vec![url]);
    }

    #[tokio::test]
    async fn test_register_replaces_stale_node() {
        let h = harness(RegistryConfig::default()).await;
        let old_session = h.store.connect();
        old_session
            .create_persistent_data("/irpc/S/provider/h:1", "stale")
            .await
            .unwrap();

        h.registry.register(&Url::new("S", "app", "h", 1)).await.unwrap();
        let nodes = h.registry.get_provider_nodes("S").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_ne!(nodes[0].1, "stale");
    }

    #[tokio::test]
    async fn test_register_fails_when_store_unreachable() {
        let h = harness(RegistryConfig::default()).await;
        h.store.set_available(false);
        let err = h
            .registry
            .register(&Url::new("S", "app", "h", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Registration { .. }));
        assert!(err.is_unavailable());
        assert!(h.registry.registered_urls().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_and_unsubscribe_are_idempotent() {
        let h = harness(no_initial()).await;
        let url = Url::new("S", "app", "h", 1);
        let before = h.store.node_count();

        h.registry.un_register(&url).await.unwrap();
        h.registry.un_subscribe(&url).await.unwrap();
        assert_eq!(h.store.node_count(), before);

        h.registry.register(&url).await.unwrap();
        h.registry.un_register(&url).await.unwrap();
        h.registry.un_register(&url).await.unwrap();
        assert!(h.registry.get_provider_ips("S").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_creates_sequential_consumer() {
        let h = harness(no_initial()).await;
        let url = Url::new("S", "app", "10.0.0.9", 0);
        h.registry.subscribe(&url).await.unwrap();

        let node = h.registry.consumer_node(&url).await.unwrap();
        assert!(node.starts_with("/irpc/S/consumer/app:10.0.0.9:"));
        assert!(h.client.exist_node(&node).await.unwrap());
        assert_eq!(h.registry.watched_paths().await, vec!["/irpc/S/provider".to_string()]);

        // resubscribing replaces our own earlier node and keeps a single watch
        h.registry.subscribe(&url).await.unwrap();
        let children = h.client.get_children_data("/irpc/S/consumer").await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(!h.client.exist_node(&node).await.unwrap());
        assert_eq!(h.registry.watched_paths().await.len(), 1);

        h.registry.un_subscribe(&url).await.unwrap();
        assert!(h
            .client
            .get_children_data("/irpc/S/consumer")
            .await
            .unwrap()
            .is_empty());
        assert!(h.registry.subscribed_urls().await.is_empty());
        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_consumers_on_same_host_keep_their_nodes() {
        let store = MemoryStore::new();
        let first = ServiceRegistry::new(Arc::new(store.connect()), Arc::new(EventBus::new()), no_initial());
        let second = ServiceRegistry::new(Arc::new(store.connect()), Arc::new(EventBus::new()), no_initial());
        let observer = store.connect();
        let url = Url::new("S", "app", "10.0.0.9", 0);

        first.subscribe(&url).await.unwrap();
        second.subscribe(&url).await.unwrap();
        let first_node = first.consumer_node(&url).await.unwrap();
        let second_node = second.consumer_node(&url).await.unwrap();
        assert_eq!(first_node, "/irpc/S/consumer/app:10.0.0.9:0000000000");
        assert_eq!(second_node, "/irpc/S/consumer/app:10.0.0.9:0000000001");
        assert!(observer.exist_node(&first_node).await.unwrap());
        assert!(observer.exist_node(&second_node).await.unwrap());

        // resubscribing and unsubscribing touch only the caller's node
        second.subscribe(&url).await.unwrap();
        assert!(observer.exist_node(&first_node).await.unwrap());
        assert!(!observer.exist_node(&second_node).await.unwrap());
        second.un_subscribe(&url).await.unwrap();
        assert_eq!(
            observer.get_children_data("/irpc/S/consumer").await.unwrap(),
            vec!["app:10.0.0.9:0000000000".to_string()]
        );

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_rearms_for_every_notification() {
        let mut h = harness(no_initial()).await;
        h.registry.subscribe(&Url::new("S", "app", "c", 0)).await.unwrap();
        let provider_path = "/irpc/S/provider";
        let providers = h.store.connect();

        for i in 1..=5u16 {
            wait_for_watch(&h.store, provider_path).await;
            providers
                .create_temporary_data(&format!("{provider_path}/10.0.0.{i}:20880"), "v")
                .await
                .unwrap();
            let update = next_update(&mut h.updates).await;
            assert_eq!(update.service_name, "S");
            assert_eq!(update.provider_urls.len(), i as usize);
        }

        wait_for_watch(&h.store, provider_path).await;
        providers.close();
        let update = next_update(&mut h.updates).await;
        assert!(update.provider_urls.is_empty());
        assert!(h.updates.try_recv().is_err());
        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_initial_snapshot_published() {
        let mut h = harness(RegistryConfig::default()).await;
        let providers = h.store.connect();
        providers
            .create_temporary_data("/irpc/S/provider/a:1", "v")
            .await
            .unwrap();

        h.registry.subscribe(&Url::new("S", "app", "c", 0)).await.unwrap();
        let update = next_update(&mut h.updates).await;
        assert_eq!(update.provider_urls, vec!["a:1".to_string()]);
        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_recovers_after_connection_loss() {
        let mut config = no_initial();
        config.watch_backoff.initial_ms = 5;
        config.watch_backoff.max_ms = 20;
        let mut h = harness(config).await;
        h.registry.subscribe(&Url::new("S", "app", "c", 0)).await.unwrap();
        wait_for_watch(&h.store, "/irpc/S/provider").await;

        h.store.set_available(false);
        let providers = h.store.connect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.store.set_available(true);
        providers
            .create_temporary_data("/irpc/S/provider/a:1", "v")
            .await
            .unwrap();

        // the recovery snapshot and/or the change notification must show a:1
        let mut seen = next_update(&mut h.updates).await;
        while seen.provider_urls.is_empty() {
            seen = next_update(&mut h.updates).await;
        }
        assert_eq!(seen.provider_urls, vec!["a:1".to_string()]);
        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_provider_ips_unknown_service() {
        let h = harness(RegistryConfig::default()).await;
        assert!(h.registry.get_provider_ips("nope").await.unwrap().is_empty());
    }
}
