use anyhow::Result;
use irpc_core::{
    ConnectionPool, DiscoveryMetrics, EventBus, EventKind, ServiceUpdateListener, TcpConnector, Url,
};
use irpc_registry::{
    CoordinationClient, EtcdClient, MemoryStore, RegistryService, ServiceRegistry, StoreConfig,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::DiscoveryConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting irpc-discovery...");

    let config = DiscoveryConfig::load()?;
    info!("Registry root: {}", config.registry.root);
    info!("  - Store: {:?}", config.store);
    info!("  - Connect timeout: {:?}", config.connector.connect_timeout());
    info!("  - Providers: {}", config.providers.len());
    info!("  - Subscriptions: {}", config.subscriptions.len());

    let memory = MemoryStore::new();
    let metrics = DiscoveryMetrics::new()?;

    // Provider side: its own session, like a separate provider process
    let provider_session = open_session(&config.store, &memory).await?;
    let provider_registry = ServiceRegistry::new(
        provider_session.clone(),
        Arc::new(EventBus::new()),
        config.registry.clone(),
    );
    let mut provider_urls = Vec::new();
    for entry in &config.providers {
        if entry.serve {
            serve_provider(&config.host, entry.port).await?;
        }
        let url = Url::new(&entry.service, &config.application, &config.host, entry.port);
        provider_registry.register(&url).await?;
        provider_urls.push(url);
    }

    // Consumer side: pool + reconciliation listener wired through the bus
    let pool = Arc::new(ConnectionPool::new());
    let bus = Arc::new(EventBus::new());
    let connector = Arc::new(TcpConnector::new(config.connector.clone()));
    let listener = ServiceUpdateListener::new(pool.clone(), connector).with_metrics(metrics.clone());
    bus.subscribe(EventKind::ServiceUpdate, Arc::new(listener)).await;

    let consumer_session = open_session(&config.store, &memory).await?;
    let consumer_registry = ServiceRegistry::new(
        consumer_session.clone(),
        bus,
        config.registry.clone(),
    );
    let mut consumer_urls = Vec::new();
    for service in &config.subscriptions {
        let url = Url::new(service, &config.application, &config.host, 0);
        consumer_registry.subscribe(&url).await?;
        consumer_urls.push(url);
    }

    let mut ticker = tokio::time::interval(config.report_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => report(&pool, &consumer_registry, &metrics).await,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received, exiting...");
                break;
            }
        }
    }

    for url in &consumer_urls {
        if let Err(e) = consumer_registry.un_subscribe(url).await {
            warn!("Failed to unsubscribe {}: {}", url.service_name(), e);
        }
    }
    consumer_registry.shutdown().await;
    for url in &provider_urls {
        if let Err(e) = provider_registry.un_register(url).await {
            warn!("Failed to unregister {}: {}", url.service_name(), e);
        }
    }
    for session in [consumer_session, provider_session] {
        if let Err(e) = session.close_session().await {
            warn!("Failed to close coordination session: {}", e);
        }
    }

    Ok(())
}

/// Open one coordination session on the configured store.
async fn open_session(
    store: &StoreConfig,
    memory: &Arc<MemoryStore>,
) -> Result<Arc<dyn CoordinationClient>> {
    let session: Arc<dyn CoordinationClient> = match store {
        StoreConfig::Memory => {
            warn!("Using the in-process memory store; registrations are visible to this process only");
            Arc::new(memory.connect())
        }
        StoreConfig::Etcd(etcd) => {
            info!("Connecting to etcd at {:?}", etcd.endpoints);
            Arc::new(EtcdClient::connect(etcd).await?)
        }
    };
    Ok(session)
}

/// Accept and hold connections on a provider port.
async fn serve_provider(host: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("Serving provider listener on {}", listener.local_addr()?);
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Provider on port {} accepted {}", port, peer);
                    held.push(stream);
                }
                Err(e) => {
                    error!("Provider listener on port {} failed: {}", port, e);
                    break;
                }
            }
        }
    });
    Ok(())
}

async fn report(pool: &ConnectionPool, registry: &ServiceRegistry, metrics: &DiscoveryMetrics) {
    for service in pool.services().await {
        let connections = pool.get(&service).await;
        let addresses: Vec<String> = connections.iter().map(|r| r.address().to_string()).collect();
        info!("Service {} has {} connections: {:?}", service, connections.len(), addresses);

        match registry.get_provider_ips(&service).await {
            Ok(ips) if ips.len() != connections.len() => {
                warn!("Service {} lists {} providers but {} are connected", service, ips.len(), connections.len());
            }
            Ok(_) => {}
            Err(e) => error!("Failed to read providers of {}: {}", service, e),
        }
    }

    match metrics.gather_text() {
        Ok(text) => debug!("Metrics:\n{}", text),
        Err(e) => warn!("Failed to gather metrics: {}", e),
    }
}
