//! Typed publish/subscribe for topology changes

use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, span, Instrument, Level};

/// Full provider membership of one service at the moment a watch fired.
#[derive(Clone, Debug, PartialEq)]
pub struct UrlChangeWrapper {
    pub service_name: String,
    /// Every `host:port` child of the provider path, not a delta
    pub provider_urls: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl UrlChangeWrapper {
    pub fn new(service_name: impl Into<String>, provider_urls: Vec<String>) -> Self {
        Self {
            service_name: service_name.into(),
            provider_urls,
            observed_at: Utc::now(),
        }
    }
}

/// Event kinds listeners can register for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServiceUpdate,
}

#[derive(Clone, Debug)]
pub enum Event {
    ServiceUpdate(UrlChangeWrapper),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ServiceUpdate(_) => EventKind::ServiceUpdate,
        }
    }
}

/// Receives events of the kinds it was subscribed for.
#[async_trait::async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedListener"
    }

    async fn on_event(&self, event: &Event) -> Result<()>;
}

/// EventBus dispatches each event to every listener of its kind, in
/// registration order. Failed listeners are logged and not retried.
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Arc<dyn EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, kind: EventKind, listener: Arc<dyn EventListener>) {
        debug!("Listener {} subscribed to {:?}", listener.name(), kind);
        self.listeners
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Invoke all listeners for the event and wait for them to return.
    ///
    /// Returns the number of listeners that completed without error.
    pub async fn publish(&self, event: &Event) -> usize {
        // clone out so listeners run without holding the registry lock
        let listeners = match self.listeners.read().await.get(&event.kind()) {
            Some(listeners) => listeners.clone(),
            None => {
                debug!("No listeners for {:?}", event.kind());
                return 0;
            }
        };

        let mut delivered = 0;
        for listener in listeners {
            let span = span!(Level::DEBUG, "listener", name = listener.name());
            match listener.on_event(event).instrument(span).await {
                Ok(()) => delivered += 1,
                Err(e) => error!("Listener {} failed on {:?}: {}", listener.name(), event.kind(), e),
            }
        }
        delivered
    }

    pub async fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .await
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
