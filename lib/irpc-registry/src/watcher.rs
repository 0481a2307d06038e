//! Long-lived loop that keeps a one-shot child watch armed

use crate::client::{ChildWatch, CoordinationClient, WatchEventKind};
use crate::config::WatchBackoff;
use crate::{RegistryError, Result};
use irpc_core::{Event, EventBus, UrlChangeWrapper};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// ProviderWatcher owns the watch on one service's provider directory.
///
/// Each iteration arms a fresh watch, reads the full child list and
/// publishes it, then waits for the watch to fire. Arming before reading
/// means a change landing between the two is never lost. A failed read is
/// retried with backoff (re-arming first) before waiting again, so the
/// topology that fired the watch is always published.
pub struct ProviderWatcher {
    client: Arc<dyn CoordinationClient>,
    bus: Arc<EventBus>,
    path: String,
    service_name: String,
    backoff: WatchBackoff,
    initial_snapshot: bool,
}

impl ProviderWatcher {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        bus: Arc<EventBus>,
        path: String,
        service_name: String,
        backoff: WatchBackoff,
        initial_snapshot: bool,
    ) -> Self {
        Self {
            client,
            bus,
            path,
            service_name,
            backoff,
            initial_snapshot,
        }
    }

    /// Runs until the task is aborted.
    pub async fn run(self) {
        info!("Watching providers of {} at {}", self.service_name, self.path);
        let mut publish = self.initial_snapshot;
        let mut read_failures = 0u32;
        loop {
            let watch = self.arm().await;
            if publish {
                if let Err(e) = self.publish_snapshot().await {
                    let delay = self.backoff.delay(read_failures);
                    error!(
                        "Failed to read providers of {} (attempt {}): {}; retrying in {:?}",
                        self.service_name,
                        read_failures + 1,
                        e,
                        delay
                    );
                    read_failures = read_failures.saturating_add(1);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                read_failures = 0;
            }
            publish = true;

            match watch.await {
                Ok(event) => {
                    debug!("Watch fired on {}: {:?}", event.path, event.kind);
                    if event.kind == WatchEventKind::NodeDeleted {
                        warn!("Provider directory {} was deleted", self.path);
                    }
                }
                Err(_) => {
                    error!(
                        "Lost watch on {}: coordination session dropped, re-subscribing",
                        self.path
                    );
                }
            }
        }
    }

    /// Arm a watch, retrying with backoff until the store accepts it.
    async fn arm(&self) -> ChildWatch {
        let mut attempt = 0u32;
        loop {
            match self.client.watch_child_node_data(&self.path).await {
                Ok(watch) => {
                    if attempt > 0 {
                        info!("Re-armed watch on {} after {} attempts", self.path, attempt + 1);
                    }
                    return watch;
                }
                Err(RegistryError::NoNode(_)) => {
                    warn!("Provider directory {} missing, recreating", self.path);
                    match self.client.create_persistent_data(&self.path, "").await {
                        Ok(()) | Err(RegistryError::NodeExists(_)) => continue,
                        Err(e) => self.fail(&e, &mut attempt).await,
                    }
                }
                Err(e) => self.fail(&e, &mut attempt).await,
            }
        }
    }

    async fn fail(&self, e: &RegistryError, attempt: &mut u32) {
        let delay = self.backoff.delay(*attempt);
        error!(
            "Failed to arm watch on {} (attempt {}): {}; retrying in {:?}",
            self.path,
            *attempt + 1,
            e,
            delay
        );
        *attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }

    async fn publish_snapshot(&self) -> Result<()> {
        let children = self.client.get_children_data(&self.path).await?;
        debug!("{} has {} providers", self.service_name, children.len());
        let event = Event::ServiceUpdate(UrlChangeWrapper::new(&self.service_name, children));
        self.bus.publish(&event).await;
        Ok(())
    }
}
