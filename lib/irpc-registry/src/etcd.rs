//! etcd-backed coordination client
//!
//! Nodes are keys named by their full path. A node's children are the keys
//! one level below `{path}/`. Ephemeral nodes are put with this client's
//! session lease, which a background task keeps alive; when the lease
//! lapses etcd deletes them. Sequential suffixes come from a per-parent
//! counter key kept outside the node tree and bumped in the same
//! transaction that creates the node.

use crate::client::{
    parent_of, validate_path, ChildWatch, CoordinationClient, WatchEventKind, WatchedEvent,
};
use crate::config::EtcdConfig;
use crate::{RegistryError, Result};
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, KeyValue,
    LeaseGrantOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Counter keys live under this prefix, which never starts with `/`.
const SEQUENCE_KEY_PREFIX: &str = "irpc-seq:";
const MAX_SEQUENCE_ATTEMPTS: usize = 16;

fn unavailable(action: &str, e: etcd_client::Error) -> RegistryError {
    RegistryError::StoreUnavailable(format!("Failed to {action}: {e}"))
}

fn sequence_key(parent: &str) -> String {
    format!("{SEQUENCE_KEY_PREFIX}{parent}")
}

fn children_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

/// Name of the direct child of `prefix` that `key` lives in, if any.
fn child_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let name = rest.split('/').next().unwrap_or(rest);
    (!name.is_empty()).then_some(name)
}

fn is_direct_child(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

fn key_of(kv: &KeyValue) -> Result<&str> {
    kv.key_str()
        .map_err(|e| RegistryError::Serialization(format!("key is not UTF-8: {e}")))
}

fn value_of(kv: &KeyValue) -> Result<&str> {
    kv.value_str()
        .map_err(|e| RegistryError::Serialization(format!("value is not UTF-8: {e}")))
}

/// One session against an etcd cluster.
pub struct EtcdClient {
    client: Client,
    lease_id: Arc<AtomicI64>,
    keep_alive: JoinHandle<()>,
}

impl EtcdClient {
    /// Connect and open a session lease of `session_ttl_secs`.
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        config.validate()?;
        let options = ConnectOptions::new()
            .with_timeout(config.connect_timeout())
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));
        let mut client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| unavailable("connect to etcd", e))?;

        let lease = client
            .lease_grant(config.session_ttl_secs, Some(LeaseGrantOptions::new()))
            .await
            .map_err(|e| unavailable("grant session lease", e))?;
        info!(
            "Connected to etcd {:?} with session lease {:x} (ttl {}s)",
            config.endpoints,
            lease.id(),
            lease.ttl()
        );

        let lease_id = Arc::new(AtomicI64::new(lease.id()));
        let keep_alive = tokio::spawn(keep_session_alive(
            client.clone(),
            lease_id.clone(),
            config.session_ttl_secs,
            config.keep_alive_interval(),
        ));

        Ok(Self {
            client,
            lease_id,
            keep_alive,
        })
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id.load(Ordering::SeqCst)
    }

    fn client(&self) -> Client {
        self.client.clone()
    }

    async fn get_kv(&self, path: &str) -> Result<Option<KeyValue>> {
        let response = self
            .client()
            .get(path, None)
            .await
            .map_err(|e| unavailable("read node", e))?;
        Ok(response.kvs().first().cloned())
    }

    async fn count_children(&self, path: &str) -> Result<i64> {
        let options = GetOptions::new().with_prefix().with_count_only();
        let response = self
            .client()
            .get(children_prefix(path), Some(options))
            .await
            .map_err(|e| unavailable("count children", e))?;
        Ok(response.count())
    }

    /// Put `path` only if it does not exist yet. Returns whether it was created.
    async fn put_if_absent(&self, path: &str, data: &str, lease: Option<i64>) -> Result<bool> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::version(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(path, data, options)]);
        let response = self
            .client()
            .txn(txn)
            .await
            .map_err(|e| unavailable("create node", e))?;
        Ok(response.succeeded())
    }

    /// Create missing ancestors of `path` as persistent nodes, refusing an
    /// ephemeral direct parent.
    async fn ensure_parents(&self, path: &str) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(parent) = current {
            if parent == "/" {
                break;
            }
            match self.get_kv(parent).await? {
                Some(kv) if missing.is_empty() && kv.lease() != 0 => {
                    return Err(RegistryError::EphemeralParent(parent.to_string()));
                }
                Some(_) => break,
                None => missing.push(parent.to_string()),
            }
            current = parent_of(parent);
        }
        for parent in missing.into_iter().rev() {
            // a concurrent creator winning the race is fine
            self.put_if_absent(&parent, "", None).await?;
        }
        Ok(())
    }

    async fn create(&self, path: &str, data: &str, lease: Option<i64>) -> Result<()> {
        validate_path(path)?;
        self.ensure_parents(path).await?;
        if !self.put_if_absent(path, data, lease).await? {
            return Err(RegistryError::NodeExists(path.to_string()));
        }
        Ok(())
    }
}

impl Drop for EtcdClient {
    fn drop(&mut self) {
        // the lease runs out on its own once nobody refreshes it
        self.keep_alive.abort();
    }
}

/// Refresh the session lease until aborted. A lease that has already
/// expired is replaced by a new one; nodes of the old lease are gone.
async fn keep_session_alive(mut client: Client, lease_id: Arc<AtomicI64>, ttl: i64, interval: Duration) {
    loop {
        let id = lease_id.load(Ordering::SeqCst);
        match client.lease_keep_alive(id).await {
            Ok((mut keeper, mut stream)) => loop {
                if let Err(e) = keeper.keep_alive().await {
                    error!("Failed to refresh session lease {:x}: {}", id, e);
                    break;
                }
                match stream.message().await {
                    Ok(Some(response)) if response.ttl() > 0 => {
                        debug!("Session lease {:x} refreshed (ttl {}s)", id, response.ttl());
                    }
                    Ok(Some(_)) => {
                        error!("Session lease {:x} expired, its ephemeral nodes are gone", id);
                        match client.lease_grant(ttl, Some(LeaseGrantOptions::new())).await {
                            Ok(lease) => {
                                info!("Opened new session lease {:x}", lease.id());
                                lease_id.store(lease.id(), Ordering::SeqCst);
                            }
                            Err(e) => error!("Failed to grant session lease: {}", e),
                        }
                        break;
                    }
                    Ok(None) => {
                        warn!("Keep-alive stream for lease {:x} closed", id);
                        break;
                    }
                    Err(e) => {
                        error!("Keep-alive stream for lease {:x} failed: {}", id, e);
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            },
            Err(e) => error!("Failed to open keep-alive for lease {:x}: {}", id, e),
        }
        tokio::time::sleep(interval).await;
    }
}

#[async_trait::async_trait]
impl CoordinationClient for EtcdClient {
    async fn exist_node(&self, path: &str) -> Result<bool> {
        if path == "/" {
            return Ok(true);
        }
        let response = self
            .client()
            .get(path, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(|e| unavailable("check node", e))?;
        Ok(response.count() > 0)
    }

    async fn create_persistent_data(&self, path: &str, data: &str) -> Result<()> {
        self.create(path, data, None).await
    }

    async fn create_temporary_data(&self, path: &str, data: &str) -> Result<()> {
        self.create(path, data, Some(self.lease_id())).await
    }

    async fn create_temporary_seq_data(&self, path_prefix: &str, data: &str) -> Result<String> {
        validate_path(path_prefix)?;
        let parent = parent_of(path_prefix)
            .ok_or_else(|| RegistryError::InvalidPath(path_prefix.to_string()))?;
        self.ensure_parents(path_prefix).await?;
        let counter_key = sequence_key(parent);

        for _ in 0..MAX_SEQUENCE_ATTEMPTS {
            let (version, next) = match self.get_kv(&counter_key).await? {
                Some(kv) => {
                    let next = value_of(&kv)?.parse::<u64>().map_err(|e| {
                        RegistryError::Serialization(format!("sequence counter {counter_key}: {e}"))
                    })?;
                    (kv.version(), next)
                }
                None => (0, 0),
            };
            let path = format!("{path_prefix}{next:010}");
            let txn = Txn::new()
                .when(vec![
                    Compare::version(counter_key.as_str(), CompareOp::Equal, version),
                    Compare::version(path.as_str(), CompareOp::Equal, 0),
                ])
                .and_then(vec![
                    TxnOp::put(counter_key.as_str(), (next + 1).to_string(), None),
                    TxnOp::put(
                        path.as_str(),
                        data,
                        Some(PutOptions::new().with_lease(self.lease_id())),
                    ),
                ]);
            let response = self
                .client()
                .txn(txn)
                .await
                .map_err(|e| unavailable("create sequential node", e))?;
            if response.succeeded() {
                return Ok(path);
            }
            debug!("Sequence counter {} moved, retrying", counter_key);
        }
        Err(RegistryError::StoreUnavailable(format!(
            "no free sequence under {parent} after {MAX_SEQUENCE_ATTEMPTS} attempts"
        )))
    }

    async fn delete_node(&self, path: &str) -> Result<()> {
        if self.count_children(path).await? > 0 {
            return Err(RegistryError::NotEmpty(path.to_string()));
        }
        let response = self
            .client()
            .delete(path, Some(DeleteOptions::new()))
            .await
            .map_err(|e| unavailable("delete node", e))?;
        if response.deleted() == 0 {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        Ok(())
    }

    async fn get_children_data(&self, path: &str) -> Result<Vec<String>> {
        if !self.exist_node(path).await? {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        let prefix = children_prefix(path);
        let response = self
            .client()
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix().with_keys_only()))
            .await
            .map_err(|e| unavailable("list children", e))?;

        let mut children = BTreeSet::new();
        for kv in response.kvs() {
            if let Some(name) = child_name(&prefix, key_of(kv)?) {
                children.insert(name.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }

    async fn get_node_data(&self, path: &str) -> Result<String> {
        match self.get_kv(path).await? {
            Some(kv) => Ok(value_of(&kv)?.to_string()),
            None => Err(RegistryError::NoNode(path.to_string())),
        }
    }

    async fn watch_child_node_data(&self, path: &str) -> Result<ChildWatch> {
        let response = self
            .client()
            .get(path, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(|e| unavailable("check node", e))?;
        if path != "/" && response.count() == 0 {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        // changes after the revision we just observed are not missed
        let revision = response.header().map(|h| h.revision()).unwrap_or(0);

        let prefix = children_prefix(path);
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (mut watcher, mut stream) = self
            .client()
            .watch(prefix.as_str(), Some(options))
            .await
            .map_err(|e| unavailable("watch children", e))?;

        let (mut sender, receiver) = oneshot::channel();
        let path = path.to_string();
        tokio::spawn(async move {
            let fired = loop {
                tokio::select! {
                    _ = sender.closed() => break None,
                    message = stream.message() => match message {
                        Ok(Some(response)) if response.canceled() => {
                            warn!("Watch on {} canceled by etcd: {}", path, response.cancel_reason());
                            break None;
                        }
                        Ok(Some(response)) => {
                            let changed = response.events().iter().any(|event| {
                                event
                                    .kv()
                                    .and_then(|kv| kv.key_str().ok())
                                    .is_some_and(|key| is_direct_child(&prefix, key))
                            });
                            if changed {
                                break Some(WatchedEvent {
                                    path: path.clone(),
                                    kind: WatchEventKind::ChildrenChanged,
                                });
                            }
                        }
                        Ok(None) => break None,
                        Err(e) => {
                            warn!("Watch on {} failed: {}", path, e);
                            break None;
                        }
                    }
                }
            };
            if let Err(e) = watcher.cancel().await {
                debug!("Failed to cancel watch on {}: {}", path, e);
            }
            // dropping the sender unfired tells the waiter the watch is gone
            if let Some(event) = fired {
                let _ = sender.send(event);
            }
        });
        Ok(receiver)
    }

    async fn close_session(&self) -> Result<()> {
        self.keep_alive.abort();
        let id = self.lease_id();
        self.client()
            .lease_revoke(id)
            .await
            .map_err(|e| unavailable("revoke session lease", e))?;
        info!("Revoked session lease {:x}", id);
        Ok(())
    }
}
