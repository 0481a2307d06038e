//! In-process coordination store with session-bound ephemeral nodes
//!
//! Behaves like a single-server ZooKeeper: every [`MemoryClient`] is a
//! session, ephemeral nodes die with their session, sequential nodes get a
//! per-parent counter suffix, and child watches fire once.

use crate::client::{
    parent_of, validate_path, ChildWatch, CoordinationClient, WatchEventKind, WatchedEvent,
};
use crate::{RegistryError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type SessionId = u64;

#[derive(Clone, Debug)]
struct Node {
    data: String,
    owner: Option<SessionId>,
}

struct Watch {
    session: SessionId,
    sender: oneshot::Sender<WatchedEvent>,
}

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    child_watches: HashMap<String, Vec<Watch>>,
    live_sessions: HashSet<SessionId>,
    next_session: SessionId,
    unavailable: bool,
}

impl StoreState {
    fn check(&self, session: SessionId) -> Result<()> {
        if self.unavailable {
            return Err(RegistryError::StoreUnavailable("connection lost".to_string()));
        }
        if !self.live_sessions.contains(&session) {
            return Err(RegistryError::StoreUnavailable(format!("session {session} closed")));
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(watches) = self.child_watches.remove(path) {
            for watch in watches {
                let _ = watch.sender.send(WatchedEvent {
                    path: path.to_string(),
                    kind,
                });
            }
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(parent) = current {
            if self.exists(parent) {
                break;
            }
            missing.push(parent.to_string());
            current = parent_of(parent);
        }
        for parent in missing.into_iter().rev() {
            self.insert(parent, String::new(), None);
        }
    }

    fn insert(&mut self, path: String, data: String, owner: Option<SessionId>) {
        let parent = parent_of(&path).map(str::to_string);
        self.nodes.insert(path, Node { data, owner });
        if let Some(parent) = parent {
            self.fire(&parent, WatchEventKind::ChildrenChanged);
        }
    }

    fn create(&mut self, path: &str, data: &str, owner: Option<SessionId>) -> Result<()> {
        validate_path(path)?;
        if self.exists(path) {
            return Err(RegistryError::NodeExists(path.to_string()));
        }
        let ephemeral_parent = parent_of(path)
            .and_then(|parent| self.nodes.get(parent).map(|node| (parent, node)))
            .filter(|(_, node)| node.owner.is_some());
        if let Some((parent, _)) = ephemeral_parent {
            return Err(RegistryError::EphemeralParent(parent.to_string()));
        }
        self.ensure_parents(path);
        self.insert(path.to_string(), data.to_string(), owner);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        if !self.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(RegistryError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        self.fire(path, WatchEventKind::NodeDeleted);
        if let Some(parent) = parent_of(path) {
            let parent = parent.to_string();
            self.fire(&parent, WatchEventKind::ChildrenChanged);
        }
        Ok(())
    }

    fn drop_watches(&mut self, session: Option<SessionId>) {
        for watches in self.child_watches.values_mut() {
            watches.retain(|w| session.is_some_and(|s| w.session != s));
        }
        self.child_watches.retain(|_, watches| !watches.is_empty());
    }
}

/// Shared state behind every session of the store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // state is always left consistent, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new session.
    pub fn connect(self: &Arc<Self>) -> MemoryClient {
        let mut state = self.lock();
        state.next_session += 1;
        let session = state.next_session;
        state.live_sessions.insert(session);
        debug!("Opened coordination session {}", session);
        MemoryClient {
            store: self.clone(),
            session,
        }
    }

    /// Simulate losing (or regaining) connectivity. Losing it breaks every
    /// armed watch; sessions and their ephemeral nodes survive.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.unavailable = !available;
        if !available {
            state.drop_watches(None);
        }
    }

    /// End a session: its ephemeral nodes are deleted and its watches broken.
    pub fn expire_session(&self, session: SessionId) {
        let mut state = self.lock();
        if !state.live_sessions.remove(&session) {
            return;
        }
        state.drop_watches(Some(session));
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            if let Err(e) = state.remove(path) {
                warn!("Failed to remove ephemeral node {} of session {}: {}", path, session, e);
            }
        }
        debug!("Expired coordination session {} ({} ephemeral nodes)", session, owned.len());
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn armed_watches(&self, path: &str) -> usize {
        self.lock().child_watches.get(path).map(Vec::len).unwrap_or(0)
    }
}

/// One session against a [`MemoryStore`].
pub struct MemoryClient {
    store: Arc<MemoryStore>,
    session: SessionId,
}

impl MemoryClient {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn close(&self) {
        self.store.expire_session(self.session);
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait::async_trait]
impl CoordinationClient for MemoryClient {
    async fn exist_node(&self, path: &str) -> Result<bool> {
        let state = self.store.lock();
        state.check(self.session)?;
        Ok(state.exists(path))
    }

    async fn create_persistent_data(&self, path: &str, data: &str) -> Result<()> {
        let mut state = self.store.lock();
        state.check(self.session)?;
        state.create(path, data, None)
    }

    async fn create_temporary_data(&self, path: &str, data: &str) -> Result<()> {
        let mut state = self.store.lock();
        state.check(self.session)?;
        state.create(path, data, Some(self.session))
    }

    async fn create_temporary_seq_data(&self, path_prefix: &str, data: &str) -> Result<String> {
        let mut state = self.store.lock();
        state.check(self.session)?;
        validate_path(path_prefix)?;
        let parent = parent_of(path_prefix)
            .ok_or_else(|| RegistryError::InvalidPath(path_prefix.to_string()))?
            .to_string();
        let counter = state.sequences.entry(parent).or_insert(0);
        let path = format!("{path_prefix}{:010}", *counter);
        *counter += 1;
        state.create(&path, data, Some(self.session))?;
        Ok(path)
    }

    async fn delete_node(&self, path: &str) -> Result<()> {
        let mut state = self.store.lock();
        state.check(self.session)?;
        state.remove(path)
    }

    async fn get_children_data(&self, path: &str) -> Result<Vec<String>> {
        let state = self.store.lock();
        state.check(self.session)?;
        if !state.exists(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        Ok(state.children(path))
    }

    async fn get_node_data(&self, path: &str) -> Result<String> {
        let state = self.store.lock();
        state.check(self.session)?;
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))
    }

    async fn watch_child_node_data(&self, path: &str) -> Result<ChildWatch> {
        let mut state = self.store.lock();
        state.check(self.session)?;
        if !state.exists(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        let (sender, receiver) = oneshot::channel();
        state
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(Watch {
                session: self.session,
                sender,
            });
        Ok(receiver)
    }

    async fn close_session(&self) -> Result<()> {
        self.close();
        Ok(())
    }
}
