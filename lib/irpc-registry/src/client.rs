//! Capability interface over the external coordination store

use crate::{RegistryError, Result};
use tokio::sync::oneshot;

/// What changed on a watched node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    ChildrenChanged,
    NodeDeleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// Receives at most one event. A closed channel means the session that
/// armed the watch was lost.
pub type ChildWatch = oneshot::Receiver<WatchedEvent>;

/// Parent of an absolute node path, `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Absolute, no trailing slash, no empty segments.
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(RegistryError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Operations the registry needs from a coordination store.
///
/// Create operations create missing parent nodes as persistent nodes.
#[async_trait::async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn exist_node(&self, path: &str) -> Result<bool>;

    async fn create_persistent_data(&self, path: &str, data: &str) -> Result<()>;

    /// Create a node removed automatically when this client's session ends.
    async fn create_temporary_data(&self, path: &str, data: &str) -> Result<()>;

    /// Create an ephemeral node named `path_prefix` plus a unique,
    /// monotonically increasing suffix. Returns the full path created.
    async fn create_temporary_seq_data(&self, path_prefix: &str, data: &str) -> Result<String>;

    async fn delete_node(&self, path: &str) -> Result<()>;

    /// Child node names (not full paths), sorted.
    async fn get_children_data(&self, path: &str) -> Result<Vec<String>>;

    async fn get_node_data(&self, path: &str) -> Result<String>;

    /// Arm a one-shot watch on the children of `path`.
    async fn watch_child_node_data(&self, path: &str) -> Result<ChildWatch>;

    /// End the session now instead of waiting for it to time out.
    async fn close_session(&self) -> Result<()> {
        Ok(())
    }
}
