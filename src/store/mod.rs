//! Coordination-store abstraction.
//!
//! The store is a hierarchical, watch-based key/value service (ZooKeeper
//! style). Brokers and the master talk to it exclusively through
//! [`StoreSession`], so the concrete client library stays behind this
//! boundary. The crate ships one implementation, [`MemoryStore`], an
//! in-process store with real session semantics used by tests and
//! single-host deployments.
//!
//! Watches are one-shot: a watch armed by `exists`/`get_data` fires at most
//! once and the caller re-arms it. Transient failures (`ConnectionLoss`)
//! never escape this module's callers; they re-invoke the same operation,
//! with [`check_and_create`] covering the one non-idempotent case.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Outcome classification for store operations.
///
/// `ConnectionLoss` is the only transient kind: callers retry the same
/// operation. `SessionExpired` is terminal for the session; recovery means
/// a fresh connect plus re-creation of ephemeral state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no node at {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("connection to the coordination store was lost")]
    ConnectionLoss,

    #[error("coordination-store session expired")]
    SessionExpired,

    #[error("version mismatch at {0}")]
    BadVersion(String),

    #[error("coordination store failure: {0}")]
    Other(String),
}

impl StoreError {
    /// Transient errors are retried by re-invoking the same operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Node persistence class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Survives the creating session.
    Persistent,
    /// Deleted when the creating session dies.
    Ephemeral,
}

/// Metadata returned by reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub version: i32,
}

/// Connection state reported to session watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

/// Event delivered to a one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    NodeCreated(String),
    NodeDeleted(String),
    NodeDataChanged(String),
    SessionStateChanged(SessionState),
}

impl WatchEvent {
    pub fn path(&self) -> Option<&str> {
        match self {
            WatchEvent::NodeCreated(p)
            | WatchEvent::NodeDeleted(p)
            | WatchEvent::NodeDataChanged(p) => Some(p),
            WatchEvent::SessionStateChanged(_) => None,
        }
    }
}

/// Registration handle for watch delivery. Cloned freely; events arrive on
/// the receiving half owned by the watching component.
pub type Watch = mpsc::UnboundedSender<WatchEvent>;

/// Delete version that matches any node version.
pub const ANY_VERSION: i32 = -1;

/// One live client session against the store.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Creates a node, returning its path.
    async fn create(&self, path: &str, data: &[u8], kind: NodeKind) -> StoreResult<String>;

    /// Checks node existence, optionally arming a watch for creation,
    /// deletion or data change.
    async fn exists(&self, path: &str, watch: Option<Watch>) -> StoreResult<Option<NodeStat>>;

    /// Reads node data, optionally arming a watch for deletion or data change.
    async fn get_data(&self, path: &str, watch: Option<Watch>) -> StoreResult<Vec<u8>>;

    /// Writes node data. `version` of [`ANY_VERSION`] matches any version.
    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> StoreResult<NodeStat>;

    /// Deletes a node. `version` of [`ANY_VERSION`] matches any version.
    async fn delete(&self, path: &str, version: i32) -> StoreResult<()>;

    /// Registers a watcher for session-state changes.
    fn register(&self, watch: Watch);

    /// Closes the session, deleting every ephemeral node it owns.
    async fn close(&self);

    fn is_alive(&self) -> bool;
}

/// A reachable coordination store; sessions are opened against it.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn connect(&self, session_timeout: Duration) -> StoreResult<Arc<dyn StoreSession>>;
}

/// Delay between retries of a transiently-failed operation.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Re-invokes `op` until it returns something other than a transient error.
pub async fn with_retry<T, F, Fut>(what: &str, op: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                tracing::warn!("Connection loss during {}. Retrying...", what);
                tokio::time::sleep(RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}

/// Idempotent create.
///
/// A create that fails with `ConnectionLoss` may or may not have been applied.
/// This wrapper reads the node back and compares payloads to decide ownership:
/// `Ok(true)` means the node exists with our payload (created now or by an
/// earlier attempt), `Ok(false)` means a foreign payload holds the path.
pub async fn check_and_create(
    session: &dyn StoreSession,
    path: &str,
    data: &[u8],
    kind: NodeKind,
) -> StoreResult<bool> {
    loop {
        match session.create(path, data, kind).await {
            Ok(_) => return Ok(true),
            Err(StoreError::ConnectionLoss) | Err(StoreError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
        match session.get_data(path, None).await {
            Ok(found) => return Ok(found == data),
            // Deleted between the attempts: create again.
            Err(StoreError::NoNode(_)) => continue,
            Err(e) if e.is_transient() => {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_and_create_owns_fresh_node() {
        let store = MemoryStore::new();
        let session = store.connect(Duration::from_secs(5)).await.unwrap();
        let owned = check_and_create(session.as_ref(), "/n", b"id-1", NodeKind::Ephemeral)
            .await
            .unwrap();
        assert!(owned);
    }

    #[tokio::test]
    async fn check_and_create_is_idempotent_for_own_payload() {
        let store = MemoryStore::new();
        let session = store.connect(Duration::from_secs(5)).await.unwrap();
        session
            .create("/n", b"id-1", NodeKind::Ephemeral)
            .await
            .unwrap();
        let owned = check_and_create(session.as_ref(), "/n", b"id-1", NodeKind::Ephemeral)
            .await
            .unwrap();
        assert!(owned);
    }

    #[tokio::test]
    async fn check_and_create_refuses_foreign_payload() {
        let store = MemoryStore::new();
        let first = store.connect(Duration::from_secs(5)).await.unwrap();
        first
            .create("/n", b"id-1", NodeKind::Ephemeral)
            .await
            .unwrap();
        let second = store.connect(Duration::from_secs(5)).await.unwrap();
        let owned = check_and_create(second.as_ref(), "/n", b"id-2", NodeKind::Ephemeral)
            .await
            .unwrap();
        assert!(!owned);
    }
}
