//! In-process coordination store.
//!
//! Implements the full session model: ephemeral nodes are reaped when their
//! owning session closes or expires, watches are one-shot and scoped to the
//! arming session, and expiry can be induced to exercise recovery paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{
    CoordinationStore, NodeKind, NodeStat, SessionState, StoreError, StoreResult, StoreSession,
    Watch, WatchEvent, ANY_VERSION,
};

struct Node {
    data: Vec<u8>,
    version: i32,
    /// Owning session for ephemeral nodes; None for persistent ones.
    owner: Option<u64>,
}

struct SessionMeta {
    alive: bool,
    watchers: Vec<Watch>,
}

#[derive(Default)]
struct StoreInner {
    nodes: HashMap<String, Node>,
    /// One-shot watches per path, tagged with the arming session.
    watches: HashMap<String, Vec<(u64, Watch)>>,
    sessions: HashMap<u64, SessionMeta>,
    next_session_id: u64,
}

impl StoreInner {
    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(armed) = self.watches.remove(path) {
            for (session_id, watch) in armed {
                let alive = self
                    .sessions
                    .get(&session_id)
                    .map(|s| s.alive)
                    .unwrap_or(false);
                // A dead session's watches are lost with it.
                if alive {
                    let _ = watch.send(event.clone());
                }
            }
        }
    }

    fn arm(&mut self, session_id: u64, path: &str, watch: Option<Watch>) {
        if let Some(watch) = watch {
            self.watches
                .entry(path.to_string())
                .or_default()
                .push((session_id, watch));
        }
    }

    /// Removes every ephemeral node owned by `session_id`, firing deletion
    /// watches for each.
    fn reap_session(&mut self, session_id: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.fire(&path, WatchEvent::NodeDeleted(path.clone()));
        }
    }

    fn end_session(&mut self, session_id: u64, state: SessionState) {
        let watchers = match self.sessions.get_mut(&session_id) {
            Some(meta) if meta.alive => {
                meta.alive = false;
                std::mem::take(&mut meta.watchers)
            }
            _ => return,
        };
        self.reap_session(session_id);
        if state == SessionState::Expired {
            for watch in watchers {
                let _ = watch.send(WatchEvent::SessionStateChanged(state));
            }
        }
    }
}

/// An in-process, watch-based hierarchical key/value store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expires the session owning the node at `path`, reaping every ephemeral
    /// node that session holds. Returns false when no live session owns the
    /// path. Used to induce session-loss scenarios.
    pub fn expire_owner(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        let owner = match inner.nodes.get(path).and_then(|n| n.owner) {
            Some(owner) => owner,
            None => return false,
        };
        inner.end_session(owner, SessionState::Expired);
        true
    }

    /// Current payload of a node, if present. Inspection hook for tests and
    /// diagnostics; goes around session semantics on purpose.
    pub fn peek(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().nodes.get(path).map(|n| n.data.clone())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn connect(&self, _session_timeout: Duration) -> StoreResult<Arc<dyn StoreSession>> {
        let mut inner = self.inner.lock();
        let id = inner.next_session_id;
        inner.next_session_id += 1;
        inner.sessions.insert(
            id,
            SessionMeta {
                alive: true,
                watchers: Vec::new(),
            },
        );
        drop(inner);
        tracing::debug!(session = id, "Coordination-store session established");
        Ok(Arc::new(MemorySession {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }
}

pub struct MemorySession {
    id: u64,
    inner: Arc<Mutex<StoreInner>>,
}

impl MemorySession {
    fn check_alive(inner: &StoreInner, id: u64) -> StoreResult<()> {
        match inner.sessions.get(&id) {
            Some(meta) if meta.alive => Ok(()),
            _ => Err(StoreError::SessionExpired),
        }
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn create(&self, path: &str, data: &[u8], kind: NodeKind) -> StoreResult<String> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner, self.id)?;
        if inner.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        let owner = match kind {
            NodeKind::Ephemeral => Some(self.id),
            NodeKind::Persistent => None,
        };
        inner.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 0,
                owner,
            },
        );
        inner.fire(path, WatchEvent::NodeCreated(path.to_string()));
        Ok(path.to_string())
    }

    async fn exists(&self, path: &str, watch: Option<Watch>) -> StoreResult<Option<NodeStat>> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner, self.id)?;
        inner.arm(self.id, path, watch);
        Ok(inner.nodes.get(path).map(|n| NodeStat { version: n.version }))
    }

    async fn get_data(&self, path: &str, watch: Option<Watch>) -> StoreResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner, self.id)?;
        match inner.nodes.get(path) {
            Some(node) => {
                let data = node.data.clone();
                inner.arm(self.id, path, watch);
                Ok(data)
            }
            None => Err(StoreError::NoNode(path.to_string())),
        }
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> StoreResult<NodeStat> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner, self.id)?;
        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if version != ANY_VERSION && version != node.version {
            return Err(StoreError::BadVersion(path.to_string()));
        }
        node.data = data.to_vec();
        node.version += 1;
        let stat = NodeStat {
            version: node.version,
        };
        inner.fire(path, WatchEvent::NodeDataChanged(path.to_string()));
        Ok(stat)
    }

    async fn delete(&self, path: &str, version: i32) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner, self.id)?;
        let node = inner
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if version != ANY_VERSION && version != node.version {
            return Err(StoreError::BadVersion(path.to_string()));
        }
        inner.nodes.remove(path);
        inner.fire(path, WatchEvent::NodeDeleted(path.to_string()));
        Ok(())
    }

    fn register(&self, watch: Watch) {
        let mut inner = self.inner.lock();
        if let Some(meta) = inner.sessions.get_mut(&self.id) {
            if meta.alive {
                meta.watchers.push(watch);
            }
        }
    }

    async fn close(&self) {
        let mut inner = self.inner.lock();
        inner.end_session(self.id, SessionState::Disconnected);
        tracing::debug!(session = self.id, "Coordination-store session closed");
    }

    fn is_alive(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(&self.id)
            .map(|s| s.alive)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn session(store: &MemoryStore) -> Arc<dyn StoreSession> {
        store.connect(Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_read() {
        let store = MemoryStore::new();
        let s = session(&store).await;
        s.create("/a", b"one", NodeKind::Persistent).await.unwrap();
        assert_eq!(s.get_data("/a", None).await.unwrap(), b"one");
        assert!(matches!(
            s.create("/a", b"two", NodeKind::Persistent).await,
            Err(StoreError::NodeExists(_))
        ));
    }

    #[tokio::test]
    async fn watches_are_one_shot() {
        let store = MemoryStore::new();
        let s = session(&store).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(s.exists("/a", Some(tx)).await.unwrap().is_none());
        s.create("/a", b"x", NodeKind::Persistent).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::NodeCreated("/a".to_string())
        );

        // Not re-armed: a second change produces no second event.
        s.set_data("/a", b"y", ANY_VERSION).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn data_watch_fires_on_change_and_delete() {
        let store = MemoryStore::new();
        let s = session(&store).await;
        s.create("/a", b"x", NodeKind::Persistent).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        s.get_data("/a", Some(tx.clone())).await.unwrap();
        s.set_data("/a", b"y", ANY_VERSION).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::NodeDataChanged("/a".to_string())
        );

        s.get_data("/a", Some(tx)).await.unwrap();
        s.delete("/a", ANY_VERSION).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::NodeDeleted("/a".to_string())
        );
    }

    #[tokio::test]
    async fn close_reaps_ephemerals_only() {
        let store = MemoryStore::new();
        let owner = session(&store).await;
        owner.create("/e", b"x", NodeKind::Ephemeral).await.unwrap();
        owner
            .create("/p", b"x", NodeKind::Persistent)
            .await
            .unwrap();

        let observer = session(&store).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        observer.exists("/e", Some(tx)).await.unwrap();

        owner.close().await;
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::NodeDeleted("/e".to_string())
        );
        assert!(observer.exists("/e", None).await.unwrap().is_none());
        assert!(observer.exists("/p", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expiry_notifies_registered_watcher() {
        let store = MemoryStore::new();
        let s = session(&store).await;
        s.create("/e", b"x", NodeKind::Ephemeral).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        s.register(tx);
        assert!(store.expire_owner("/e"));
        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::SessionStateChanged(SessionState::Expired)
        );
        assert!(!s.is_alive());
        assert!(matches!(
            s.get_data("/e", None).await,
            Err(StoreError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn dead_session_watches_are_dropped() {
        let store = MemoryStore::new();
        let dying = session(&store).await;
        dying.create("/mine", b"x", NodeKind::Ephemeral).await.unwrap();

        let other = session(&store).await;
        other.create("/a", b"x", NodeKind::Persistent).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        dying.get_data("/a", Some(tx)).await.unwrap();
        assert!(store.expire_owner("/mine"));

        other.set_data("/a", b"y", ANY_VERSION).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn version_checks() {
        let store = MemoryStore::new();
        let s = session(&store).await;
        s.create("/a", b"x", NodeKind::Persistent).await.unwrap();
        let stat = s.set_data("/a", b"y", 0).await.unwrap();
        assert_eq!(stat.version, 1);
        assert!(matches!(
            s.set_data("/a", b"z", 0).await,
            Err(StoreError::BadVersion(_))
        ));
        assert!(matches!(
            s.delete("/a", 7).await,
            Err(StoreError::BadVersion(_))
        ));
        s.delete("/a", 1).await.unwrap();
    }
}
