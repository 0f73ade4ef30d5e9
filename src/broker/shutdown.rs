//! Dependency-aware coordinated shutdown.
//!
//! A container may only tear down once every service that depends on it has
//! already gone. The coordinator watches the naming node of each reverse
//! dependency and gates the stop group on their disappearance, then drains,
//! deletes the persistent configuration node and closes the session, which
//! in turn cascades shutdown to anything still watching this container.

use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::naming::NamingService;
use crate::process::ProcessManager;
use crate::store::{with_retry, StoreError, StoreSession, WatchEvent, ANY_VERSION};
use crate::tasks::TaskHandler;

pub(super) struct ShutdownCoordinator {
    service_name: String,
    session: Option<Arc<dyn StoreSession>>,
    naming: NamingService,
    /// Service names that depend on this container.
    dependents: Vec<String>,
    conf_path: String,
    proc_manager: Option<Arc<tokio::sync::Mutex<ProcessManager>>>,
    task_handler: Option<Arc<TaskHandler>>,
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        service_name: String,
        session: Option<Arc<dyn StoreSession>>,
        naming: NamingService,
        dependents: Vec<String>,
        conf_path: String,
        proc_manager: Option<Arc<tokio::sync::Mutex<ProcessManager>>>,
        task_handler: Option<Arc<TaskHandler>>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            service_name,
            session,
            naming,
            dependents,
            conf_path,
            proc_manager,
            task_handler,
            notify,
        }
    }

    pub(super) async fn run(self) {
        self.wait_dependents().await;

        if let Some(manager) = &self.proc_manager {
            let mut manager = manager.lock().await;
            manager.exec_stop().await;
            manager.stop_main().await;
        }
        if let Some(tasks) = &self.task_handler {
            tasks.exec_post_stop_tasks().await;
        }

        self.notify.notify_waiters();

        self.delete_conf_node().await;

        if let Some(session) = &self.session {
            session.close().await;
        }
        tracing::info!("Broker shutdown complete: {}", self.service_name);
    }

    /// Blocks until every reverse dependency's naming node is gone. Nodes
    /// already absent count immediately; the rest are awaited through
    /// deletion watches. Data changes re-arm the one-shot watch.
    async fn wait_dependents(&self) {
        if self.dependents.is_empty() {
            tracing::info!("No dependent services");
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        tracing::info!(
            "Waiting for {} dependent services to shut down",
            self.dependents.len()
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut remaining = 0usize;
        for name in &self.dependents {
            let path = self.naming.service_path(name);
            match with_retry("watching dependent service", || {
                session.exists(&path, Some(tx.clone()))
            })
            .await
            {
                Ok(Some(_)) => {
                    tracing::info!("Watch set for shutdown of dependent service: {}", path);
                    remaining += 1;
                }
                Ok(None) => {
                    tracing::info!("Dependent service already gone: {}", path);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot watch dependent service: {}", path);
                }
            }
        }

        while remaining > 0 {
            match rx.recv().await {
                Some(WatchEvent::NodeDeleted(path)) => {
                    tracing::info!("Dependent service shutdown completed: {}", path);
                    remaining -= 1;
                }
                Some(WatchEvent::NodeDataChanged(path)) => {
                    // One-shot watch consumed by a status change; re-arm.
                    match with_retry("re-watching dependent service", || {
                        session.exists(&path, Some(tx.clone()))
                    })
                    .await
                    {
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => {
                            tracing::info!("Dependent service gone: {}", path);
                            remaining -= 1;
                        }
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    /// Deletes the persistent configuration node so a subsequent run starts
    /// clean.
    async fn delete_conf_node(&self) {
        let Some(session) = &self.session else {
            return;
        };
        match with_retry("deleting configuration node", || {
            session.delete(&self.conf_path, ANY_VERSION)
        })
        .await
        {
            Ok(()) => tracing::info!("Deleted node: {}", self.conf_path),
            Err(StoreError::NoNode(_)) => {
                tracing::info!("Node already deleted: {}", self.conf_path)
            }
            Err(e) => tracing::error!(error = %e, "Cannot delete node: {}", self.conf_path),
        }
    }
}
