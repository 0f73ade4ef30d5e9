//! Container runtime interface.
//!
//! The master launches one container per descriptor through this narrow
//! interface. [`LocalRuntime`] is the in-process implementation: each
//! "container" is a broker task sharing the process-local coordination
//! store, which is what single-host runs and the integration tests use.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerSpec};
use crate::config::ProgramConfig;
use crate::error::{Error, Result};
use crate::schema::ContainerType;
use crate::store::CoordinationStore;

/// Everything a runtime needs to launch one container's broker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub service_name: String,
    pub container_type: ContainerType,
    pub container_path: String,
    pub conf_path: String,
    pub naming_root: String,
    pub shutdown_path: String,
}

impl LaunchSpec {
    fn broker_spec(&self) -> BrokerSpec {
        BrokerSpec {
            service_name: self.service_name.clone(),
            container_path: self.container_path.clone(),
            conf_path: self.conf_path.clone(),
            naming_root: self.naming_root.clone(),
            shutdown_path: self.shutdown_path.clone(),
        }
    }
}

/// Narrow interface to whatever runs the containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_container(&self, spec: &LaunchSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn list_containers(&self) -> Result<Vec<String>>;
}

struct LocalContainer {
    spec: LaunchSpec,
    handle: Option<JoinHandle<Result<()>>>,
}

/// Runs every broker as a task in this process over a shared store.
pub struct LocalRuntime {
    store: Arc<dyn CoordinationStore>,
    config: ProgramConfig,
    containers: Mutex<HashMap<String, LocalContainer>>,
}

impl LocalRuntime {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ProgramConfig) -> Self {
        Self {
            store,
            config,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for every launched broker to finish, returning per-service
    /// results.
    pub async fn join_all(&self) -> Vec<(String, Result<()>)> {
        let handles: Vec<(String, JoinHandle<Result<()>>)> = {
            let mut containers = self.containers.lock();
            containers
                .iter_mut()
                .filter_map(|(id, c)| c.handle.take().map(|h| (id.clone(), h)))
                .collect()
        };
        let mut results = Vec::new();
        for (id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Fatal(format!("broker task for '{}' panicked: {}", id, e))),
            };
            results.push((id, result));
        }
        results
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn create_container(&self, spec: &LaunchSpec) -> Result<String> {
        let id = spec.service_name.clone();
        let mut containers = self.containers.lock();
        if containers.contains_key(&id) {
            return Err(Error::Runtime(format!("container '{}' already exists", id)));
        }
        containers.insert(
            id.clone(),
            LocalContainer {
                spec: spec.clone(),
                handle: None,
            },
        );
        tracing::info!("Created container: {}", id);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let broker = {
            let containers = self.containers.lock();
            let container = containers
                .get(id)
                .ok_or_else(|| Error::Runtime(format!("no such container: {}", id)))?;
            Broker::new(
                Arc::clone(&self.store),
                self.config.clone(),
                container.spec.broker_spec(),
            )
        };
        let handle = tokio::spawn(broker.run());
        if let Some(container) = self.containers.lock().get_mut(id) {
            container.handle = Some(handle);
        }
        tracing::info!("Started container: {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let handle = {
            let mut containers = self.containers.lock();
            containers
                .get_mut(id)
                .ok_or_else(|| Error::Runtime(format!("no such container: {}", id)))?
                .handle
                .take()
        };
        let Some(handle) = handle else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!("Container '{}' did not stop within {:?}", id, timeout);
                Err(Error::Timeout(format!("stopping container '{}'", id)))
            }
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        if let Some(container) = self.containers.lock().remove(id) {
            if let Some(handle) = container.handle {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.containers.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
