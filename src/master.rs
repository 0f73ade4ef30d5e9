//! The application driver.
//!
//! One master per application: it validates the schema, publishes one
//! configuration node per container, launches the containers through the
//! runtime and signals application-wide shutdown by creating the shutdown
//! node. Brokers coordinate everything else among themselves.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ProgramConfig, StoreLayout};
use crate::dependency::Analyzer;
use crate::error::{Error, Result};
use crate::naming::{NamingService, ServiceNode, ServiceStatus};
use crate::runtime::{ContainerRuntime, LaunchSpec};
use crate::schema::{AppSchema, ContainerDescriptor};
use crate::store::{with_retry, CoordinationStore, NodeKind, StoreError, StoreSession, ANY_VERSION};

/// Poll interval while waiting for brokers to drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Master {
    config: ProgramConfig,
    layout: StoreLayout,
    store: Arc<dyn CoordinationStore>,
    runtime: Arc<dyn ContainerRuntime>,
    naming: NamingService,
    containers: Vec<ContainerDescriptor>,
}

impl Master {
    /// Builds a master from a parsed schema. The schema is analyzed here:
    /// duplicate names, unknown dependencies or dependency cycles refuse the
    /// launch, and the reverse dependency edges are derived.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: ProgramConfig,
        layout: StoreLayout,
        schema: AppSchema,
    ) -> Result<Self> {
        let mut containers = schema.containers;
        Analyzer::new().analyze(&mut containers)?;
        let naming = NamingService::new(layout.naming_root());
        Ok(Self {
            config,
            layout,
            store,
            runtime,
            naming,
            containers,
        })
    }

    pub fn containers(&self) -> &[ContainerDescriptor] {
        &self.containers
    }

    async fn connect(&self) -> Result<Arc<dyn StoreSession>> {
        let connect = self.store.connect(self.config.session_timeout);
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(session) => Ok(session?),
            Err(_) => Err(Error::Timeout(
                "connecting to the coordination store".to_string(),
            )),
        }
    }

    fn launch_spec(&self, container: &ContainerDescriptor) -> LaunchSpec {
        LaunchSpec {
            service_name: container.service_name.clone(),
            container_type: container.container_type,
            container_path: self
                .layout
                .container_path(container.container_type, &container.service_name),
            conf_path: self.layout.conf_path(&container.service_name),
            naming_root: self.layout.naming_root(),
            shutdown_path: self.layout.shutdown_path(),
        }
    }

    /// Launches the application: store tree prepared, one configuration node
    /// published per container, one container started per descriptor.
    pub async fn start(&self) -> Result<()> {
        let session = self.connect().await?;

        for path in self.layout.parent_paths() {
            match with_retry("creating parent node", || {
                session.create(&path, &[], NodeKind::Persistent)
            })
            .await
            {
                Ok(_) => tracing::debug!("Created node: {}", path),
                Err(StoreError::NodeExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        // A shutdown node left over from a previous run would tear the new
        // application down immediately.
        let shutdown_path = self.layout.shutdown_path();
        match with_retry("clearing shutdown node", || {
            session.delete(&shutdown_path, ANY_VERSION)
        })
        .await
        {
            Ok(()) => tracing::info!("Cleared stale shutdown node"),
            Err(StoreError::NoNode(_)) => {}
            Err(e) => return Err(e.into()),
        }

        for container in &self.containers {
            let path = self.layout.conf_path(&container.service_name);
            let data = container.to_bytes()?;
            match with_retry("publishing configuration node", || {
                session.create(&path, &data, NodeKind::Persistent)
            })
            .await
            {
                Ok(_) => tracing::info!("Published configuration: {}", path),
                Err(StoreError::NodeExists(_)) => {
                    // Leftover from an unclean shutdown; refresh the payload.
                    with_retry("refreshing configuration node", || {
                        session.set_data(&path, &data, ANY_VERSION)
                    })
                    .await?;
                    tracing::info!("Refreshed configuration: {}", path);
                }
                Err(e) => return Err(e.into()),
            }
        }

        for container in &self.containers {
            let spec = self.launch_spec(container);
            let id = self.runtime.create_container(&spec).await?;
            self.runtime.start_container(&id).await?;
            tracing::info!(
                "Launched container '{}' ({})",
                container.service_name,
                container.container_type
            );
        }

        session.close().await;
        Ok(())
    }

    /// Signals application-wide shutdown by creating the shutdown node.
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let session = self.connect().await?;
        let path = self.layout.shutdown_path();
        let result = match with_retry("creating shutdown node", || {
            session.create(&path, &[], NodeKind::Persistent)
        })
        .await
        {
            Ok(_) => {
                tracing::info!("Created shutdown node: {}", path);
                Ok(())
            }
            Err(StoreError::NodeExists(_)) => {
                tracing::info!("Shutdown already signaled");
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        session.close().await;
        result
    }

    /// Waits until every container's naming node has disappeared.
    pub async fn await_drained(&self, timeout: Duration) -> Result<()> {
        let session = self.connect().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut alive = 0usize;
            for container in &self.containers {
                let path = self.naming.service_path(&container.service_name);
                if matches!(session.exists(&path, None).await, Ok(Some(_))) {
                    alive += 1;
                }
            }
            if alive == 0 {
                session.close().await;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                session.close().await;
                return Err(Error::Timeout(format!(
                    "waiting for {} services to shut down",
                    alive
                )));
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Stops the application, waits for the drain, then launches it again.
    pub async fn restart(&self, drain_timeout: Duration) -> Result<()> {
        self.stop().await?;
        self.await_drained(drain_timeout).await?;
        self.start().await
    }

    /// Reads every service's advertised status from the naming service.
    /// `None` means the service is not registered (broker down or not yet up).
    pub async fn status(&self) -> Result<Vec<(String, Option<ServiceStatus>)>> {
        let session = self.connect().await?;
        let mut statuses = Vec::with_capacity(self.containers.len());
        for container in &self.containers {
            let path = self.naming.service_path(&container.service_name);
            let status = match session.get_data(&path, None).await {
                Ok(data) => match ServiceNode::from_bytes(&data) {
                    Ok(node) => Some(node.status),
                    Err(e) => {
                        tracing::warn!(error = %e, "Unreadable naming node: {}", path);
                        None
                    }
                },
                Err(StoreError::NoNode(_)) => None,
                Err(e) => {
                    session.close().await;
                    return Err(e.into());
                }
            };
            statuses.push((container.service_name.clone(), status));
        }
        session.close().await;
        Ok(statuses)
    }
}
