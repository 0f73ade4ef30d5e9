//! The in-container agent.
//!
//! One broker drives one container's lifecycle: it claims the container
//! node, retrieves its descriptor, registers in the naming service, waits
//! for its dependencies, executes the process groups and coordinates
//! dependency-aware shutdown.
//!
//! The broker is a single logical actor: an event loop consumes lifecycle
//! actions, watch events and worker completions from three channels and
//! executes the protocol steps in arrival order. Blocking work (waiting on
//! the main process, draining dependents at shutdown) runs on dedicated
//! tasks that report back through the internal channel.

mod shutdown;

use shutdown::ShutdownCoordinator;

use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ProgramConfig;
use crate::environment::EnvironmentHandler;
use crate::error::{Error, Result};
use crate::lifecycle::{CycleAction, LifecycleEvent, LifecycleHandler, LifecycleState};
use crate::naming::{NamingService, ServiceNode, ServiceStatus};
use crate::process::{
    DefaultProcessHandler, MainProcessHandler, ProbeConfig, ProcessManager, StartGroupHandler,
    StartOutcome, StopGroupHandler,
};
use crate::schema::ContainerDescriptor;
use crate::services::ServiceManager;
use crate::store::{
    check_and_create, with_retry, CoordinationStore, NodeKind, SessionState, StoreError,
    StoreSession, Watch, WatchEvent, ANY_VERSION,
};
use crate::tasks::TaskHandler;

/// Coordinates of the store nodes a broker operates on, injected by the
/// master at launch.
#[derive(Debug, Clone)]
pub struct BrokerSpec {
    pub service_name: String,
    pub container_path: String,
    pub conf_path: String,
    pub naming_root: String,
    pub shutdown_path: String,
}

/// Completions reported by worker tasks.
#[derive(Debug)]
enum InternalEvent {
    StartGroupDone(StartOutcome),
    MainExited,
    /// Grace period after a dependency's naming node vanished has elapsed;
    /// check whether it came back.
    DependencyLost(String),
    ShutdownComplete,
}

pub struct Broker {
    spec: BrokerSpec,
    config: ProgramConfig,
    store: Arc<dyn CoordinationStore>,
    /// Random identity written to the container node for ownership assertion
    /// on reclaim.
    broker_id: String,
    naming: NamingService,
    lifecycle: Arc<LifecycleHandler>,
    shutdown_token: CancellationToken,
    shutdown_notify: Arc<Notify>,
    session: Option<Arc<dyn StoreSession>>,
    services: Option<Arc<ServiceManager>>,
    descriptor: Option<ContainerDescriptor>,
    /// Our own naming-node payload; the in-memory source of truth for the
    /// advertised status.
    srv_node: ServiceNode,
    task_handler: Option<Arc<TaskHandler>>,
    proc_manager: Option<Arc<tokio::sync::Mutex<ProcessManager>>>,
    /// Watched dependency container nodes, mapped back to the naming path.
    watched_containers: HashMap<String, String>,
    shutdown_started: bool,
    broker_dir: PathBuf,
    cycle_rx: mpsc::UnboundedReceiver<CycleAction>,
    watch_tx: Watch,
    watch_rx: mpsc::UnboundedReceiver<WatchEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
}

impl Broker {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ProgramConfig, spec: BrokerSpec) -> Self {
        let (cycle_tx, cycle_rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let broker_id = rand::thread_rng().gen::<i64>().to_string();
        let naming = NamingService::new(spec.naming_root.clone());
        let srv_node = ServiceNode::new(spec.container_path.clone());
        let broker_dir = config
            .services_dir
            .join(format!("{}-service", spec.service_name));
        Self {
            naming,
            broker_id,
            lifecycle: Arc::new(LifecycleHandler::new(cycle_tx)),
            shutdown_token: CancellationToken::new(),
            shutdown_notify: Arc::new(Notify::new()),
            session: None,
            services: None,
            descriptor: None,
            srv_node,
            task_handler: None,
            proc_manager: None,
            watched_containers: HashMap::new(),
            shutdown_started: false,
            broker_dir,
            cycle_rx,
            watch_tx,
            watch_rx,
            internal_tx,
            internal_rx,
            spec,
            config,
            store,
        }
    }

    /// Notified once the shutdown coordinator has fully drained.
    pub fn shutdown_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_notify)
    }

    /// Cancelled the moment shutdown is initiated.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs the broker to completion. Returns Ok on a clean shutdown and an
    /// error on unrecoverable boot failure.
    pub async fn run(mut self) -> Result<()> {
        let span = tracing::info_span!("broker", service.name = %self.spec.service_name);
        async move {
            self.lifecycle.handle(LifecycleEvent::Boot);
            loop {
                tokio::select! {
                    Some(action) = self.cycle_rx.recv() => self.exec_cycle(action).await,
                    Some(event) = self.watch_rx.recv() => self.handle_watch(event).await,
                    Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
                }
                if self.lifecycle.state().is_terminal() {
                    break;
                }
            }
            match self.lifecycle.state() {
                LifecycleState::Error => {
                    self.error().await;
                    Err(Error::Fatal(format!(
                        "broker for '{}' entered error state",
                        self.spec.service_name
                    )))
                }
                _ => Ok(()),
            }
        }
        .instrument(span)
        .await
    }

    fn session(&self) -> Option<Arc<dyn StoreSession>> {
        self.session.clone()
    }

    fn error_event(&self) {
        self.lifecycle.handle(LifecycleEvent::Error);
    }

    async fn exec_cycle(&mut self, action: CycleAction) {
        match action {
            CycleAction::Boot => self.boot().await,
            CycleAction::Init => self.init().await,
            CycleAction::Start => self.start().await,
            CycleAction::Shutdown => self.shutdown().await,
            CycleAction::Update => self.update(),
            CycleAction::Error => self.error().await,
        }
    }

    /*
     * BOOTSTRAPPING
     */

    async fn boot(&mut self) {
        tracing::info!("Starting broker boot");
        let store = Arc::clone(&self.store);
        let connect = store.connect(self.config.session_timeout);
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(session)) => {
                session.register(self.watch_tx.clone());
                self.session = Some(session);
                self.lifecycle.handle(LifecycleEvent::ContainerInit);
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "FAILED to connect to the coordination store");
                self.error_event();
            }
            Err(_) => {
                tracing::error!(
                    "Connection to the coordination store timed out after {:?}",
                    self.config.connect_timeout
                );
                self.error_event();
            }
        }
    }

    /*
     * INITIALIZATION
     */

    async fn init(&mut self) {
        tracing::info!("Starting container initialization");
        if self.arm_shutdown_watch().await.is_err() {
            self.error_event();
            return;
        }
        if !self.claim_container_node().await {
            return;
        }
        self.wait_for_description().await;
    }

    /// Arms the watch on the shutdown node. An already-present node means
    /// shutdown was signaled before this broker came up.
    async fn arm_shutdown_watch(&mut self) -> Result<()> {
        let Some(session) = self.session() else {
            return Err(Error::Fatal("no session".to_string()));
        };
        let path = self.spec.shutdown_path.clone();
        let watch = self.watch_tx.clone();
        match with_retry("arming shutdown watch", || {
            session.exists(&path, Some(watch.clone()))
        })
        .await
        {
            Ok(Some(_)) => {
                tracing::info!("Shutdown node found: {}", path);
                self.lifecycle.handle(LifecycleEvent::Shutdown);
                Ok(())
            }
            Ok(None) => {
                tracing::info!("Watch registered on: {}", path);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot arm shutdown watch");
                Err(e.into())
            }
        }
    }

    /// Claims the container node with this broker's identity. A leftover node
    /// carrying our own identity is a reclaim after a transient fault; any
    /// other payload is a conflict.
    async fn claim_container_node(&mut self) -> bool {
        let Some(session) = self.session() else {
            self.error_event();
            return false;
        };
        match check_and_create(
            session.as_ref(),
            &self.spec.container_path,
            self.broker_id.as_bytes(),
            NodeKind::Ephemeral,
        )
        .await
        {
            Ok(true) => {
                tracing::info!("Created container node: {}", self.spec.container_path);
                true
            }
            Ok(false) => {
                tracing::error!(
                    "Cannot create container node, already claimed: {}",
                    self.spec.container_path
                );
                self.error_event();
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Container node claim failed");
                self.error_event();
                false
            }
        }
    }

    /// Checks for the configuration node, arming a creation watch when the
    /// master has not published it yet.
    async fn wait_for_description(&mut self) {
        let Some(session) = self.session() else {
            self.error_event();
            return;
        };
        let path = self.spec.conf_path.clone();
        let watch = self.watch_tx.clone();
        match with_retry("checking configuration node", || {
            session.exists(&path, Some(watch.clone()))
        })
        .await
        {
            Ok(Some(_)) => {
                tracing::info!("Container description found: {}", path);
                self.fetch_own_descriptor().await;
            }
            Ok(None) => {
                tracing::info!("Waiting for container description: {}", path);
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot check configuration node");
                self.error_event();
            }
        }
    }

    async fn fetch_own_descriptor(&mut self) {
        let Some(session) = self.session() else {
            self.error_event();
            return;
        };
        let path = self.spec.conf_path.clone();
        match with_retry("reading configuration node", || session.get_data(&path, None)).await {
            Ok(data) => self.process_descriptor(data).await,
            Err(e) => {
                tracing::error!(error = %e, "Cannot read container description: {}", path);
                self.error_event();
            }
        }
    }

    /// Deserializes the descriptor, initializes the
    /// dependency view, publish the descriptor on the container node,
    /// register in the naming service and query every dependency.
    async fn process_descriptor(&mut self, data: Vec<u8>) {
        let descriptor = match ContainerDescriptor::from_bytes(&data) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::error!(error = %e, "Container description does not deserialize");
                self.error_event();
                return;
            }
        };
        tracing::info!("Processing container description");
        self.write_snapshot(&descriptor);

        let resolved = self.naming.resolve_all(&descriptor.requires);
        let services = Arc::new(ServiceManager::new(resolved));
        self.lifecycle.set_service_manager(Arc::clone(&services));
        self.services = Some(Arc::clone(&services));
        self.descriptor = Some(descriptor);

        // Dependents read the descriptor from the container node.
        let Some(session) = self.session() else {
            self.error_event();
            return;
        };
        let container_path = self.spec.container_path.clone();
        let set = with_retry("publishing descriptor on container node", || {
            session.set_data(&container_path, &data, ANY_VERSION)
        })
        .await;
        if let Err(e) = set {
            tracing::error!(error = %e, "Cannot set data on container node: {}", container_path);
            self.error_event();
            return;
        }
        tracing::info!("Data set to container node: {}", container_path);

        if !self.register_to_naming_service().await {
            return;
        }

        if services.has_services() {
            for path in services.service_paths() {
                self.query_service(&path).await;
            }
        } else {
            self.lifecycle.handle(LifecycleEvent::ServiceNone);
        }
    }

    /// Advertises this container's service with status
    /// NOT_INITIALIZED.
    async fn register_to_naming_service(&mut self) -> bool {
        let Some(session) = self.session() else {
            self.error_event();
            return false;
        };
        self.srv_node.status = ServiceStatus::NotInitialized;
        let path = self.naming.service_path(&self.spec.service_name);
        let data = match self.srv_node.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Cannot serialize naming-service node");
                self.error_event();
                return false;
            }
        };
        match check_and_create(session.as_ref(), &path, &data, NodeKind::Ephemeral).await {
            Ok(true) => {
                tracing::info!("Registered to naming service: {}", path);
                true
            }
            Ok(false) => {
                tracing::error!("Service node already exists: {}", path);
                self.error_event();
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Naming-service registration failed");
                self.error_event();
                false
            }
        }
    }

    /*
     * DEPENDENCY QUERIES
     */

    /// Queries one dependency: checks its naming node, arming a
    /// creation watch when the service has not registered yet. Loops when
    /// the node vanishes between the existence check and the read.
    async fn query_service(&mut self, path: &str) {
        loop {
            let Some(session) = self.session() else {
                return;
            };
            tracing::info!("Querying for service: {}", self.naming.service_name(path));
            let watch = self.watch_tx.clone();
            match with_retry("querying service", || {
                session.exists(path, Some(watch.clone()))
            })
            .await
            {
                Ok(Some(_)) => {
                    if self.fetch_service_data(path).await {
                        return;
                    }
                    // Deleted between exists and read; re-arm.
                }
                Ok(None) => {
                    tracing::info!("Service has not started yet. Watch set on: {}", path);
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Cannot query service: {}", path);
                    return;
                }
            }
        }
    }

    /// Reads a dependency's naming node, then the descriptor from its
    /// container node, and marks the dependency processed. Returns false
    /// only when the naming node was already gone; the deletion watch
    /// carries the reaction.
    async fn fetch_service_data(&mut self, path: &str) -> bool {
        let Some(session) = self.session() else {
            return true;
        };
        let watch = self.watch_tx.clone();
        let data = match with_retry("reading service node", || {
            session.get_data(path, Some(watch.clone()))
        })
        .await
        {
            Ok(data) => data,
            Err(StoreError::NoNode(_)) => {
                return false;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot read service node: {}", path);
                return true;
            }
        };
        let node = match ServiceNode::from_bytes(&data) {
            Ok(node) => node,
            Err(e) => {
                tracing::error!(error = %e, "Service node does not deserialize: {}", path);
                return true;
            }
        };
        tracing::info!(
            "Service {} advertises {} at {}",
            self.naming.service_name(path),
            node.status,
            node.container_path
        );

        let Some(services) = self.services.clone() else {
            return true;
        };
        services.set_status(path, node.status);
        services.set_container_path(path, node.container_path.clone());

        let container_watch = self.watch_tx.clone();
        let container_path = node.container_path.clone();
        let dep_data = match with_retry("reading dependency container node", || {
            session.get_data(&container_path, Some(container_watch.clone()))
        })
        .await
        {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Cannot read dependency container node: {}",
                    container_path
                );
                return true;
            }
        };
        match ContainerDescriptor::from_bytes(&dep_data) {
            Ok(descriptor) => {
                self.write_snapshot(&descriptor);
                services.set_descriptor(path, descriptor);
                services.set_conf_processed(path);
                self.watched_containers
                    .insert(container_path, path.to_string());
                self.lifecycle.handle(LifecycleEvent::ServiceAdded);
            }
            Err(e) => {
                // The dependency may not have published its descriptor yet;
                // the data watch fires once it does.
                tracing::warn!(
                    error = %e,
                    "Dependency container node does not hold a descriptor yet: {}",
                    container_path
                );
                self.watched_containers
                    .insert(container_path, path.to_string());
            }
        }
        true
    }

    /// Refreshes a dependency's advertised status after a data change on its
    /// naming node.
    async fn fetch_service_update(&mut self, path: &str) {
        let Some(session) = self.session() else {
            return;
        };
        let watch = self.watch_tx.clone();
        let data = match with_retry("reading updated service node", || {
            session.get_data(path, Some(watch.clone()))
        })
        .await
        {
            Ok(data) => data,
            Err(StoreError::NoNode(_)) => return,
            Err(e) => {
                tracing::error!(error = %e, "Cannot read service node: {}", path);
                return;
            }
        };
        let node = match ServiceNode::from_bytes(&data) {
            Ok(node) => node,
            Err(e) => {
                tracing::error!(error = %e, "Service node does not deserialize: {}", path);
                return;
            }
        };
        let Some(services) = self.services.clone() else {
            return;
        };
        tracing::info!(
            "Service {} status changed to {}",
            self.naming.service_name(path),
            node.status
        );
        services.set_status(path, node.status);
        match node.status {
            ServiceStatus::Updated => {
                // Descriptor changed upstream. Recorded, but live
                // re-configuration is not supported.
                services.set_conf_not_processed(path);
                self.lifecycle.handle(LifecycleEvent::ServiceUpdated);
            }
            ServiceStatus::Initialized => {
                self.lifecycle.handle(LifecycleEvent::ServiceInitialized)
            }
            ServiceStatus::NotRunning => {
                self.lifecycle.handle(LifecycleEvent::ServiceNotRunning)
            }
            ServiceStatus::NotInitialized => {
                self.lifecycle.handle(LifecycleEvent::ServiceNotInitialized)
            }
        }
    }

    /*
     * WATCH DISPATCH
     */

    async fn handle_watch(&mut self, event: WatchEvent) {
        if let WatchEvent::SessionStateChanged(state) = &event {
            if *state == SessionState::Expired {
                self.recover_session().await;
            } else {
                tracing::info!("Session state event: {:?}", state);
            }
            return;
        }

        // Once draining, dependency churn no longer matters; the shutdown
        // coordinator owns its own watches.
        if matches!(
            self.lifecycle.state(),
            LifecycleState::ShuttingDown | LifecycleState::Done | LifecycleState::Error
        ) {
            return;
        }

        let Some(path) = event.path().map(str::to_string) else {
            return;
        };
        tracing::debug!("Watch triggered: {:?}", event);

        if path == self.spec.shutdown_path {
            if matches!(event, WatchEvent::NodeCreated(_)) {
                tracing::info!("Shutdown node created: {}", path);
                self.lifecycle.handle(LifecycleEvent::Shutdown);
            }
            return;
        }

        if path == self.spec.conf_path {
            if matches!(event, WatchEvent::NodeCreated(_)) {
                tracing::info!("Container description found: {}", path);
                self.fetch_own_descriptor().await;
            }
            return;
        }

        let tracked = self
            .services
            .as_ref()
            .map(|s| s.is_tracked(&path))
            .unwrap_or(false);
        if tracked {
            match event {
                WatchEvent::NodeCreated(_) => {
                    if !self.fetch_service_data(&path).await {
                        self.query_service(&path).await;
                    }
                }
                WatchEvent::NodeDataChanged(_) => self.fetch_service_update(&path).await,
                WatchEvent::NodeDeleted(_) => {
                    tracing::warn!("A required service shut down unexpectedly: {}", path);
                    if let Some(services) = &self.services {
                        services.delete_service_node(&path);
                    }
                    if self.lifecycle.state() == LifecycleState::Running {
                        // Session recovery re-creates the node quickly; only
                        // a node still absent after the liveness horizon
                        // means the dependency is gone for good.
                        let grace = self.config.session_timeout;
                        let internal_tx = self.internal_tx.clone();
                        let lost = path.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            let _ = internal_tx.send(InternalEvent::DependencyLost(lost));
                        });
                    } else {
                        self.lifecycle.handle(LifecycleEvent::ServiceDeleted);
                    }
                    // Re-arm in case the service comes back online.
                    self.query_service(&path).await;
                }
                WatchEvent::SessionStateChanged(_) => {}
            }
            return;
        }

        if let Some(srv_path) = self.watched_containers.get(&path).cloned() {
            match event {
                WatchEvent::NodeDataChanged(_) => {
                    tracing::info!(
                        "Dependency descriptor changed on {}; re-configuration not supported",
                        path
                    );
                    self.refresh_dependency_descriptor(&path, &srv_path).await;
                }
                WatchEvent::NodeDeleted(_) => {
                    // The naming-node deletion carries the reaction.
                    tracing::debug!("Dependency container node deleted: {}", path);
                    self.watched_containers.remove(&path);
                }
                _ => {}
            }
        }
    }

    /// Re-reads a dependency's container node after a data change, keeping
    /// the stored descriptor current and the watch armed.
    async fn refresh_dependency_descriptor(&mut self, container_path: &str, srv_path: &str) {
        let Some(session) = self.session() else {
            return;
        };
        let watch = self.watch_tx.clone();
        match with_retry("re-reading dependency container node", || {
            session.get_data(container_path, Some(watch.clone()))
        })
        .await
        {
            Ok(data) => {
                if let Ok(descriptor) = ContainerDescriptor::from_bytes(&data) {
                    if let Some(services) = &self.services {
                        services.set_descriptor(srv_path, descriptor);
                        services.set_conf_processed(srv_path);
                        self.lifecycle.handle(LifecycleEvent::ServiceAdded);
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Dependency container node vanished: {}", container_path);
            }
        }
    }

    /*
     * PROCESS HANDLING
     */

    /// Builds environment, tasks and group handlers, runs the
    /// pre-start tasks and execute the start group on a worker.
    async fn start(&mut self) {
        tracing::info!("Starting container processes initialization");
        let Some(descriptor) = self.descriptor.clone() else {
            tracing::error!("No descriptor available at start");
            self.error_event();
            return;
        };

        let dep_envs: Vec<_> = self
            .services
            .as_ref()
            .map(|s| {
                s.dependency_descriptors()
                    .into_iter()
                    .map(|(name, d)| (name, d.env))
                    .collect()
            })
            .unwrap_or_default();
        let env_handler = EnvironmentHandler::new(&descriptor.env, &dep_envs);
        let env = env_handler.process_env().clone();

        let start_group = match self.build_start_group(&descriptor, env.clone()) {
            Ok(group) => group,
            Err(e) => {
                tracing::error!(error = %e, "Start group initialization failed");
                self.error_event();
                return;
            }
        };
        let stop_group = self.build_stop_group(&descriptor, env.clone());

        let mut manager = ProcessManager::new();
        manager.set_start_group(start_group);
        manager.set_stop_group(stop_group);
        let manager = Arc::new(tokio::sync::Mutex::new(manager));
        self.proc_manager = Some(Arc::clone(&manager));

        let task_handler = Arc::new(TaskHandler::new(descriptor.tasks.as_ref(), env));
        self.task_handler = Some(Arc::clone(&task_handler));

        let internal_tx = self.internal_tx.clone();
        let cancel = self.shutdown_token.clone();
        tokio::spawn(async move {
            task_handler.exec_pre_start_tasks().await;
            let outcome = {
                let mut manager = manager.lock().await;
                if cancel.is_cancelled() {
                    StartOutcome::Cancelled
                } else {
                    manager.exec_start(&cancel).await
                }
            };
            let _ = internal_tx.send(InternalEvent::StartGroupDone(outcome));
        });
    }

    fn build_start_group(
        &self,
        descriptor: &ContainerDescriptor,
        env: HashMap<String, String>,
    ) -> Result<StartGroupHandler> {
        let main_res = descriptor
            .start
            .main
            .clone()
            .ok_or_else(|| Error::Config("descriptor declares no main process".to_string()))?;
        let probe = ProbeConfig {
            host: descriptor.env.host.clone(),
            port: descriptor.env.host_port,
            attempts: self.config.readiness_attempts,
            interval: self.config.readiness_interval,
        };
        let grace = self.config.grace_period;
        let main = MainProcessHandler::new(main_res, env.clone(), probe, grace);
        let pre = descriptor
            .start
            .pre_main
            .iter()
            .cloned()
            .map(|r| DefaultProcessHandler::new(r, env.clone(), grace))
            .collect();
        let post = descriptor
            .start
            .post_main
            .iter()
            .cloned()
            .map(|r| DefaultProcessHandler::new(r, env.clone(), grace))
            .collect();
        Ok(StartGroupHandler::new(pre, main, post))
    }

    fn build_stop_group(
        &self,
        descriptor: &ContainerDescriptor,
        env: HashMap<String, String>,
    ) -> StopGroupHandler {
        let grace = self.config.grace_period;
        let handlers = descriptor
            .stop
            .ordered()
            .into_iter()
            .cloned()
            .map(|r| DefaultProcessHandler::new(r, env.clone(), grace))
            .collect();
        StopGroupHandler::new(handlers)
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::StartGroupDone(StartOutcome::Success) => {
                if self.shutdown_token.is_cancelled() {
                    tracing::info!("Start group completed during shutdown; not publishing");
                    return;
                }
                self.update_service_status(ServiceStatus::Initialized).await;
                self.lifecycle.started();
                self.monitor_main();
            }
            InternalEvent::StartGroupDone(StartOutcome::FailedBeforeMain) => {
                tracing::error!("Start group failed before the main process was up");
                self.update_service_status(ServiceStatus::NotRunning).await;
            }
            InternalEvent::StartGroupDone(StartOutcome::FailedAfterMain) => {
                tracing::error!("Start group failed after the main process was up");
                self.update_service_status(ServiceStatus::NotInitialized)
                    .await;
            }
            InternalEvent::StartGroupDone(StartOutcome::Cancelled) => {
                // Shutdown latched mid-start; the coordinator owns teardown.
                tracing::info!("Start group cancelled by shutdown");
            }
            InternalEvent::MainExited => {
                if !self.shutdown_token.is_cancelled()
                    && self.lifecycle.state() != LifecycleState::ShuttingDown
                {
                    tracing::warn!("Main process terminated unexpectedly");
                    self.update_service_status(ServiceStatus::NotRunning).await;
                }
            }
            InternalEvent::DependencyLost(path) => {
                let still_gone = self
                    .services
                    .as_ref()
                    .and_then(|s| s.entry(&path))
                    .map(|e| e.status.is_none())
                    .unwrap_or(false);
                if still_gone {
                    tracing::error!("Required service did not come back: {}", path);
                    self.lifecycle.handle(LifecycleEvent::ServiceDeleted);
                } else {
                    tracing::info!("Required service recovered: {}", path);
                }
            }
            InternalEvent::ShutdownComplete => {
                self.lifecycle.stopped();
            }
        }
    }

    /// A dedicated worker blocks on main-process
    /// termination. Planned stops are suppressed through the cancellation
    /// token.
    fn monitor_main(&self) {
        let Some(manager) = self.proc_manager.clone() else {
            return;
        };
        let token = self.shutdown_token.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let handle = manager.lock().await.main_wait_handle();
            let Some(handle) = handle else {
                return;
            };
            handle.wait().await;
            if !token.is_cancelled() {
                let _ = internal_tx.send(InternalEvent::MainExited);
            }
        });
    }

    /// Publishes a new status on this container's naming node.
    async fn update_service_status(&mut self, status: ServiceStatus) {
        self.srv_node.status = status;
        let Some(session) = self.session() else {
            return;
        };
        let path = self.naming.service_path(&self.spec.service_name);
        tracing::info!("Updating service status to {}: {}", status, path);
        let data = match self.srv_node.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Cannot serialize naming-service node");
                return;
            }
        };
        match with_retry("updating service status", || {
            session.set_data(&path, &data, ANY_VERSION)
        })
        .await
        {
            Ok(_) => tracing::info!("Data set to node: {}", path),
            Err(StoreError::SessionExpired) => {
                // Recovery re-creates the node with the in-memory status.
                tracing::warn!("Session expired while updating status");
            }
            Err(e) => tracing::error!(error = %e, "Cannot set data to node: {}", path),
        }
    }

    /*
     * SESSION RECOVERY
     */

    /// Re-establishes an expired session: fresh connect, naming node
    /// re-created with the current in-memory status, shutdown and dependency
    /// watches re-armed. The container node is left alone; re-creating it
    /// would lose the descriptor payload dependents already hold.
    async fn recover_session(&mut self) {
        if self.shutdown_started || self.lifecycle.state().is_terminal() {
            return;
        }
        tracing::warn!("Session expired. Establishing a new session");
        let store = Arc::clone(&self.store);
        let connect = store.connect(self.config.session_timeout);
        let session = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Session recovery failed");
                self.error_event();
                return;
            }
            Err(_) => {
                tracing::error!("Session recovery timed out");
                self.error_event();
                return;
            }
        };
        session.register(self.watch_tx.clone());
        self.session = Some(session.clone());

        let path = self.naming.service_path(&self.spec.service_name);
        match self.srv_node.to_bytes() {
            Ok(data) => {
                match check_and_create(session.as_ref(), &path, &data, NodeKind::Ephemeral).await {
                    Ok(true) => tracing::info!("Re-registered to naming service: {}", path),
                    Ok(false) => tracing::error!("Service node already exists: {}", path),
                    Err(e) => tracing::error!(error = %e, "Naming-service re-registration failed"),
                }
            }
            Err(e) => tracing::error!(error = %e, "Cannot serialize naming-service node"),
        }

        if self.arm_shutdown_watch().await.is_err() {
            self.error_event();
            return;
        }

        self.watched_containers.clear();
        let paths = self
            .services
            .as_ref()
            .map(|s| s.service_paths())
            .unwrap_or_default();
        for path in paths {
            self.query_service(&path).await;
        }
    }

    /*
     * SHUTDOWN
     */

    /// Latches the cancellation token and
    /// hand the drain to the coordinator. Idempotent.
    async fn shutdown(&mut self) {
        if self.shutdown_started {
            return;
        }
        self.shutdown_started = true;
        tracing::info!("Starting container shutdown");
        self.shutdown_token.cancel();

        // Shutdown before start completed: build the stop machinery lazily.
        if self.proc_manager.is_none() {
            if let Some(descriptor) = self.descriptor.clone() {
                let dep_envs: Vec<_> = self
                    .services
                    .as_ref()
                    .map(|s| {
                        s.dependency_descriptors()
                            .into_iter()
                            .map(|(name, d)| (name, d.env))
                            .collect()
                    })
                    .unwrap_or_default();
                let env_handler = EnvironmentHandler::new(&descriptor.env, &dep_envs);
                let env = env_handler.process_env().clone();
                let mut manager = ProcessManager::new();
                manager.set_stop_group(self.build_stop_group(&descriptor, env.clone()));
                self.proc_manager = Some(Arc::new(tokio::sync::Mutex::new(manager)));
                self.task_handler =
                    Some(Arc::new(TaskHandler::new(descriptor.tasks.as_ref(), env)));
            }
        }

        let dependents = self
            .descriptor
            .as_ref()
            .map(|d| d.is_required_from.iter().cloned().collect())
            .unwrap_or_default();
        let coordinator = ShutdownCoordinator::new(
            self.spec.service_name.clone(),
            self.session(),
            self.naming.clone(),
            dependents,
            self.spec.conf_path.clone(),
            self.proc_manager.clone(),
            self.task_handler.clone(),
            Arc::clone(&self.shutdown_notify),
        );
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            coordinator.run().await;
            let _ = internal_tx.send(InternalEvent::ShutdownComplete);
        });
    }

    fn update(&mut self) {
        // Live re-configuration is observed but intentionally not acted upon.
        tracing::info!("Starting container re-configuration");
    }

    async fn error(&mut self) {
        tracing::error!("Setting container into ERROR state");
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    /// Persists a descriptor snapshot for offline inspection. Failures are
    /// logged, never fatal.
    fn write_snapshot(&self, descriptor: &ContainerDescriptor) {
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.broker_dir)?;
            let path = self
                .broker_dir
                .join(format!("{}.json", descriptor.service_name));
            let data = serde_json::to_vec_pretty(descriptor)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&path, data)?;
            tracing::info!("Created configuration file: {}", path.display());
            Ok(())
        };
        if let Err(e) = write() {
            tracing::error!(error = %e, "FAILED to create configuration file");
        }
    }
}
