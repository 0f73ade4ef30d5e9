//! Container lifecycle state machine.
//!
//! Event-driven: watch callbacks and process outcomes feed
//! [`LifecycleEvent`]s in, transitions emit [`CycleAction`]s the broker's
//! event loop executes. Guards are evaluated under the state lock so no two
//! events mutate state concurrently.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::services::ServiceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Boot,
    Init,
    WaitingDeps,
    Starting,
    Running,
    ShuttingDown,
    Error,
    Done,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Done | LifecycleState::Error)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Boot => "BOOT",
            LifecycleState::Init => "INIT",
            LifecycleState::WaitingDeps => "WAITING_DEPS",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Running => "RUNNING",
            LifecycleState::ShuttingDown => "SHUTTING_DOWN",
            LifecycleState::Error => "ERROR",
            LifecycleState::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Boot,
    ContainerInit,
    ServiceAdded,
    ServiceNone,
    ServiceInitialized,
    ServiceNotRunning,
    ServiceNotInitialized,
    ServiceDeleted,
    ServiceUpdated,
    Shutdown,
    Error,
}

/// Work item a transition submits to the broker's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleAction {
    Boot,
    Init,
    Start,
    Shutdown,
    Update,
    Error,
}

/// The per-container state machine.
pub struct LifecycleHandler {
    state: Mutex<LifecycleState>,
    actions: mpsc::UnboundedSender<CycleAction>,
    services: Mutex<Option<Arc<ServiceManager>>>,
}

impl LifecycleHandler {
    pub fn new(actions: mpsc::UnboundedSender<CycleAction>) -> Self {
        Self {
            state: Mutex::new(LifecycleState::Boot),
            actions,
            services: Mutex::new(None),
        }
    }

    /// Installs the dependency view used by the start guard. Set once the
    /// descriptor has been processed.
    pub fn set_service_manager(&self, services: Arc<ServiceManager>) {
        *self.services.lock() = Some(services);
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// All dependencies PROCESSED and INITIALIZED.
    fn deps_ready(&self) -> bool {
        self.services
            .lock()
            .as_ref()
            .map(|s| s.all_initialized_and_processed())
            .unwrap_or(false)
    }

    fn transition(
        &self,
        state: &mut LifecycleState,
        to: LifecycleState,
        event: LifecycleEvent,
        action: Option<CycleAction>,
    ) {
        tracing::info!("Lifecycle transition: {} -> {} ({:?})", state, to, event);
        *state = to;
        if let Some(action) = action {
            let _ = self.actions.send(action);
        }
    }

    /// Feeds one event through the machine.
    pub fn handle(&self, event: LifecycleEvent) {
        let mut state = self.state.lock();
        match (*state, event) {
            (LifecycleState::Boot, LifecycleEvent::Boot) => {
                self.transition(&mut state, LifecycleState::Init, event, Some(CycleAction::Boot));
            }
            (LifecycleState::Init, LifecycleEvent::ContainerInit) => {
                self.transition(
                    &mut state,
                    LifecycleState::WaitingDeps,
                    event,
                    Some(CycleAction::Init),
                );
            }
            (LifecycleState::WaitingDeps, LifecycleEvent::ServiceNone) => {
                self.transition(
                    &mut state,
                    LifecycleState::Starting,
                    event,
                    Some(CycleAction::Start),
                );
            }
            (
                LifecycleState::WaitingDeps,
                LifecycleEvent::ServiceAdded | LifecycleEvent::ServiceInitialized,
            ) => {
                if self.deps_ready() {
                    self.transition(
                        &mut state,
                        LifecycleState::Starting,
                        event,
                        Some(CycleAction::Start),
                    );
                } else {
                    tracing::debug!("Dependencies not ready yet ({:?})", event);
                }
            }
            (LifecycleState::Running, LifecycleEvent::ServiceDeleted) => {
                self.transition(
                    &mut state,
                    LifecycleState::ShuttingDown,
                    event,
                    Some(CycleAction::Shutdown),
                );
            }
            (current, LifecycleEvent::ServiceUpdated) => {
                if !current.is_terminal() {
                    let _ = self.actions.send(CycleAction::Update);
                }
            }
            (current, LifecycleEvent::Shutdown) => {
                // Idempotent: a second shutdown while already draining (or
                // finished) is a no-op.
                if !matches!(
                    current,
                    LifecycleState::ShuttingDown | LifecycleState::Done | LifecycleState::Error
                ) {
                    self.transition(
                        &mut state,
                        LifecycleState::ShuttingDown,
                        event,
                        Some(CycleAction::Shutdown),
                    );
                }
            }
            (current, LifecycleEvent::Error) => {
                if !current.is_terminal() {
                    self.transition(&mut state, LifecycleState::Error, event, Some(CycleAction::Error));
                }
            }
            (
                _,
                LifecycleEvent::ServiceNotRunning
                | LifecycleEvent::ServiceNotInitialized
                | LifecycleEvent::ServiceDeleted,
            ) => {
                // Status recorded in the service manager; no transition here.
                tracing::debug!("Observed {:?} in state {}", event, state);
            }
            (current, event) => {
                tracing::debug!("Ignoring {:?} in state {}", event, current);
            }
        }
    }

    /// The process manager reported a successful start group.
    pub fn started(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Starting {
            tracing::info!("Lifecycle transition: {} -> {}", state, LifecycleState::Running);
            *state = LifecycleState::Running;
        }
    }

    /// The shutdown coordinator finished draining.
    pub fn stopped(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::ShuttingDown {
            tracing::info!("Lifecycle transition: {} -> {}", state, LifecycleState::Done);
            *state = LifecycleState::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::ServiceStatus;
    use std::collections::HashMap;

    fn handler() -> (LifecycleHandler, mpsc::UnboundedReceiver<CycleAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LifecycleHandler::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CycleAction>) -> Vec<CycleAction> {
        let mut out = Vec::new();
        while let Ok(action) = rx.try_recv() {
            out.push(action);
        }
        out
    }

    #[test]
    fn boot_to_waiting_deps() {
        let (lh, mut rx) = handler();
        lh.handle(LifecycleEvent::Boot);
        assert_eq!(lh.state(), LifecycleState::Init);
        lh.handle(LifecycleEvent::ContainerInit);
        assert_eq!(lh.state(), LifecycleState::WaitingDeps);
        assert_eq!(drain(&mut rx), [CycleAction::Boot, CycleAction::Init]);
    }

    #[test]
    fn no_dependencies_starts_directly() {
        let (lh, mut rx) = handler();
        lh.handle(LifecycleEvent::Boot);
        lh.handle(LifecycleEvent::ContainerInit);
        lh.handle(LifecycleEvent::ServiceNone);
        assert_eq!(lh.state(), LifecycleState::Starting);
        assert!(drain(&mut rx).contains(&CycleAction::Start));
    }

    #[test]
    fn guard_blocks_until_all_deps_initialized() {
        let (lh, mut rx) = handler();
        lh.handle(LifecycleEvent::Boot);
        lh.handle(LifecycleEvent::ContainerInit);

        let services = Arc::new(ServiceManager::new(HashMap::from([(
            "a".to_string(),
            "/ns/a".to_string(),
        )])));
        lh.set_service_manager(Arc::clone(&services));

        lh.handle(LifecycleEvent::ServiceAdded);
        assert_eq!(lh.state(), LifecycleState::WaitingDeps);

        services.set_conf_processed("/ns/a");
        services.set_status("/ns/a", ServiceStatus::Initialized);
        lh.handle(LifecycleEvent::ServiceInitialized);
        assert_eq!(lh.state(), LifecycleState::Starting);
        assert!(drain(&mut rx).contains(&CycleAction::Start));
    }

    #[test]
    fn running_dep_deleted_shuts_down() {
        let (lh, mut rx) = handler();
        lh.handle(LifecycleEvent::Boot);
        lh.handle(LifecycleEvent::ContainerInit);
        lh.handle(LifecycleEvent::ServiceNone);
        lh.started();
        assert_eq!(lh.state(), LifecycleState::Running);

        lh.handle(LifecycleEvent::ServiceDeleted);
        assert_eq!(lh.state(), LifecycleState::ShuttingDown);
        assert!(drain(&mut rx).contains(&CycleAction::Shutdown));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (lh, mut rx) = handler();
        lh.handle(LifecycleEvent::Boot);
        lh.handle(LifecycleEvent::Shutdown);
        lh.handle(LifecycleEvent::Shutdown);
        assert_eq!(lh.state(), LifecycleState::ShuttingDown);
        let actions = drain(&mut rx);
        assert_eq!(
            actions.iter().filter(|a| **a == CycleAction::Shutdown).count(),
            1
        );

        lh.stopped();
        assert_eq!(lh.state(), LifecycleState::Done);
        lh.handle(LifecycleEvent::Shutdown);
        assert_eq!(lh.state(), LifecycleState::Done);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn error_from_any_state() {
        let (lh, mut rx) = handler();
        lh.handle(LifecycleEvent::Boot);
        lh.handle(LifecycleEvent::Error);
        assert_eq!(lh.state(), LifecycleState::Error);
        assert!(drain(&mut rx).contains(&CycleAction::Error));

        // Terminal: further events do nothing.
        lh.handle(LifecycleEvent::Shutdown);
        assert_eq!(lh.state(), LifecycleState::Error);
    }
}
