//! Ownership of both process groups.

use tokio_util::sync::CancellationToken;

use super::{MainWaitHandle, StartGroupHandler, StartOutcome, StopGroupHandler};

/// Owns the start and stop group handlers for one container.
#[derive(Default)]
pub struct ProcessManager {
    start_group: Option<StartGroupHandler>,
    stop_group: Option<StopGroupHandler>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_start_group(&mut self, handler: StartGroupHandler) {
        self.start_group = Some(handler);
    }

    pub fn set_stop_group(&mut self, handler: StopGroupHandler) {
        self.stop_group = Some(handler);
    }

    /// Whether the stop group was ever built. Shutdown before start completes
    /// initializes it lazily.
    pub fn is_stop_handler_init(&self) -> bool {
        self.stop_group.is_some()
    }

    pub async fn exec_start(&mut self, cancel: &CancellationToken) -> StartOutcome {
        match self.start_group.as_mut() {
            Some(group) => group.exec(cancel).await,
            None => {
                tracing::error!("No start group configured");
                StartOutcome::FailedBeforeMain
            }
        }
    }

    pub async fn exec_stop(&mut self) {
        match self.stop_group.as_mut() {
            Some(group) => group.exec().await,
            None => tracing::warn!("No stop group configured; nothing to run"),
        }
    }

    /// Forcibly stops the main process if it is still alive after the stop
    /// group ran.
    pub async fn stop_main(&mut self) {
        if let Some(group) = self.start_group.as_mut() {
            group.stop_main().await;
        }
    }

    pub fn main_wait_handle(&self) -> Option<MainWaitHandle> {
        self.start_group.as_ref().map(|g| g.main_wait_handle())
    }
}
