//! Handler for short-lived processes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Child;

use super::{build_command, stop_group, ProcessHandler};
use crate::schema::Resource;

/// Runs a pre-main, post-main or stop resource: spawn, wait for termination,
/// report success iff the exit status is zero.
pub struct DefaultProcessHandler {
    resource: Resource,
    env: HashMap<String, String>,
    grace: Duration,
    child: Option<Child>,
}

impl DefaultProcessHandler {
    pub fn new(resource: Resource, env: HashMap<String, String>, grace: Duration) -> Self {
        Self {
            resource,
            env,
            grace,
            child: None,
        }
    }
}

#[async_trait]
impl ProcessHandler for DefaultProcessHandler {
    async fn init(&mut self) -> bool {
        if !self.resource.is_runnable() {
            tracing::error!(process = %self.resource.name, "Resource has no executable path");
            return false;
        }
        true
    }

    async fn start(&mut self) -> bool {
        match build_command(&self.resource, &self.env).spawn() {
            Ok(child) => {
                tracing::info!(
                    process = %self.resource.name,
                    pid = child.id(),
                    "Process started"
                );
                self.child = Some(child);
                true
            }
            Err(e) => {
                tracing::error!(
                    process = %self.resource.name,
                    path = %self.resource.path,
                    error = %e,
                    "Failed to spawn process"
                );
                false
            }
        }
    }

    async fn wait_for(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::info!(process = %self.resource.name, "Process completed");
                true
            }
            Ok(status) => {
                tracing::error!(process = %self.resource.name, %status, "Process failed");
                false
            }
            Err(e) => {
                tracing::error!(process = %self.resource.name, error = %e, "Wait failed");
                false
            }
        }
    }

    async fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        let pid = self.child.as_ref().and_then(|c| c.id());
        stop_group(&self.resource.name, pid, self.grace).await;
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn name(&self) -> &str {
        &self.resource.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(path: &str, args: &[&str]) -> DefaultProcessHandler {
        DefaultProcessHandler::new(
            Resource::new("t", path).with_args(args),
            HashMap::new(),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn zero_exit_reports_success() {
        let mut h = handler("/bin/sh", &["-c", "exit 0"]);
        assert!(h.init().await);
        assert!(h.start().await);
        assert!(h.wait_for().await);
        assert!(!h.is_running());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failure() {
        let mut h = handler("/bin/sh", &["-c", "exit 3"]);
        assert!(h.start().await);
        assert!(!h.wait_for().await);
    }

    #[tokio::test]
    async fn missing_executable_fails_to_start() {
        let mut h = handler("/nonexistent/binary", &[]);
        assert!(!h.start().await);
    }

    #[tokio::test]
    async fn empty_path_fails_init() {
        let mut h = handler("", &[]);
        assert!(!h.init().await);
    }
}
