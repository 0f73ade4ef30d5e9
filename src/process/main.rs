//! Handler for the main (long-running) process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Child;

use super::{build_command, stop_group, ProcessHandler};
use crate::schema::Resource;

/// Ceiling for the readiness-probe backoff.
const MAX_PROBE_DELAY: Duration = Duration::from_secs(30);

/// Readiness-probe settings for the main process.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub host: String,
    pub port: u16,
    pub attempts: usize,
    pub interval: Duration,
}

/// Runs the group's main process.
///
/// Unlike the default handler it does not wait for termination at start;
/// it probes readiness by connecting to the advertised port with a bounded
/// exponential backoff so the group handler can proceed to post-main. A
/// port of 0 means the process exposes no socket and is considered ready
/// once spawned.
///
/// The child handle lives behind a shared mutex so the broker's monitor can
/// block on termination while stop() signals the process group by PID.
pub struct MainProcessHandler {
    resource: Resource,
    env: HashMap<String, String>,
    probe: ProbeConfig,
    grace: Duration,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    pid: Arc<parking_lot::Mutex<Option<u32>>>,
}

impl MainProcessHandler {
    pub fn new(
        resource: Resource,
        env: HashMap<String, String>,
        probe: ProbeConfig,
        grace: Duration,
    ) -> Self {
        Self {
            resource,
            env,
            probe,
            grace,
            child: Arc::new(tokio::sync::Mutex::new(None)),
            pid: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Handle for blocking on main-process termination from another task.
    pub fn wait_handle(&self) -> MainWaitHandle {
        MainWaitHandle {
            name: self.resource.name.clone(),
            child: Arc::clone(&self.child),
        }
    }

    async fn probe_ready(&self) -> bool {
        if self.probe.port == 0 {
            tracing::debug!(process = %self.resource.name, "No port declared, skipping readiness probe");
            return true;
        }
        let mut delay = self.probe.interval;
        for attempt in 1..=self.probe.attempts {
            match TcpStream::connect((self.probe.host.as_str(), self.probe.port)).await {
                Ok(_) => {
                    tracing::info!(
                        process = %self.resource.name,
                        port = self.probe.port,
                        attempt,
                        "Main process ready"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::debug!(
                        process = %self.resource.name,
                        port = self.probe.port,
                        attempt,
                        error = %e,
                        "Readiness probe failed"
                    );
                    if attempt < self.probe.attempts {
                        tokio::time::sleep(delay).await;
                        delay = std::cmp::min(delay * 2, MAX_PROBE_DELAY);
                    }
                }
            }
        }
        tracing::error!(
            process = %self.resource.name,
            port = self.probe.port,
            "Main process not ready within probe budget"
        );
        false
    }
}

#[async_trait]
impl ProcessHandler for MainProcessHandler {
    async fn init(&mut self) -> bool {
        if !self.resource.is_runnable() {
            tracing::error!(process = %self.resource.name, "Main resource has no executable path");
            return false;
        }
        true
    }

    async fn start(&mut self) -> bool {
        let child = match build_command(&self.resource, &self.env).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    process = %self.resource.name,
                    path = %self.resource.path,
                    error = %e,
                    "Failed to spawn main process"
                );
                return false;
            }
        };
        tracing::info!(
            process = %self.resource.name,
            pid = child.id(),
            "Main process started"
        );
        *self.pid.lock() = child.id();
        *self.child.lock().await = Some(child);
        self.probe_ready().await
    }

    async fn wait_for(&mut self) -> bool {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };
        matches!(child.wait().await, Ok(status) if status.success())
    }

    async fn stop(&mut self) {
        let pid = *self.pid.lock();
        stop_group(&self.resource.name, pid, self.grace).await;
    }

    fn is_running(&mut self) -> bool {
        // While the monitor holds the child lock it is blocked in wait(),
        // which means the process has not terminated.
        match self.child.try_lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            },
            Err(_) => true,
        }
    }

    fn name(&self) -> &str {
        &self.resource.name
    }
}

/// Blocks on main-process termination without holding the handler itself.
#[derive(Clone)]
pub struct MainWaitHandle {
    name: String,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
}

impl MainWaitHandle {
    /// Waits for the main process to terminate. Returns None when no process
    /// was ever spawned.
    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.wait().await {
            Ok(status) => {
                tracing::info!(process = %self.name, %status, "Main process terminated");
                Some(status)
            }
            Err(e) => {
                tracing::error!(process = %self.name, error = %e, "Waiting on main process failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(port: u16) -> ProbeConfig {
        ProbeConfig {
            host: "127.0.0.1".to_string(),
            port,
            attempts: 3,
            interval: Duration::from_millis(20),
        }
    }

    fn main_handler(path: &str, args: &[&str], port: u16) -> MainProcessHandler {
        MainProcessHandler::new(
            Resource::new("main", path).with_args(args),
            HashMap::new(),
            probe(port),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn portless_main_is_ready_once_spawned() {
        let mut h = main_handler("/bin/sleep", &["5"], 0);
        assert!(h.start().await);
        assert!(h.is_running());
        h.stop().await;
    }

    #[tokio::test]
    async fn probe_succeeds_against_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut h = main_handler("/bin/sleep", &["5"], port);
        assert!(h.start().await);
        h.stop().await;
        drop(listener);
    }

    #[tokio::test]
    async fn probe_fails_when_nothing_listens() {
        // Bind and immediately drop to get a port that is very likely closed.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut h = main_handler("/bin/sleep", &["5"], port);
        assert!(!h.start().await);
        h.stop().await;
    }

    #[tokio::test]
    async fn wait_handle_observes_termination() {
        let mut h = main_handler("/bin/sh", &["-c", "exit 0"], 0);
        assert!(h.start().await);
        let status = h.wait_handle().wait().await.unwrap();
        assert!(status.success());
    }
}
