//! Process execution engine.
//!
//! Each declared [`Resource`](crate::schema::Resource) is driven by a
//! [`ProcessHandler`]: short-lived resources by
//! [`DefaultProcessHandler`], the long-running main process by
//! [`MainProcessHandler`]. Group handlers compose them in declaration
//! order; the [`ProcessManager`] owns both groups on behalf of the broker.

mod default;
mod group;
mod main;
mod manager;

pub use default::DefaultProcessHandler;
pub use group::{StartGroupHandler, StartOutcome, StopGroupHandler};
pub use main::{MainProcessHandler, MainWaitHandle, ProbeConfig};
pub use manager::ProcessManager;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::schema::Resource;

/// Capability every process handler exposes.
#[async_trait]
pub trait ProcessHandler: Send {
    /// Verifies the resource can be executed. Failures are logged.
    async fn init(&mut self) -> bool;

    /// Launches the process. For the main process this includes the
    /// readiness probe; true means the process is running (and ready).
    async fn start(&mut self) -> bool;

    /// Blocks until the process terminates; true iff the exit status is zero.
    async fn wait_for(&mut self) -> bool;

    /// Stops the process group, escalating from SIGTERM to SIGKILL after the
    /// grace period.
    async fn stop(&mut self);

    fn is_running(&mut self) -> bool;

    fn name(&self) -> &str;
}

/// Builds the command for a resource. Every spawned process gets its own
/// process group so stop() can signal the whole tree.
pub(crate) fn build_command(resource: &Resource, env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new(&resource.path);
    cmd.args(&resource.args)
        .envs(env)
        .stdin(Stdio::null())
        .process_group(0)
        .kill_on_drop(false);
    if let Some(dir) = &resource.work_dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Signals an entire process group. PIDs above i32::MAX cannot be used with
/// Unix signal calls and are refused.
pub(crate) fn signal_group(pid: u32, signal: Signal) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID unusable for signal operations");
        return false;
    }
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, signal = %signal, error = %e, "Process group signal failed");
            false
        }
    }
}

/// Whether the process group still exists (signal 0 probe).
pub(crate) fn group_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    killpg(Pid::from_raw(pid as i32), None).is_ok()
}

/// SIGTERM the group, give it up to `grace` to exit, then SIGKILL whatever
/// is left.
pub(crate) async fn stop_group(name: &str, pid: Option<u32>, grace: Duration) {
    let Some(pid) = pid else {
        return;
    };
    if !group_alive(pid) {
        return;
    }
    tracing::info!(process = name, pid, "Stopping process group");
    if !signal_group(pid, Signal::SIGTERM) {
        return;
    }
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !group_alive(pid) {
            return;
        }
    }
    if signal_group(pid, Signal::SIGKILL) {
        tracing::warn!(process = name, pid, "Escalated to SIGKILL");
    }
}
