//! Ordered execution of process groups.

use tokio_util::sync::CancellationToken;

use super::{DefaultProcessHandler, MainProcessHandler, MainWaitHandle, ProcessHandler};

/// Result of running the start group.
///
/// The two failure cases drive different status updates: a failure before
/// the main process is up means the service is not running at all, while a
/// post-main failure leaves the main process alive but the service
/// incompletely initialized. A cancelled run publishes nothing; shutdown is
/// already draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Success,
    FailedBeforeMain,
    FailedAfterMain,
    Cancelled,
}

/// Runs the start group: every pre-main resource in declared order (all must
/// succeed), then the main process up to readiness, then every post-main
/// resource in declared order. Any failure aborts the remaining sequence.
pub struct StartGroupHandler {
    pre_main: Vec<DefaultProcessHandler>,
    main: MainProcessHandler,
    post_main: Vec<DefaultProcessHandler>,
}

impl StartGroupHandler {
    pub fn new(
        pre_main: Vec<DefaultProcessHandler>,
        main: MainProcessHandler,
        post_main: Vec<DefaultProcessHandler>,
    ) -> Self {
        Self {
            pre_main,
            main,
            post_main,
        }
    }

    pub fn main_wait_handle(&self) -> MainWaitHandle {
        self.main.wait_handle()
    }

    pub async fn exec(&mut self, cancel: &CancellationToken) -> StartOutcome {
        if cancel.is_cancelled() {
            return StartOutcome::Cancelled;
        }

        for handler in &mut self.pre_main {
            if !(handler.init().await && handler.start().await) {
                tracing::error!(process = handler.name(), "Pre-main resource failed");
                return StartOutcome::FailedBeforeMain;
            }
            let finished = tokio::select! {
                ok = handler.wait_for() => Some(ok),
                _ = cancel.cancelled() => None,
            };
            match finished {
                Some(true) => {}
                Some(false) => {
                    tracing::error!(process = handler.name(), "Pre-main resource failed");
                    return StartOutcome::FailedBeforeMain;
                }
                None => {
                    handler.stop().await;
                    return StartOutcome::Cancelled;
                }
            }
        }

        if !self.main.init().await {
            return StartOutcome::FailedBeforeMain;
        }
        let main_up = tokio::select! {
            ok = self.main.start() => Some(ok),
            _ = cancel.cancelled() => None,
        };
        match main_up {
            Some(true) => {}
            Some(false) => return StartOutcome::FailedBeforeMain,
            None => {
                self.main.stop().await;
                return StartOutcome::Cancelled;
            }
        }

        for handler in &mut self.post_main {
            if !(handler.init().await && handler.start().await) {
                tracing::error!(process = handler.name(), "Post-main resource failed");
                return StartOutcome::FailedAfterMain;
            }
            let finished = tokio::select! {
                ok = handler.wait_for() => Some(ok),
                _ = cancel.cancelled() => None,
            };
            match finished {
                Some(true) => {}
                Some(false) => {
                    tracing::error!(process = handler.name(), "Post-main resource failed");
                    return StartOutcome::FailedAfterMain;
                }
                None => {
                    handler.stop().await;
                    return StartOutcome::Cancelled;
                }
            }
        }

        StartOutcome::Success
    }

    pub async fn stop_main(&mut self) {
        self.main.stop().await;
    }
}

/// Runs every stop resource in order, best effort: failures are logged and
/// the sequence continues, because stop must always complete.
pub struct StopGroupHandler {
    handlers: Vec<DefaultProcessHandler>,
}

impl StopGroupHandler {
    pub fn new(handlers: Vec<DefaultProcessHandler>) -> Self {
        Self { handlers }
    }

    pub async fn exec(&mut self) {
        for handler in &mut self.handlers {
            if !(handler.init().await && handler.start().await && handler.wait_for().await) {
                tracing::warn!(process = handler.name(), "Stop resource failed; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProbeConfig;
    use crate::schema::Resource;
    use std::collections::HashMap;
    use std::time::Duration;

    fn default(path: &str, args: &[&str]) -> DefaultProcessHandler {
        DefaultProcessHandler::new(
            Resource::new(path, path).with_args(args),
            HashMap::new(),
            Duration::from_millis(100),
        )
    }

    fn main_proc() -> MainProcessHandler {
        MainProcessHandler::new(
            Resource::new("main", "/bin/sleep").with_args(&["5"]),
            HashMap::new(),
            ProbeConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                attempts: 1,
                interval: Duration::from_millis(10),
            },
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn full_group_succeeds() {
        let mut group = StartGroupHandler::new(
            vec![default("/bin/true", &[])],
            main_proc(),
            vec![default("/bin/true", &[])],
        );
        let cancel = CancellationToken::new();
        assert_eq!(group.exec(&cancel).await, StartOutcome::Success);
        group.stop_main().await;
    }

    #[tokio::test]
    async fn pre_main_failure_aborts_before_main() {
        let mut group = StartGroupHandler::new(
            vec![default("/bin/false", &[])],
            main_proc(),
            vec![default("/bin/true", &[])],
        );
        let cancel = CancellationToken::new();
        assert_eq!(group.exec(&cancel).await, StartOutcome::FailedBeforeMain);
    }

    #[tokio::test]
    async fn post_main_failure_reports_main_still_running() {
        let mut group = StartGroupHandler::new(
            vec![],
            main_proc(),
            vec![default("/bin/false", &[])],
        );
        let cancel = CancellationToken::new();
        assert_eq!(group.exec(&cancel).await, StartOutcome::FailedAfterMain);
        group.stop_main().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_pre_main() {
        let mut group = StartGroupHandler::new(
            vec![default("/bin/sleep", &["30"])],
            main_proc(),
            vec![],
        );
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(5), group.exec(&cancel))
            .await
            .expect("cancellation must interrupt the blocked wait");
        assert_eq!(outcome, StartOutcome::Cancelled);
    }

    #[tokio::test]
    async fn stop_group_continues_past_failures() {
        let mut group = StopGroupHandler::new(vec![
            default("/bin/false", &[]),
            default("/nonexistent/binary", &[]),
            default("/bin/true", &[]),
        ]);
        // Must not abort; all handlers are attempted.
        group.exec().await;
    }
}
