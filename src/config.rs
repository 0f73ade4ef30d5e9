//! Program configuration for the master and the brokers.
//!
//! Two concerns live here: connection settings for the coordination store
//! (hosts, timeouts) and the layout of the store tree shared between the
//! master and every broker.

use std::path::PathBuf;
use std::time::Duration;

use crate::schema::ContainerType;

/// Default client session timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for establishing the initial connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection and probe settings shared by master and broker.
#[derive(Debug, Clone)]
pub struct ProgramConfig {
    /// Coordination-store host:port list. `"local"` selects the in-process store.
    pub hosts: String,
    /// Client session timeout.
    pub session_timeout: Duration,
    /// Timeout for establishing the initial connection.
    pub connect_timeout: Duration,
    /// Maximum attempts for the main-process readiness probe.
    pub readiness_attempts: usize,
    /// Initial delay between readiness probe attempts (doubles each retry).
    pub readiness_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping a process.
    pub grace_period: Duration,
    /// Scratch directory for descriptor snapshot files written by brokers.
    pub services_dir: PathBuf,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            hosts: "local".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            readiness_attempts: 8,
            readiness_interval: Duration::from_millis(250),
            grace_period: Duration::from_secs(10),
            services_dir: std::env::temp_dir().join("fidelio-services"),
        }
    }
}

impl ProgramConfig {
    /// Builds a configuration from defaults overridden by environment variables.
    ///
    /// Honored variables: `FIDELIO_HOSTS`, `FIDELIO_SESSION_TIMEOUT` (seconds),
    /// `FIDELIO_SERVICES_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(hosts) = std::env::var("FIDELIO_HOSTS") {
            config.hosts = hosts;
        }
        if let Ok(secs) = std::env::var("FIDELIO_SESSION_TIMEOUT") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.session_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(dir) = std::env::var("FIDELIO_SERVICES_DIR") {
            config.services_dir = PathBuf::from(dir);
        }
        config
    }
}

/// Layout of the coordination-store tree.
///
/// ```text
/// <root>/
///   containers/<Type>/<svc>   ephemeral, owned by the broker
///   conf/<svc>                persistent, descriptor payload (master)
///   naming/<svc>              ephemeral, { containerPath, status } (broker)
///   shutdown                  persistent, created to signal global shutdown
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: String,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::new("/fidelio")
    }
}

impl StoreLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn containers_root(&self) -> String {
        format!("{}/containers", self.root)
    }

    pub fn containers_type_root(&self, container_type: ContainerType) -> String {
        format!("{}/containers/{}", self.root, container_type.dir_name())
    }

    pub fn container_path(&self, container_type: ContainerType, service: &str) -> String {
        format!(
            "{}/containers/{}/{}",
            self.root,
            container_type.dir_name(),
            service
        )
    }

    pub fn conf_root(&self) -> String {
        format!("{}/conf", self.root)
    }

    pub fn conf_path(&self, service: &str) -> String {
        format!("{}/conf/{}", self.root, service)
    }

    pub fn naming_root(&self) -> String {
        format!("{}/naming", self.root)
    }

    pub fn shutdown_path(&self) -> String {
        format!("{}/shutdown", self.root)
    }

    /// All persistent parent nodes the master creates before publishing
    /// configuration, in creation order.
    pub fn parent_paths(&self) -> Vec<String> {
        let mut paths = vec![self.root.clone(), self.containers_root()];
        for t in ContainerType::ALL {
            paths.push(self.containers_type_root(t));
        }
        paths.push(self.conf_root());
        paths.push(self.naming_root());
        paths
    }

    /// Extracts the container type encoded in a container-node path.
    pub fn container_type_of_path(&self, path: &str) -> Option<ContainerType> {
        let rest = path.strip_prefix(&format!("{}/containers/", self.root))?;
        let type_dir = rest.split('/').next()?;
        ContainerType::from_dir_name(type_dir)
    }
}

/// Extracts the last path segment, used to map node paths back to service names.
pub fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
