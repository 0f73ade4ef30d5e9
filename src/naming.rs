//! Naming service.
//!
//! Maps service names to naming-node paths under a fixed root and encodes
//! the node payload: the path of the container offering the service plus the
//! status it advertises to dependents. Pure path and codec logic; all store
//! traffic stays with the callers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::leaf_name;
use crate::error::Result;

/// Status a service advertises to its dependents.
///
/// Advances `NotInitialized -> Initialized` once the main process is up and
/// may regress to `NotRunning` on a crash. `Updated` marks a descriptor
/// change; it is recorded but not acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    NotInitialized,
    Initialized,
    NotRunning,
    Updated,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::NotInitialized => write!(f, "NOT_INITIALIZED"),
            ServiceStatus::Initialized => write!(f, "INITIALIZED"),
            ServiceStatus::NotRunning => write!(f, "NOT_RUNNING"),
            ServiceStatus::Updated => write!(f, "UPDATED"),
        }
    }
}

/// Payload of a naming node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    /// Path of the container node offering the service.
    pub container_path: String,
    pub status: ServiceStatus,
}

impl ServiceNode {
    pub fn new(container_path: impl Into<String>) -> Self {
        Self {
            container_path: container_path.into(),
            status: ServiceStatus::NotInitialized,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Path resolution between service names and naming nodes.
#[derive(Debug, Clone)]
pub struct NamingService {
    root: String,
}

impl NamingService {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    /// Naming-node path for a service name.
    pub fn service_path(&self, service: &str) -> String {
        format!("{}/{}", self.root, service)
    }

    /// Service name encoded in a naming-node path.
    pub fn service_name<'a>(&self, path: &'a str) -> &'a str {
        leaf_name(path)
    }

    /// Bulk resolution for a dependency list.
    pub fn resolve_all(&self, services: &[String]) -> HashMap<String, String> {
        services
            .iter()
            .map(|name| (name.clone(), self.service_path(name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_round_trip() {
        let ns = NamingService::new("/fidelio/naming");
        let path = ns.service_path("web1");
        assert_eq!(path, "/fidelio/naming/web1");
        assert_eq!(ns.service_name(&path), "web1");
    }

    #[test]
    fn resolve_all_maps_every_dependency() {
        let ns = NamingService::new("/fidelio/naming");
        let deps = vec!["a".to_string(), "b".to_string()];
        let resolved = ns.resolve_all(&deps);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["a"], "/fidelio/naming/a");
        assert_eq!(resolved["b"], "/fidelio/naming/b");
    }

    #[test]
    fn payload_round_trip() {
        let mut node = ServiceNode::new("/fidelio/containers/WebContainer/web1");
        node.status = ServiceStatus::Initialized;
        let decoded = ServiceNode::from_bytes(&node.to_bytes().unwrap()).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&ServiceStatus::NotRunning).unwrap();
        assert_eq!(json, "\"NOT_RUNNING\"");
        let parsed: ServiceStatus = serde_json::from_str("\"INITIALIZED\"").unwrap();
        assert_eq!(parsed, ServiceStatus::Initialized);
    }
}
