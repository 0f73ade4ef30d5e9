//! Per-broker view of the dependency services.
//!
//! Keyed by naming-node path. Each entry tracks what the broker has learned
//! about one required service: its advertised status, the container node
//! offering it, whether its configuration has been processed and, once
//! retrieved, its descriptor. Writes are serialized by the broker's event
//! loop; the mutex only guards cross-task reads.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::naming::ServiceStatus;
use crate::schema::ContainerDescriptor;

/// Whether a dependency's configuration has been retrieved and processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfStatus {
    NotProcessed,
    Processed,
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub service_name: String,
    /// Container node offering the service, learned from the naming node.
    pub container_path: Option<String>,
    /// Last status observed on the naming node. None until first read and
    /// after the naming node disappears.
    pub status: Option<ServiceStatus>,
    pub conf_status: ConfStatus,
    pub descriptor: Option<ContainerDescriptor>,
}

impl ServiceEntry {
    fn new(service_name: String) -> Self {
        Self {
            service_name,
            container_path: None,
            status: None,
            conf_status: ConfStatus::NotProcessed,
            descriptor: None,
        }
    }
}

/// Tracks the state of every service this broker depends on.
#[derive(Debug, Default)]
pub struct ServiceManager {
    entries: Mutex<HashMap<String, ServiceEntry>>,
}

impl ServiceManager {
    /// Builds the manager from `service name -> naming path` pairs.
    pub fn new(services: HashMap<String, String>) -> Self {
        let entries = services
            .into_iter()
            .map(|(name, path)| (path, ServiceEntry::new(name)))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn has_services(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    /// Naming paths of every tracked service.
    pub fn service_paths(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn is_tracked(&self, path: &str) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn entry(&self, path: &str) -> Option<ServiceEntry> {
        self.entries.lock().get(path).cloned()
    }

    pub fn set_status(&self, path: &str, status: ServiceStatus) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.status = Some(status);
        }
    }

    pub fn set_container_path(&self, path: &str, container_path: String) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.container_path = Some(container_path);
        }
    }

    pub fn set_descriptor(&self, path: &str, descriptor: ContainerDescriptor) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.descriptor = Some(descriptor);
        }
    }

    pub fn set_conf_processed(&self, path: &str) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.conf_status = ConfStatus::Processed;
        }
    }

    pub fn set_conf_not_processed(&self, path: &str) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.conf_status = ConfStatus::NotProcessed;
        }
    }

    /// Records that a service's naming node disappeared. The entry is reset,
    /// not removed, so the start guard can never pass while a dependency is
    /// gone.
    pub fn delete_service_node(&self, path: &str) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.status = None;
            entry.container_path = None;
            entry.conf_status = ConfStatus::NotProcessed;
        }
    }

    /// Start guard: every dependency has its configuration processed and
    /// advertises INITIALIZED.
    pub fn all_initialized_and_processed(&self) -> bool {
        self.entries.lock().values().all(|entry| {
            entry.conf_status == ConfStatus::Processed
                && entry.status == Some(ServiceStatus::Initialized)
        })
    }

    /// Descriptors of every dependency whose configuration was processed,
    /// paired with its service name. Input to environment composition.
    pub fn dependency_descriptors(&self) -> Vec<(String, ContainerDescriptor)> {
        let mut out: Vec<(String, ContainerDescriptor)> = self
            .entries
            .lock()
            .values()
            .filter_map(|entry| {
                entry
                    .descriptor
                    .clone()
                    .map(|d| (entry.service_name.clone(), d))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn manager() -> ServiceManager {
        ServiceManager::new(HashMap::from([
            ("a".to_string(), "/ns/a".to_string()),
            ("b".to_string(), "/ns/b".to_string()),
        ]))
    }

    #[test]
    fn empty_manager_has_no_services() {
        let m = ServiceManager::new(HashMap::new());
        assert!(!m.has_services());
        // With no dependencies the guard is vacuously satisfied.
        assert!(m.all_initialized_and_processed());
    }

    #[test]
    fn guard_requires_all_initialized_and_processed() {
        let m = manager();
        assert!(!m.all_initialized_and_processed());

        m.set_status("/ns/a", ServiceStatus::Initialized);
        m.set_conf_processed("/ns/a");
        assert!(!m.all_initialized_and_processed());

        m.set_status("/ns/b", ServiceStatus::Initialized);
        assert!(!m.all_initialized_and_processed());
        m.set_conf_processed("/ns/b");
        assert!(m.all_initialized_and_processed());
    }

    #[test]
    fn guard_fails_after_regression() {
        let m = manager();
        for path in ["/ns/a", "/ns/b"] {
            m.set_status(path, ServiceStatus::Initialized);
            m.set_conf_processed(path);
        }
        m.set_status("/ns/a", ServiceStatus::NotRunning);
        assert!(!m.all_initialized_and_processed());
    }

    #[test]
    fn deleted_node_resets_entry_but_keeps_key() {
        let m = manager();
        m.set_status("/ns/a", ServiceStatus::Initialized);
        m.set_container_path("/ns/a", "/containers/a".to_string());
        m.set_conf_processed("/ns/a");

        m.delete_service_node("/ns/a");
        let entry = m.entry("/ns/a").unwrap();
        assert_eq!(entry.status, None);
        assert_eq!(entry.container_path, None);
        assert_eq!(entry.conf_status, ConfStatus::NotProcessed);
        assert!(m.is_tracked("/ns/a"));
        assert!(!m.all_initialized_and_processed());
    }
}
