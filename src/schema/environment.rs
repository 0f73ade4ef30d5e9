//! Container environment declaration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_host() -> String {
    "localhost".to_string()
}

/// The environment a container exports: the address its main process listens
/// on plus free-form key/value entries.
///
/// A `host_port` of 0 means the main process exposes no socket; the readiness
/// probe is skipped for such containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEnvironment {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub host_port: u16,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub entries: HashMap<String, String>,
}

impl Default for ContainerEnvironment {
    fn default() -> Self {
        Self {
            host: default_host(),
            host_port: 0,
            entries: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_defaults_to_localhost() {
        let env: ContainerEnvironment = serde_json::from_str("{}").unwrap();
        assert_eq!(env.host, "localhost");
        assert_eq!(env.host_port, 0);
    }
}
