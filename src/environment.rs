//! Process environment composition.
//!
//! Builds the environment map handed to every process and task the broker
//! runs: the container's own environment plus each dependency's, namespaced
//! by the dependency's service name (`<DEP>_HOST`, `<DEP>_PORT`, custom
//! entries as `<DEP>_<KEY>`).

use std::collections::HashMap;

use crate::schema::ContainerEnvironment;

/// Turns a service name into an environment-variable prefix.
fn env_prefix(service: &str) -> String {
    service
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Immutable environment consumed by both process and task handlers.
#[derive(Debug, Clone)]
pub struct EnvironmentHandler {
    env: HashMap<String, String>,
}

impl EnvironmentHandler {
    /// Composes the environment from the container's own declaration and its
    /// dependencies' declarations.
    pub fn new(
        own: &ContainerEnvironment,
        dependencies: &[(String, ContainerEnvironment)],
    ) -> Self {
        let mut env = HashMap::new();

        env.insert("HOST".to_string(), own.host.clone());
        env.insert("PORT".to_string(), own.host_port.to_string());
        for (key, value) in &own.entries {
            env.insert(key.to_uppercase(), value.clone());
        }

        for (service, dep_env) in dependencies {
            let prefix = env_prefix(service);
            env.insert(format!("{}_HOST", prefix), dep_env.host.clone());
            env.insert(format!("{}_PORT", prefix), dep_env.host_port.to_string());
            for (key, value) in &dep_env.entries {
                env.insert(format!("{}_{}", prefix, key.to_uppercase()), value.clone());
            }
        }

        Self { env }
    }

    pub fn process_env(&self) -> &HashMap<String, String> {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(host: &str, port: u16, entries: &[(&str, &str)]) -> ContainerEnvironment {
        ContainerEnvironment {
            host: host.to_string(),
            host_port: port,
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn own_environment_is_unprefixed() {
        let handler = EnvironmentHandler::new(&env("localhost", 8080, &[("mode", "prod")]), &[]);
        let e = handler.process_env();
        assert_eq!(e["HOST"], "localhost");
        assert_eq!(e["PORT"], "8080");
        assert_eq!(e["MODE"], "prod");
    }

    #[test]
    fn dependencies_are_namespaced() {
        let deps = vec![
            ("db".to_string(), env("10.0.0.2", 5432, &[("user", "app")])),
            ("cache-1".to_string(), env("10.0.0.3", 6379, &[])),
        ];
        let handler = EnvironmentHandler::new(&env("localhost", 8080, &[]), &deps);
        let e = handler.process_env();
        assert_eq!(e["DB_HOST"], "10.0.0.2");
        assert_eq!(e["DB_PORT"], "5432");
        assert_eq!(e["DB_USER"], "app");
        // '-' is not valid in a variable name.
        assert_eq!(e["CACHE_1_HOST"], "10.0.0.3");
        assert_eq!(e["CACHE_1_PORT"], "6379");
    }
}
