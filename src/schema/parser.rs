//! Application schema file loading.
//!
//! The schema file is YAML: an application name plus the list of container
//! descriptors. Structural validation (names present, start groups runnable)
//! happens here; dependency validation (cycles, duplicates) is the
//! analyzer's job.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::ContainerDescriptor;
use crate::error::{Error, Result};

/// A parsed application schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSchema {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub containers: Vec<ContainerDescriptor>,
}

/// Loads and structurally validates application schema files.
#[derive(Debug, Default)]
pub struct SchemaParser;

impl SchemaParser {
    pub fn new() -> Self {
        Self
    }

    /// Loads a schema from a YAML file.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<AppSchema> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Could not read schema file {}: {}", path.display(), e))
        })?;
        self.parse(&contents)
    }

    /// Parses a schema from a YAML string.
    pub fn parse(&self, contents: &str) -> Result<AppSchema> {
        let schema: AppSchema = serde_yaml::from_str(contents)?;
        self.check(&schema)?;
        Ok(schema)
    }

    fn check(&self, schema: &AppSchema) -> Result<()> {
        if schema.containers.is_empty() {
            return Err(Error::InvalidSchema(
                "schema declares no containers".to_string(),
            ));
        }
        for container in &schema.containers {
            if container.service_name.is_empty() {
                return Err(Error::InvalidSchema(
                    "container with empty service name".to_string(),
                ));
            }
            if container.service_name.contains('/') {
                return Err(Error::InvalidSchema(format!(
                    "service name '{}' may not contain '/'",
                    container.service_name
                )));
            }
            let main = container.start.main.as_ref().ok_or_else(|| {
                Error::InvalidSchema(format!(
                    "container '{}' declares no main process",
                    container.service_name
                ))
            })?;
            if !main.is_runnable() {
                return Err(Error::InvalidSchema(format!(
                    "main process of '{}' has no executable path",
                    container.service_name
                )));
            }
            for requirement in &container.requires {
                if requirement == &container.service_name {
                    return Err(Error::InvalidSchema(format!(
                        "container '{}' requires itself",
                        container.service_name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
name: shop
containers:
  - service_name: db
    type: Data
    start:
      main: { name: postgres, path: /usr/bin/postgres }
    env: { host_port: 5432 }
  - service_name: api
    type: Business
    requires: [db]
    start:
      pre_main:
        - { name: migrate, path: /usr/bin/migrate }
      main: { name: api, path: /usr/bin/api, args: ["--port", "8080"] }
    env: { host_port: 8080 }
"#;

    #[test]
    fn parses_valid_schema() {
        let schema = SchemaParser::new().parse(SCHEMA).unwrap();
        assert_eq!(schema.name, "shop");
        assert_eq!(schema.containers.len(), 2);
        assert_eq!(schema.containers[1].requires, ["db"]);
        assert_eq!(schema.containers[1].start.pre_main.len(), 1);
    }

    #[test]
    fn rejects_missing_main() {
        let bad = r#"
containers:
  - service_name: a
    type: Web
    start: {}
"#;
        let err = SchemaParser::new().parse(bad).unwrap_err();
        assert!(err.to_string().contains("no main process"));
    }

    #[test]
    fn rejects_self_dependency() {
        let bad = r#"
containers:
  - service_name: a
    type: Web
    requires: [a]
    start:
      main: { name: a, path: /bin/a }
"#;
        let err = SchemaParser::new().parse(bad).unwrap_err();
        assert!(err.to_string().contains("requires itself"));
    }

    #[test]
    fn rejects_empty_schema() {
        assert!(SchemaParser::new().parse("containers: []").is_err());
    }
}
