//! Application schema types.
//!
//! A schema describes a multi-container application: one [`ContainerDescriptor`]
//! per container, each naming the services it requires, the process groups to
//! run and the environment it exports to its dependents. The master parses a
//! schema file, validates it and publishes one serialized descriptor per
//! container to the coordination store; every broker deserializes its own.

mod environment;
mod parser;
mod resource;

pub use environment::ContainerEnvironment;
pub use parser::{AppSchema, SchemaParser};
pub use resource::{ProcessGroup, Resource, TaskSpec, Tasks};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::Result;

/// Tier of a container within the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerType {
    Web,
    Business,
    Data,
}

impl ContainerType {
    pub const ALL: [ContainerType; 3] =
        [ContainerType::Web, ContainerType::Business, ContainerType::Data];

    /// Directory name used for this type under the containers root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ContainerType::Web => "WebContainer",
            ContainerType::Business => "BusinessContainer",
            ContainerType::Data => "DataContainer",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "WebContainer" => Some(ContainerType::Web),
            "BusinessContainer" => Some(ContainerType::Business),
            "DataContainer" => Some(ContainerType::Data),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerType::Web => write!(f, "web"),
            ContainerType::Business => write!(f, "business"),
            ContainerType::Data => write!(f, "data"),
        }
    }
}

/// Description of one container: identity, dependencies, processes, tasks
/// and exported environment.
///
/// Immutable from the broker's point of view. `is_required_from` is a derived
/// field populated by the dependency analyzer before launch; it is kept as a
/// set of service names so descriptors stay acyclic and serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    /// The service name, unique within the application.
    pub service_name: String,

    #[serde(rename = "type")]
    pub container_type: ContainerType,

    /// Services this container depends on.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Services that depend on this container (reverse edges, derived).
    #[serde(default)]
    pub is_required_from: BTreeSet<String>,

    /// Processes run at startup.
    pub start: ProcessGroup,

    /// Processes run at shutdown.
    #[serde(default)]
    pub stop: ProcessGroup,

    /// Optional pre-start / post-stop hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Tasks>,

    /// Environment exported to this container's processes and dependents.
    #[serde(default)]
    pub env: ContainerEnvironment,
}

impl ContainerDescriptor {
    /// Serializes the descriptor to its wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes a descriptor from its wire format.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
