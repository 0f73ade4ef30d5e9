use miette::Diagnostic;
use std::io;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid application schema: {0}")]
    #[diagnostic(
        code(fidelio::schema::invalid),
        help("Run `fidelio validate` against the schema file for details")
    )]
    InvalidSchema(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Coordination store error: {0}")]
    #[diagnostic(
        code(fidelio::store::error),
        help("Check that the coordination store is reachable and the session is alive")
    )]
    Store(#[from] StoreError),

    #[error("Container node '{0}' is owned by another broker")]
    #[diagnostic(
        code(fidelio::broker::contention),
        help("Two brokers claimed the same container path. Check for duplicate launches")
    )]
    ContainerConflict(String),

    #[error("Required node missing: {0}")]
    #[diagnostic(code(fidelio::store::missing_node))]
    MissingNode(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Timed out while {0}")]
    Timeout(String),

    #[error("Container runtime error: {0}")]
    #[diagnostic(
        code(fidelio::runtime::error),
        help("Check that the container runtime is running and reachable")
    )]
    Runtime(String),

    #[error("Fatal broker failure: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::InvalidSchema(_) => {
                Some("Validate the schema with: fidelio validate --schema <file>".to_string())
            }
            Error::Config(_) => {
                Some("Check the coordination-store hosts and the schema path".to_string())
            }
            Error::ContainerConflict(path) => Some(format!(
                "Another broker holds '{}'. Stop the duplicate container or wait for its session to expire.",
                path
            )),
            Error::Store(StoreError::SessionExpired) => Some(
                "The coordination-store session expired and could not be recovered. Restart the broker."
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}
