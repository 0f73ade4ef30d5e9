//! # Fidelio
//!
//! Orchestration for multi-container applications with declared
//! inter-service dependencies. Every container is paired with an
//! in-container agent, the [`Broker`], that coordinates startup,
//! configuration exchange, liveness monitoring and ordered shutdown through
//! a watch-based, hierarchical key/value store.
//!
//! ## Architecture
//!
//! - The [`Master`] validates the application schema (no duplicate names,
//!   no dependency cycles), publishes one configuration node per container
//!   and launches containers through a [`runtime::ContainerRuntime`].
//! - Each [`Broker`] claims its container node, retrieves its descriptor,
//!   registers in the naming service, waits for its dependencies to reach
//!   INITIALIZED, executes its process group and monitors the main process.
//! - Shutdown is signaled by creating a well-known node; brokers tear down
//!   in reverse dependency order, each waiting for its dependents to
//!   disappear first.
//!
//! ## Quick start
//!
//! ```no_run
//! use fidelio::runtime::LocalRuntime;
//! use fidelio::store::MemoryStore;
//! use fidelio::{Master, ProgramConfig, SchemaParser, StoreLayout};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), fidelio::Error> {
//! let schema = SchemaParser::new().load("fidelio.yaml")?;
//! let store = Arc::new(MemoryStore::new());
//! let config = ProgramConfig::default();
//! let runtime = Arc::new(LocalRuntime::new(store.clone(), config.clone()));
//! let master = Master::new(store, runtime, config, StoreLayout::default(), schema)?;
//! master.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod dependency;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod master;
pub mod naming;
pub mod process;
pub mod runtime;
pub mod schema;
pub mod services;
pub mod store;
pub mod tasks;

// Re-export commonly used types
pub use broker::{Broker, BrokerSpec};
pub use config::{ProgramConfig, StoreLayout};
pub use dependency::Analyzer;
pub use error::{Error, Result};
pub use master::Master;
pub use naming::{NamingService, ServiceStatus};
pub use schema::{AppSchema, ContainerDescriptor, ContainerType, SchemaParser};
pub use services::ServiceManager;
