//! Infrastructure layer: the running engine.
//!
//! - `jobs`: definitions, persistence, recovery and the Queue Manager
//! - `workers`: worker session provisioning
//! - `extensions`: discovery, compatibility, trust and atomic reload
//! - `config`: configuration loading and representation
//! - `orchestrator`: wiring of all of the above

pub mod config;
pub mod extensions;
pub mod jobs;
pub mod orchestrator;
pub mod workers;

pub use config::{ConfigError, DispatcherConfig, OrchestratorConfig, QueueConfig};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorError, StartReport};
