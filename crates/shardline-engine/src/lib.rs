//! Shardline engine: configuration, logging, catalog and plan baselines
//! around the compiler and executor crates.
//!
//! SQL parsing stays with the caller; statements arrive as
//! [`shardline_ast::Statement`] values.

pub mod baseline;
pub mod catalog;
pub mod config;
mod engine;
pub mod logging;

pub use baseline::{Baseline, BaselineError, BaselinePlan, CachedPlan, MemoryPlanPersistor, PlanManager, PlanPersistor};
pub use catalog::{InMemorySequence, StaticCatalog};
pub use config::{Config, ConfigError, LoggingConfig};
pub use engine::{Engine, StatementResult};

use shardline_exec::ExecError;
use shardline_planner::PlanError;
use shardline_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Baseline error: {0}")]
    Baseline(#[from] BaselineError),
}
