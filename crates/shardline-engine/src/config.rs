//! Engine configuration
//!
//! Loaded from a YAML file; environment variables override file values:
//! - `SHARDLINE_MATCH_LIMIT`, `SHARDLINE_JOIN_REORDER`, `SHARDLINE_GLOBAL_READ`
//! - `RUST_LOG`, `LOG_FORMAT`, `LOG_OUTPUT`, `LOG_DIR`

use serde::{Deserialize, Serialize};
use shardline_ir::{DataNode, TableType};
use shardline_planner::OptimizerOptions;
use shardline_registry::ShardingRuleSpec;
use shardline_route::ReadReplica;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value {value:?} for {key}")]
    InvalidEnvVar { key: String, value: String },

    #[error("Invalid table {table}: {reason}")]
    InvalidTable { table: String, reason: String },
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific directives
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCacheConfig {
    pub enabled: bool,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    pub columns: Vec<String>,
}

/// One logical table and its placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub table_type: TableType,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub auto_increment: Option<String>,
    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
    #[serde(default)]
    pub row_count: Option<f64>,
    /// Rule for `sharding` tables.
    #[serde(default)]
    pub sharding: Option<ShardingRuleSpec>,
    /// Replicas of a `global` table.
    #[serde(default)]
    pub replicas: Vec<DataNode>,
    /// Home of a `normal` table.
    #[serde(default)]
    pub node: Option<DataNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub default_schema: String,
    pub tables: Vec<TableConfig>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            default_schema: "public".to_string(),
            tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub optimizer: OptimizerOptions,
    pub plan_cache: PlanCacheConfig,
    pub topology: TopologyConfig,
}

impl Config {
    /// Load configuration from a YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply overrides looked up by variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(limit) = lookup("SHARDLINE_MATCH_LIMIT") {
            self.optimizer.match_limit = parse_env("SHARDLINE_MATCH_LIMIT", &limit, |v| v.parse().ok())?;
        }
        if let Some(reorder) = lookup("SHARDLINE_JOIN_REORDER") {
            self.optimizer.join_reorder = parse_env("SHARDLINE_JOIN_REORDER", &reorder, parse_bool)?;
        }
        if let Some(read) = lookup("SHARDLINE_GLOBAL_READ") {
            self.optimizer.global_read = parse_env("SHARDLINE_GLOBAL_READ", &read, |v| {
                match v.to_ascii_lowercase().as_str() {
                    "first" => Some(ReadReplica::First),
                    "last" => Some(ReadReplica::Last),
                    _ => None,
                }
            })?;
        }

        if let Some(level) = lookup("RUST_LOG") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(output) = lookup("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Some(dir) = lookup("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T, ConfigError> {
    parse(value.trim()).ok_or_else(|| ConfigError::InvalidEnvVar {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
