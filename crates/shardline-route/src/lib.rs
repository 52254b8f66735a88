//! Shard routing: predicate analysis, distribution resolution and
//! per-data-node statement rewriting.

mod analyzer;
mod insert;
mod resolver;
mod rewriter;

pub use analyzer::PredicateAnalyzer;
pub use insert::{AutoIncrement, InsertPlan, InsertRewriter, InsertRouting};
pub use resolver::{DistributionResolver, ReadReplica, Resolution, ShardingInput};
pub use rewriter::{primary_key_select, CompiledStatement, IndexMaintenance, PreRead, SqlSet, StatementRewriter};

use shardline_ast::{BindError, RenderError};
use shardline_ir::TableType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Unsupported table type {table_type} for {table}")]
    UnsupportedTableType { table: String, table_type: TableType },

    #[error("Updating sharding key column {column} of {table} is not supported")]
    ShardingKeyUpdate { table: String, column: String },

    #[error("INSERT into {table} does not supply sharding column {column}")]
    MissingShardingKey { table: String, column: String },

    #[error("Row {row} of INSERT into {table} does not map to a single data node")]
    UnplacedRow { table: String, row: usize },

    #[error("Statement is not an INSERT")]
    NotAnInsert,

    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),
}
