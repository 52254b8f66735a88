//! Sharding-aware relational plan compiler
//!
//! Turns a bound logical plan into a physical plan whose leaves carry SQL for
//! concrete data nodes. The pipeline is fixed:
//!
//! 1. decorrelation of subqueries into semi/anti joins
//! 2. rule-based rewrites up to a bounded number of applications
//! 3. multi-join flattening when the plan has more than one join
//! 4. field trimming
//! 5. cost-based conversion into data-node views
//! 6. scan routing and materialization
//!
//! Mutations skip the relational pipeline and go straight to statement routing.

mod cbo;
mod compiler;
mod cost;
mod decorrelate;
mod explain;
mod join_reorder;
mod materialize;
mod routing;
mod rules;
mod to_sql;
mod trace;
mod trim;

pub use cbo::{in_convention, Cbo};
pub use compiler::{CachePolicy, CompiledPlan, MutationPlan, OptimizerOptions, Optimized, SqlCompiler};
pub use cost::CostModel;
pub use decorrelate::{decorrelate, SubQueryToCorrelate};
pub use explain::explain;
pub use join_reorder::{to_multi_join, JoinOrderer};
pub use materialize::materialize;
pub use routing::ScanRouter;
pub use rules::{
    FilterAggregateTranspose, FilterIntoJoin, FilterMerge, FilterProjectTranspose, FilterSetOpTranspose,
    JoinConditionPush, ReduceExpressions, RewriteRule, RuleProgram, DEFAULT_MATCH_LIMIT,
};
pub use to_sql::fragment_select;
pub use trace::{CompileTrace, Phase, TraceEvent};
pub use trim::trim_fields;

use shardline_ast::{BindError, RenderError};
use shardline_ir::{Expr, Schema, TableType};
use shardline_route::RouteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unsupported table type {table_type} for {table}")]
    UnsupportedTableType { table: String, table_type: TableType },

    #[error("Cannot express {0} as data node SQL")]
    Unrenderable(String),

    #[error("No data node of {table} on target {target}")]
    NotColocated { table: String, target: String },

    #[error("Expected a {expected} plan, found {found}")]
    UnexpectedPlan { expected: &'static str, found: &'static str },

    #[error("Bind error: {0}")]
    Bind(#[from] BindError),

    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),
}

/// Every column `expr` references resolves in `schema`.
pub(crate) fn resolves_in(expr: &Expr, schema: &Schema) -> bool {
    expr.column_refs()
        .iter()
        .all(|c| schema.resolve(c.table.as_deref(), &c.column).is_ok())
}
