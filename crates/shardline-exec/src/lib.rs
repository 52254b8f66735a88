//! Execution of routed plans and compiled statement sets against data nodes
//!
//! Backends are reached only through [`TransactionSession`]; the executor
//! never opens connections on its own.

#[cfg(feature = "duckdb")]
mod duck;
mod executor;
mod gsi;
mod query;
mod session;

#[cfg(feature = "duckdb")]
pub use duck::DuckSession;
pub use executor::{ExecutionReport, ShardedDmlExecutor, SubRecord, UpdateResult};
pub use gsi::{GsiService, IndexUpdate};
pub use query::ViewExecutor;
pub use session::{BackendError, ConnectionSet, Outcome, PhysicalConnection, Rows, TransactionSession};

use shardline_ir::TableType;
use shardline_route::RouteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Cannot open connection to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Statement failed on {target}: {source} [{sql}]")]
    Physical {
        target: String,
        sql: String,
        #[source]
        source: BackendError,
    },

    #[error("Unsupported table type {table_type} for {table}")]
    UnsupportedTableType { table: String, table_type: TableType },

    #[error("Cannot execute plan rooted at {0}")]
    UnsupportedPlan(String),

    #[error("Index update failed for {table}: {source}")]
    Index {
        table: String,
        #[source]
        source: BackendError,
    },

    #[error("Route error: {0}")]
    Route(#[from] RouteError),
}
