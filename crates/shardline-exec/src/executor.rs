//! Sharded DML execution: one pass over a compiled statement set

use crate::gsi::{GsiService, IndexUpdate};
use crate::session::{ConnectionSet, PhysicalConnection, TransactionSession};
use crate::ExecError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shardline_ir::{TableType, Value};
use shardline_route::{CompiledStatement, IndexMaintenance, SqlSet};
use std::time::{Duration, Instant};
use tracing::debug;

/// Aggregated outcome of a multi-node write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub affected_rows: u64,
    pub last_insert_id: Option<i64>,
}

/// Timing and outcome of one physical statement.
#[derive(Debug, Clone, Serialize)]
pub struct SubRecord {
    pub target: String,
    pub sql: String,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
    pub affected: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub result: UpdateResult,
    pub records: Vec<SubRecord>,
}

#[derive(Default)]
pub struct ShardedDmlExecutor<'a> {
    gsi: Option<&'a dyn GsiService>,
}

impl<'a> ShardedDmlExecutor<'a> {
    pub fn new() -> Self {
        Self { gsi: None }
    }

    pub fn with_gsi(mut self, gsi: &'a dyn GsiService) -> Self {
        self.gsi = Some(gsi);
        self
    }

    /// Run every statement in set order. The first failure aborts the call;
    /// statements already applied are left to the session to roll back.
    pub fn execute(
        &self,
        table_type: TableType,
        statements: &SqlSet,
        session: &dyn TransactionSession,
    ) -> Result<ExecutionReport, ExecError> {
        if table_type == TableType::Custom {
            let table = statements.iter().next().map(|s| s.node.to_string()).unwrap_or_default();
            return Err(ExecError::UnsupportedTableType { table, table_type });
        }

        let mut connections = ConnectionSet::new(session);
        let mut report = ExecutionReport::default();
        for statement in statements {
            let conn = connections.get(statement.target())?;

            let keys = match &statement.maintenance {
                Some(maintenance) => Some(pre_write_keys(&mut *conn, statement, maintenance)?),
                None => None,
            };

            let started = Utc::now();
            let clock = Instant::now();
            let outcome = conn
                .execute_update(&statement.sql, &statement.params)
                .map_err(|source| ExecError::Physical {
                    target: statement.target().to_string(),
                    sql: statement.sql.clone(),
                    source,
                })?;
            let elapsed = clock.elapsed();
            debug!(
                node = %statement.target(),
                sql = %statement.sql,
                affected = outcome.affected,
                elapsed_us = elapsed.as_micros() as u64,
                "Executed physical statement"
            );

            report.result.affected_rows += outcome.affected;
            if let Some(id) = outcome.last_insert_id.filter(|id| *id > 0) {
                report.result.last_insert_id = Some(id);
            }
            report.records.push(SubRecord {
                target: statement.target().to_string(),
                sql: statement.sql.clone(),
                started,
                elapsed,
                affected: outcome.affected,
            });

            if let (Some(maintenance), Some(keys)) = (&statement.maintenance, keys) {
                self.maintain_index(session, statement, maintenance, keys)?;
            }
        }
        Ok(report)
    }

    fn maintain_index(
        &self,
        session: &dyn TransactionSession,
        statement: &CompiledStatement,
        maintenance: &IndexMaintenance,
        primary_keys: Vec<Vec<Value>>,
    ) -> Result<(), ExecError> {
        let Some(gsi) = self.gsi else {
            return Ok(());
        };
        let update = IndexUpdate {
            tx_id: session.transaction_id().to_string(),
            schema: maintenance.table.schema.clone(),
            table: maintenance.table.table.clone(),
            op: maintenance.op,
            changed_columns: maintenance.changed_columns.clone(),
            primary_keys,
            target: statement.target().to_string(),
        };
        gsi.update_by_primary_key(&update).map_err(|source| ExecError::Index {
            table: maintenance.table.to_string(),
            source,
        })
    }
}

/// Identity of the rows a write is about to touch.
fn pre_write_keys(
    conn: &mut dyn PhysicalConnection,
    statement: &CompiledStatement,
    maintenance: &IndexMaintenance,
) -> Result<Vec<Vec<Value>>, ExecError> {
    if let Some(keys) = &maintenance.known_keys {
        return Ok(keys.clone());
    }
    let Some(pre_read) = &statement.pre_read else {
        return Ok(Vec::new());
    };
    let rows = conn
        .query(&pre_read.sql, &pre_read.params)
        .map_err(|source| ExecError::Physical {
            target: statement.target().to_string(),
            sql: pre_read.sql.clone(),
            source,
        })?;
    debug!(node = %statement.target(), keys = rows.len(), "Captured primary keys before write");
    Ok(rows.rows)
}
