//! Reads of routed plans: leaves run on their data nodes, rows concatenate

use crate::session::{ConnectionSet, Rows, TransactionSession};
use crate::ExecError;
use shardline_ir::{Expr, RelNode, Schema};
use std::collections::HashMap;
use tracing::debug;

/// Runs plans made of routed scans, gathers, spools, unions and constant
/// rows. Joins or aggregates above routed scans need an engine that can
/// evaluate them and are refused.
pub struct ViewExecutor<'s> {
    connections: ConnectionSet<'s>,
    spools: HashMap<usize, Rows>,
}

impl<'s> ViewExecutor<'s> {
    pub fn new(session: &'s dyn TransactionSession) -> Self {
        Self {
            connections: ConnectionSet::new(session),
            spools: HashMap::new(),
        }
    }

    pub fn execute(&mut self, plan: &RelNode) -> Result<Rows, ExecError> {
        match plan {
            RelNode::RoutedScan { target, sql, params, schema } => {
                let conn = self.connections.get(target)?;
                let mut rows = conn.query(sql, params).map_err(|source| ExecError::Physical {
                    target: target.clone(),
                    sql: sql.clone(),
                    source,
                })?;
                debug!(node = %target, rows = rows.len(), "Fetched routed scan");
                rows.columns = column_names(schema);
                Ok(rows)
            }
            RelNode::Gather { inputs } | RelNode::Union { inputs, all: true } => {
                let mut out = Rows {
                    columns: column_names(&plan.schema()),
                    rows: Vec::new(),
                };
                for input in inputs {
                    out.rows.extend(self.execute(input)?.rows);
                }
                Ok(out)
            }
            RelNode::Union { inputs, all: false } => {
                let mut out = Rows {
                    columns: column_names(&plan.schema()),
                    rows: Vec::new(),
                };
                for input in inputs {
                    for row in self.execute(input)?.rows {
                        if !out.rows.contains(&row) {
                            out.rows.push(row);
                        }
                    }
                }
                Ok(out)
            }
            RelNode::Spool { id, input } => {
                let rows = self.execute(input)?;
                self.spools.insert(*id, rows.clone());
                Ok(rows)
            }
            RelNode::SpoolRef { id, .. } => self
                .spools
                .get(id)
                .cloned()
                .ok_or_else(|| ExecError::UnsupportedPlan(format!("SpoolRef({}) before its Spool", id))),
            RelNode::Values { schema, rows } => {
                let rows = rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|e| match e {
                                Expr::Literal { value } => Ok(value.clone()),
                                other => Err(ExecError::UnsupportedPlan(format!("Values({})", other))),
                            })
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Rows {
                    columns: column_names(schema),
                    rows,
                })
            }
            other => Err(ExecError::UnsupportedPlan(other.name().to_string())),
        }
    }
}

fn column_names(schema: &Schema) -> Vec<String> {
    schema.fields.iter().map(|f| f.name.clone()).collect()
}
