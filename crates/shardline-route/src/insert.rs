//! INSERT policy: column auto-fill, auto-increment placement and per-row routing

use crate::resolver::{DistributionResolver, ShardingInput};
use crate::rewriter::{SqlSet, StatementRewriter};
use crate::RouteError;
use shardline_ast::{insert_columns, Expr, Insert, Statement};
use shardline_ir::{DataNode, Distribution, LogicalTable, SequenceGenerator, ShardingValues, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoIncrement {
    pub column: String,
    /// Position in the rewritten column list.
    pub position: usize,
    /// Logical parameter index carrying each row's value, in row order.
    pub param_indexes: Vec<usize>,
}

/// Column layout of a rewritten INSERT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPlan {
    pub columns: Vec<String>,
    /// Set when the table's auto-increment column was not supplied.
    pub auto_increment: Option<AutoIncrement>,
    /// `(column, position)` for every sharding-key column.
    pub sharding_key_positions: Vec<(String, usize)>,
}

impl InsertPlan {
    pub fn new(table: &LogicalTable, statement: &Statement, insert: &Insert) -> Result<Self, RouteError> {
        let mut columns = insert_columns(table, insert)?;
        let auto_increment = match &table.auto_increment {
            Some(auto) if !columns.iter().any(|c| c.eq_ignore_ascii_case(auto)) => {
                // Appended after the highest placeholder so rendered positions never shift
                let base = statement.max_placeholder().map_or(0, |m| m + 1);
                columns.push(auto.clone());
                Some(AutoIncrement {
                    column: auto.clone(),
                    position: columns.len() - 1,
                    param_indexes: (0..insert.rows.len()).map(|r| base + r).collect(),
                })
            }
            _ => None,
        };
        let sharding_key_positions = table
            .sharding_columns()
            .iter()
            .map(|key| {
                columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(key))
                    .map(|p| (key.clone(), p))
                    .ok_or_else(|| RouteError::MissingShardingKey {
                        table: table.id().to_string(),
                        column: key.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            columns,
            auto_increment,
            sharding_key_positions,
        })
    }
}

/// Routed INSERT
#[derive(Debug, Clone)]
pub struct InsertRouting {
    pub plan: InsertPlan,
    pub statements: SqlSet,
    /// Values drawn from the sequence, in row order.
    pub generated_ids: Vec<i64>,
}

pub struct InsertRewriter<'a> {
    rewriter: StatementRewriter<'a>,
    sequence: Option<&'a dyn SequenceGenerator>,
}

impl<'a> InsertRewriter<'a> {
    pub fn new(default_schema: &'a str, sequence: Option<&'a dyn SequenceGenerator>) -> Self {
        Self {
            rewriter: StatementRewriter::new(default_schema),
            sequence,
        }
    }

    pub fn route(&self, statement: &Statement, table: &LogicalTable, params: &[Value]) -> Result<InsertRouting, RouteError> {
        let Statement::Insert(insert) = statement else {
            return Err(RouteError::NotAnInsert);
        };
        let plan = InsertPlan::new(table, statement, insert)?;
        let explicit_columns = plan.columns.len() - usize::from(plan.auto_increment.is_some());

        let mut logical = params.to_vec();
        let mut generated_ids = Vec::new();
        if let Some(auto) = &plan.auto_increment {
            let needed = auto.param_indexes.iter().max().map_or(0, |m| m + 1);
            if logical.len() < needed {
                logical.resize(needed, Value::Null);
            }
            for &index in &auto.param_indexes {
                logical[index] = self.next_id(table, &mut generated_ids);
            }
        } else if let Some(auto) = &table.auto_increment {
            // Explicit NULL placeholders for the auto-increment column are filled too
            if let Some(position) = plan.columns.iter().position(|c| c.eq_ignore_ascii_case(auto)) {
                for row in &insert.rows {
                    if let Some(Expr::Placeholder(i)) = row.get(position) {
                        if logical.get(*i).is_some_and(Value::is_null) {
                            logical[*i] = self.next_id(table, &mut generated_ids);
                        }
                    }
                }
            }
        }

        let mut rows_per_node: BTreeMap<DataNode, Vec<usize>> = BTreeMap::new();
        for (r, row) in insert.rows.iter().enumerate() {
            for node in self.row_nodes(table, &plan, row, r, &logical)? {
                rows_per_node.entry(node).or_default().push(r);
            }
        }

        let logical: Arc<[Value]> = logical.into();
        let mut statements = SqlSet::new();
        for (node, rows) in rows_per_node {
            let mut substitution = self
                .rewriter
                .substitution()
                .table(&table.id(), &node)
                .columns(plan.columns[..explicit_columns].to_vec())
                .keep_rows(rows);
            if let Some(auto) = &plan.auto_increment {
                substitution = substitution.append_column(
                    auto.column.clone(),
                    auto.param_indexes.iter().map(|&i| Expr::Placeholder(i)).collect(),
                );
            }
            statements.insert(self.rewriter.compile_one(statement, &node, &substitution, &logical)?);
        }
        Ok(InsertRouting {
            plan,
            statements,
            generated_ids,
        })
    }

    fn next_id(&self, table: &LogicalTable, generated: &mut Vec<i64>) -> Value {
        match self.sequence {
            Some(sequence) => {
                let id = sequence.next_value(&table.id());
                generated.push(id);
                Value::Int(id)
            }
            // Left to the backend's own auto-increment
            None => Value::Null,
        }
    }

    fn row_nodes(
        &self,
        table: &LogicalTable,
        plan: &InsertPlan,
        row: &[Expr],
        row_index: usize,
        logical: &[Value],
    ) -> Result<Vec<DataNode>, RouteError> {
        if !matches!(table.distribution, Distribution::Sharding(_)) {
            let empty = ShardingValues::default();
            return Ok(DistributionResolver::resolve(table, ShardingInput::Values(&empty))?.nodes);
        }
        let mut values = Vec::with_capacity(plan.sharding_key_positions.len());
        for (column, position) in &plan.sharding_key_positions {
            let value = match (&plan.auto_increment, row.get(*position)) {
                (Some(auto), _) if auto.position == *position => logical.get(auto.param_indexes[row_index]).cloned(),
                (_, Some(Expr::Literal(v))) => Some(v.clone()),
                (_, Some(Expr::Placeholder(i))) => logical.get(*i).cloned(),
                _ => None,
            };
            // Unknown or NULL keys leave the column unconstrained
            if let Some(value) = value.filter(|v| !v.is_null()) {
                values.push((column.as_str(), value));
            }
        }
        let values = ShardingValues::from_row(values);
        let nodes = DistributionResolver::resolve(table, ShardingInput::Values(&values))?.nodes;
        // A sharded row is stored exactly once
        if nodes.len() != 1 {
            return Err(RouteError::UnplacedRow {
                table: table.id().to_string(),
                row: row_index,
            });
        }
        Ok(nodes)
    }
}
