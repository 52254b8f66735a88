//! Row-count and access cost estimates

use crate::resolves_in;
use shardline_ir::{BinOp, Catalog, Expr, JoinKind, PlanRef, RelNode, Schema};

/// Fixed cost of one round trip to a data node, in row units.
pub const REMOTE_COST: f64 = 100.0;

const DEFAULT_ROWS: f64 = 1000.0;

pub struct CostModel<'a> {
    catalog: &'a dyn Catalog,
}

impl<'a> CostModel<'a> {
    pub fn new(catalog: &'a dyn Catalog) -> Self {
        Self { catalog }
    }

    /// Estimated output rows of a subtree.
    pub fn rows(&self, node: &RelNode) -> f64 {
        let rows = match node {
            RelNode::TableScan { table, .. } => self
                .catalog
                .get_table(&table.schema, &table.table)
                .map_or(DEFAULT_ROWS, |t| t.row_count),
            RelNode::Values { rows, .. } => rows.len() as f64,
            RelNode::Filter { input, predicate } => self.rows(input) * selectivity(predicate),
            RelNode::Calc { input, condition, .. } => {
                self.rows(input) * condition.as_ref().map_or(1.0, selectivity)
            }
            RelNode::Project { input, .. } | RelNode::Spool { input, .. } => self.rows(input),
            RelNode::Join { left, right, kind, condition } => {
                let (l, r) = (self.rows(left), self.rows(right));
                match kind {
                    JoinKind::Semi | JoinKind::Anti => l * 0.5,
                    _ if has_equi_conjunct(condition, &left.schema(), &right.schema()) => l.max(r),
                    _ => l * r * selectivity(condition),
                }
            }
            RelNode::MultiJoin { inputs, condition } => {
                let rows: Vec<f64> = inputs.iter().map(|i| self.rows(i)).collect();
                let order: Vec<usize> = (0..inputs.len()).collect();
                self.intermediate_rows(inputs, &rows, &order, &condition.split_conjunction())
                    .last()
                    .copied()
                    .unwrap_or(0.0)
            }
            RelNode::Aggregate { input, group_by, .. } => {
                if group_by.is_empty() {
                    1.0
                } else {
                    self.rows(input) * 0.1
                }
            }
            RelNode::Sort { input, fetch, .. } => {
                let rows = self.rows(input);
                fetch.map_or(rows, |f| rows.min(f as f64))
            }
            RelNode::Union { inputs, .. } | RelNode::Gather { inputs } => {
                inputs.iter().map(|i| self.rows(i)).sum()
            }
            RelNode::View { fragment, .. } => self.rows(fragment),
            RelNode::TableModify { .. } => 1.0,
            RelNode::RoutedScan { .. } | RelNode::SpoolRef { .. } => DEFAULT_ROWS,
        };
        rows.max(1.0)
    }

    /// Row estimate after each join of a left-deep ordering, first input included.
    pub(crate) fn intermediate_rows(
        &self,
        inputs: &[PlanRef],
        rows: &[f64],
        order: &[usize],
        conjuncts: &[Expr],
    ) -> Vec<f64> {
        let Some((&first, rest)) = order.split_first() else {
            return Vec::new();
        };
        let mut acc = rows[first];
        let mut schema = inputs[first].schema();
        let mut out = vec![acc];
        for &next in rest {
            let next_schema = inputs[next].schema();
            acc = if connects(conjuncts, &schema, &next_schema) {
                acc.max(rows[next])
            } else {
                acc * rows[next]
            };
            schema = schema.join(&next_schema);
            out.push(acc);
        }
        out
    }

    /// Cost of reading a view from `nodes` data nodes.
    pub fn view_cost(&self, nodes: usize, rows: f64) -> f64 {
        nodes as f64 * REMOTE_COST + rows
    }

    /// Cost of a global index lookup followed by a single-node read.
    pub fn index_probe_cost(&self) -> f64 {
        2.0 * REMOTE_COST + 1.0
    }
}

/// Some conjunct needs columns from both sides.
pub(crate) fn connects(conjuncts: &[Expr], left: &Schema, right: &Schema) -> bool {
    let joined = left.join(right);
    conjuncts.iter().any(|c| {
        !c.column_refs().is_empty()
            && resolves_in(c, &joined)
            && !resolves_in(c, left)
            && !resolves_in(c, right)
    })
}

fn has_equi_conjunct(condition: &Expr, left: &Schema, right: &Schema) -> bool {
    condition.split_conjunction().iter().any(|c| match c {
        Expr::BinaryOp { op: BinOp::Eq, left: a, right: b } => {
            (resolves_in(a, left) && resolves_in(b, right)) || (resolves_in(a, right) && resolves_in(b, left))
        }
        _ => false,
    })
}

pub(crate) fn selectivity(predicate: &Expr) -> f64 {
    predicate
        .split_conjunction()
        .iter()
        .map(|c| match c {
            Expr::BinaryOp { op: BinOp::Eq, .. } => 0.1,
            Expr::BinaryOp { op: BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, .. } | Expr::Between { .. } => 0.33,
            Expr::IsNull { .. } => 0.1,
            Expr::Literal { .. } if c.is_true_literal() => 1.0,
            _ => 0.5,
        })
        .product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_ir::{eq, lit, qcol, ColumnInfo, DataType, LogicalTable, MockCatalog, TableId};

    fn catalog() -> MockCatalog {
        let mut catalog = MockCatalog::new();
        for (name, rows) in [("orders", 100_000.0), ("customers", 1_000.0)] {
            catalog.add_table(
                LogicalTable::new("shop", name, vec![ColumnInfo::new("id", DataType::Int64)]).with_row_count(rows),
            );
        }
        catalog
    }

    fn scan(table: &str) -> PlanRef {
        let catalog = catalog();
        let schema = shardline_ir::Catalog::get_table(&catalog, "shop", table).unwrap().row_schema(table);
        RelNode::TableScan { table: TableId::new("shop", table), alias: table.into(), schema }.into_ref()
    }

    #[test]
    fn test_filter_and_join_estimates() {
        let catalog = catalog();
        let cost = CostModel::new(&catalog);

        let point = RelNode::Filter { input: scan("orders"), predicate: eq(qcol("orders", "id"), lit(1)) };
        assert!((cost.rows(&point) - 10_000.0).abs() < 1e-6);

        let join = RelNode::Join {
            left: scan("orders"),
            right: scan("customers"),
            kind: JoinKind::Inner,
            condition: eq(qcol("orders", "id"), qcol("customers", "id")),
        };
        assert_eq!(cost.rows(&join), 100_000.0);

        let cross = RelNode::Join {
            left: scan("orders"),
            right: scan("customers"),
            kind: JoinKind::Inner,
            condition: lit(true),
        };
        assert_eq!(cost.rows(&cross), 100_000_000.0);
    }

    #[test]
    fn test_probe_beats_broadcast() {
        let catalog = catalog();
        let cost = CostModel::new(&catalog);
        assert!(cost.index_probe_cost() < cost.view_cost(4, 1000.0));
        assert!(cost.index_probe_cost() > cost.view_cost(1, 1.0));
    }
}
