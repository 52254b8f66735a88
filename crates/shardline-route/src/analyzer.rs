//! Predicate analysis for shard pruning

use shardline_ir::{
    BinOp, Bound, ColumnRef, Expr, IndexCondition, KeyConstraint, LogicalTable, Operand, UnOp, Value,
};

/// Extracts an [`IndexCondition`] from a predicate over one table.
pub struct PredicateAnalyzer<'a> {
    table: &'a LogicalTable,
    /// Qualifier the table is visible under, if the predicate sees several relations.
    qualifier: Option<&'a str>,
    columns: Vec<String>,
}

impl<'a> PredicateAnalyzer<'a> {
    pub fn new(table: &'a LogicalTable) -> Self {
        Self {
            table,
            qualifier: None,
            columns: table.analyzable_columns(),
        }
    }

    pub fn with_qualifier(mut self, qualifier: &'a str) -> Self {
        self.qualifier = Some(qualifier);
        self
    }

    /// Analyze a WHERE clause; `None` means no predicate at all.
    pub fn analyze(&self, predicate: Option<&Expr>) -> IndexCondition {
        let condition = match predicate {
            Some(predicate) => self.condition_of(predicate),
            None => IndexCondition::unknown(),
        };
        let condition = condition.classify(self.table.sharding_columns());
        if condition.is_unknown() {
            tracing::debug!(
                table = %self.table.id(),
                "shard condition unknown, statement will broadcast"
            );
        }
        condition
    }

    fn condition_of(&self, expr: &Expr) -> IndexCondition {
        match expr {
            Expr::BinaryOp { op: BinOp::And, left, right } => {
                let mut merged = self.condition_of(left);
                for (column, constraint) in self.condition_of(right).constraints {
                    merged.and_constraint(&column, constraint);
                }
                merged
            }
            Expr::BinaryOp { op: BinOp::Or, left, right } => {
                self.condition_of(left).or(self.condition_of(right))
            }
            Expr::BinaryOp { op, left, right } if op.is_comparison() => {
                let (column, operand, op) = match (self.column_of(left), self.column_of(right)) {
                    (Some(c), None) => match operand_of(right) {
                        Some(v) => (c, v, *op),
                        None => return IndexCondition::unknown(),
                    },
                    (None, Some(c)) => match operand_of(left) {
                        Some(v) => (c, v, op.swap()),
                        None => return IndexCondition::unknown(),
                    },
                    _ => return IndexCondition::unknown(),
                };
                let constraint = match op {
                    BinOp::Eq => KeyConstraint::point(operand),
                    BinOp::Lt | BinOp::Le => KeyConstraint::Range {
                        lower: None,
                        upper: Some(Bound { value: operand, inclusive: op == BinOp::Le }),
                    },
                    BinOp::Gt | BinOp::Ge => KeyConstraint::Range {
                        lower: Some(Bound { value: operand, inclusive: op == BinOp::Ge }),
                        upper: None,
                    },
                    _ => return IndexCondition::unknown(),
                };
                single(&column, constraint)
            }
            Expr::InList { expr, list, negated: false } => {
                let Some(column) = self.column_of(expr) else {
                    return IndexCondition::unknown();
                };
                match list.iter().map(operand_of).collect::<Option<Vec<_>>>() {
                    Some(values) if !values.is_empty() => single(&column, KeyConstraint::Points { values }),
                    _ => IndexCondition::unknown(),
                }
            }
            Expr::Between { expr, low, high, negated: false } => {
                match (self.column_of(expr), operand_of(low), operand_of(high)) {
                    (Some(column), Some(low), Some(high)) => single(
                        &column,
                        KeyConstraint::Range {
                            lower: Some(Bound { value: low, inclusive: true }),
                            upper: Some(Bound { value: high, inclusive: true }),
                        },
                    ),
                    _ => IndexCondition::unknown(),
                }
            }
            // Function calls, subqueries, negations and correlations constrain nothing.
            _ => IndexCondition::unknown(),
        }
    }

    /// Analyzable column of this table referenced directly by `expr`.
    fn column_of(&self, expr: &Expr) -> Option<String> {
        let Expr::Column { col } = expr else {
            return None;
        };
        if !self.visible(col) {
            return None;
        }
        self.columns
            .iter()
            .find(|c| c.eq_ignore_ascii_case(&col.column))
            .cloned()
    }

    fn visible(&self, col: &ColumnRef) -> bool {
        match (&col.table, self.qualifier) {
            (None, _) => true,
            (Some(t), Some(q)) => t.eq_ignore_ascii_case(q),
            (Some(t), None) => t.eq_ignore_ascii_case(&self.table.table_name),
        }
    }
}

fn single(column: &str, constraint: KeyConstraint) -> IndexCondition {
    let mut condition = IndexCondition::unknown();
    condition.and_constraint(column, constraint);
    condition
}

/// Constant side of a comparison. NULL never matches `=`, so it is not a key.
fn operand_of(expr: &Expr) -> Option<Operand> {
    match expr {
        Expr::Literal { value: Value::Null } => None,
        Expr::Literal { value } => Some(Operand::Literal(value.clone())),
        Expr::Param { index } => Some(Operand::Param(*index)),
        Expr::UnaryOp { op: UnOp::Neg, expr } => match expr.as_ref() {
            Expr::Literal { value: Value::Int(i) } => Some(Operand::Literal(Value::Int(-i))),
            Expr::Literal { value: Value::Float(f) } => Some(Operand::Literal(Value::Float(-f))),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_ir::{col, eq, lit, param, qcol, ColumnInfo, ConditionKind, DataType, Distribution};
    use shardline_registry::{RangeSpec, RangeSharding, ShardingRuleSpec};
    use std::sync::Arc;

    fn orders() -> LogicalTable {
        let spec = ShardingRuleSpec {
            function: "range".into(),
            columns: vec!["customer_id".into()],
            nodes: vec![
                shardline_ir::DataNode::new("n1", "db_0", "orders"),
                shardline_ir::DataNode::new("n2", "db_1", "orders"),
            ],
            ranges: vec![
                RangeSpec { start: 0, end: 99, node: 0 },
                RangeSpec { start: 100, end: 199, node: 1 },
            ],
        };
        LogicalTable::new(
            "shop",
            "orders",
            vec![
                ColumnInfo::new("id", DataType::Int64),
                ColumnInfo::new("customer_id", DataType::Int64),
            ],
        )
        .with_primary_key(&["id"])
        .with_distribution(Distribution::Sharding(Arc::new(RangeSharding::from_spec(&spec).unwrap())))
    }

    #[test]
    fn test_equality_on_key_is_point() {
        let table = orders();
        let cond = PredicateAnalyzer::new(&table).analyze(Some(&eq(col("customer_id"), lit(150))));
        assert_eq!(cond.kind, ConditionKind::Point);
    }

    #[test]
    fn test_reversed_comparison_is_range() {
        let table = orders();
        let predicate = Expr::BinaryOp {
            op: BinOp::Lt,
            left: Box::new(param(0)),
            right: Box::new(col("customer_id")),
        };
        let cond = PredicateAnalyzer::new(&table).analyze(Some(&predicate));
        assert_eq!(cond.kind, ConditionKind::Range);
        assert_eq!(
            cond.constraint("customer_id"),
            Some(&KeyConstraint::Range {
                lower: Some(Bound { value: Operand::Param(0), inclusive: false }),
                upper: None,
            })
        );
    }

    #[test]
    fn test_function_wrapped_column_is_unknown() {
        let table = orders();
        let predicate = eq(
            Expr::FuncCall { func: "abs".into(), args: vec![col("customer_id")] },
            lit(5),
        );
        assert!(PredicateAnalyzer::new(&table).analyze(Some(&predicate)).is_unknown());
    }

    #[test]
    fn test_or_with_unanalyzable_branch_is_unknown() {
        let table = orders();
        let predicate = Expr::BinaryOp {
            op: BinOp::Or,
            left: Box::new(eq(col("customer_id"), lit(1))),
            right: Box::new(eq(col("id"), lit(2))),
        };
        assert!(PredicateAnalyzer::new(&table).analyze(Some(&predicate)).is_unknown());
    }

    #[test]
    fn test_qualifier_filters_other_relations() {
        let table = orders();
        let predicate = eq(qcol("c", "customer_id"), lit(1));
        let analyzer = PredicateAnalyzer::new(&table).with_qualifier("o");
        assert!(analyzer.analyze(Some(&predicate)).is_unknown());

        let predicate = eq(qcol("o", "customer_id"), lit(1));
        assert_eq!(analyzer.analyze(Some(&predicate)).kind, ConditionKind::Point);
    }

    #[test]
    fn test_in_list_and_primary_key() {
        let table = orders();
        let predicate = Expr::BinaryOp {
            op: BinOp::And,
            left: Box::new(Expr::InList {
                expr: Box::new(col("customer_id")),
                list: vec![lit(1), param(0)],
                negated: false,
            }),
            right: Box::new(eq(col("id"), lit(9))),
        };
        let cond = PredicateAnalyzer::new(&table).analyze(Some(&predicate));
        assert_eq!(cond.kind, ConditionKind::Point);
        assert!(cond.covers_columns(&["id".to_string()]));
    }
}
