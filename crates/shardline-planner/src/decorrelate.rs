//! Subquery decorrelation
//!
//! `EXISTS`, `NOT EXISTS` and `IN (subquery)` conjuncts of a filter become
//! semi/anti joins whose condition is the subquery's correlation predicate.

use crate::resolves_in;
use crate::rules::RewriteRule;
use crate::trace::{CompileTrace, Phase};
use shardline_ir::{conjunction, eq, transform_up, Expr, JoinKind, NamedExpr, PlanRef, RelNode, Schema, UnOp};

pub struct SubQueryToCorrelate;

impl RewriteRule for SubQueryToCorrelate {
    fn name(&self) -> &'static str {
        "SubQueryToCorrelate"
    }

    fn apply(&self, node: &PlanRef) -> Option<PlanRef> {
        let RelNode::Filter { input, predicate } = node.as_ref() else {
            return None;
        };
        if !predicate.contains_subquery() {
            return None;
        }
        let outer = input.schema();
        let mut plan = input.clone();
        let mut keep = Vec::new();
        let mut converted = false;
        for conjunct in predicate.split_conjunction() {
            match semi_join(&conjunct, &outer) {
                Some((right, kind, condition)) => {
                    plan = RelNode::Join { left: plan, right, kind, condition }.into_ref();
                    converted = true;
                }
                None => keep.push(conjunct),
            }
        }
        if !converted {
            return None;
        }
        Some(match conjunction(keep) {
            Some(predicate) => RelNode::Filter { input: plan, predicate }.into_ref(),
            None => plan,
        })
    }
}

fn semi_join(conjunct: &Expr, outer: &Schema) -> Option<(PlanRef, JoinKind, Expr)> {
    let (subquery, kind, probe) = match conjunct {
        Expr::Exists { subquery, negated } => (subquery, anti_if(*negated), None),
        Expr::UnaryOp { op: UnOp::Not, expr } => match expr.as_ref() {
            Expr::Exists { subquery, negated: false } => (subquery, JoinKind::Anti, None),
            _ => return None,
        },
        // NOT IN has null semantics a plain anti join does not honor.
        Expr::InSubquery { expr, subquery, negated: false } => (subquery, JoinKind::Semi, Some(expr.as_ref())),
        _ => return None,
    };
    let (right, mut conjuncts, output) = pull_correlation(subquery)?;
    if let Some(probe) = probe {
        conjuncts.push(eq(probe.clone(), output));
    }
    let right_schema = right.schema();
    if shares_qualifier(outer, &right_schema) {
        return None;
    }
    let condition = conjunction(conjuncts).unwrap_or_else(|| shardline_ir::lit(true));
    if !resolves_in(&condition, &outer.join(&right_schema)) {
        return None;
    }
    Some((right, kind, condition))
}

fn anti_if(negated: bool) -> JoinKind {
    if negated {
        JoinKind::Anti
    } else {
        JoinKind::Semi
    }
}

fn shares_qualifier(outer: &Schema, inner: &Schema) -> bool {
    inner.fields.iter().filter_map(|f| f.qualifier.as_deref()).any(|q| {
        outer
            .fields
            .iter()
            .any(|o| o.qualifier.as_deref().is_some_and(|oq| oq.eq_ignore_ascii_case(q)))
    })
}

/// Split a subquery into its uncorrelated body, the correlation conjuncts
/// (rewritten to plain columns) and its output expression.
fn pull_correlation(subquery: &PlanRef) -> Option<(PlanRef, Vec<Expr>, Expr)> {
    let mut node = subquery.clone();
    if let RelNode::Sort { input, offset: None, fetch: None, .. } = node.as_ref() {
        node = input.clone();
    }
    let mut output = None;
    if let RelNode::Project { input, exprs } = node.as_ref() {
        let plain = exprs.iter().all(|e| !e.expr.contains_outer_ref() && !e.expr.contains_subquery());
        if plain {
            output = exprs.first().map(|e| e.expr.clone());
            node = input.clone();
        }
    }

    let mut correlated = Vec::new();
    let mut local = Vec::new();
    while let RelNode::Filter { input, predicate } = node.as_ref() {
        for conjunct in predicate.split_conjunction() {
            if conjunct.contains_outer_ref() {
                correlated.push(to_inner_columns(&conjunct));
            } else {
                local.push(conjunct);
            }
        }
        node = input.clone();
    }
    if node.any(&|n| n.expressions().iter().any(|e| e.contains_outer_ref())) {
        return None;
    }
    let output = match output {
        Some(expr) => expr,
        None => NamedExpr::field(node.schema().fields.first()?).expr,
    };
    let body = match conjunction(local) {
        Some(predicate) => RelNode::Filter { input: node, predicate }.into_ref(),
        None => node,
    };
    Some((body, correlated, output))
}

fn to_inner_columns(expr: &Expr) -> Expr {
    expr.transform(&mut |e| match e {
        Expr::OuterColumn { col } => Some(Expr::Column { col: col.clone() }),
        _ => None,
    })
}

/// Convert every decorrelatable subquery in the plan.
pub fn decorrelate(plan: &PlanRef, trace: &mut CompileTrace) -> PlanRef {
    let rule = SubQueryToCorrelate;
    transform_up(plan, &mut |node| {
        let rewritten = rule.apply(node)?;
        trace.record(Phase::Decorrelate, rule.name(), node.name());
        Some(rewritten)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_ir::{qcol, ColumnRef, DataType, Field, TableId};

    fn scan(table: &str, alias: &str) -> PlanRef {
        RelNode::TableScan {
            table: TableId::new("shop", table),
            alias: alias.to_string(),
            schema: Schema::new(vec![
                Field::new("id", DataType::Int64).with_qualifier(alias),
                Field::new("customer_id", DataType::Int64).with_qualifier(alias),
            ]),
        }
        .into_ref()
    }

    fn outer(table: &str, column: &str) -> Expr {
        Expr::OuterColumn { col: ColumnRef::qualified(table, column) }
    }

    #[test]
    fn test_exists_becomes_semi_join() {
        let subquery = RelNode::Project {
            input: RelNode::Filter {
                input: scan("orders", "o"),
                predicate: eq(qcol("o", "customer_id"), outer("c", "id")),
            }
            .into_ref(),
            exprs: vec![NamedExpr::new(shardline_ir::lit(1), "1")],
        }
        .into_ref();
        let plan = RelNode::Filter {
            input: scan("customers", "c"),
            predicate: Expr::Exists { subquery, negated: false },
        }
        .into_ref();

        let mut trace = CompileTrace::new();
        let out = decorrelate(&plan, &mut trace);

        let RelNode::Join { left, right, kind, condition } = out.as_ref() else {
            panic!("expected join, got {}", out.name());
        };
        assert_eq!(*kind, JoinKind::Semi);
        assert_eq!(condition.to_string(), "(o.customer_id = c.id)");
        assert_eq!(left.name(), "TableScan");
        assert_eq!(right.name(), "TableScan");
        assert_eq!(out.schema().len(), 2);
        assert_eq!(trace.rules(Phase::Decorrelate), vec!["SubQueryToCorrelate"]);
    }

    #[test]
    fn test_not_exists_and_in_subquery() {
        let correlated = RelNode::Filter {
            input: scan("orders", "o"),
            predicate: shardline_ir::and(
                eq(qcol("o", "customer_id"), outer("c", "id")),
                eq(qcol("o", "id"), shardline_ir::lit(9)),
            ),
        }
        .into_ref();
        let ids = RelNode::Project {
            input: scan("orders", "x"),
            exprs: vec![NamedExpr::new(qcol("x", "customer_id"), "customer_id")],
        }
        .into_ref();
        let predicate = shardline_ir::and(
            Expr::UnaryOp {
                op: UnOp::Not,
                expr: Box::new(Expr::Exists { subquery: correlated, negated: false }),
            },
            Expr::InSubquery { expr: Box::new(qcol("c", "id")), subquery: ids, negated: false },
        );
        let plan = RelNode::Filter { input: scan("customers", "c"), predicate }.into_ref();

        let out = decorrelate(&plan, &mut CompileTrace::new());

        let RelNode::Join { left, kind, condition, .. } = out.as_ref() else { panic!("expected join") };
        assert_eq!(*kind, JoinKind::Semi);
        assert_eq!(condition.to_string(), "(c.id = x.customer_id)");
        let RelNode::Join { right, kind, condition, .. } = left.as_ref() else { panic!("expected anti join") };
        assert_eq!(*kind, JoinKind::Anti);
        assert_eq!(condition.to_string(), "(o.customer_id = c.id)");
        // Uncorrelated conjuncts stay inside the subquery side
        assert!(matches!(right.as_ref(), RelNode::Filter { predicate, .. } if predicate.to_string() == "(o.id = 9)"));
    }

    #[test]
    fn test_not_in_left_alone() {
        let ids = RelNode::Project {
            input: scan("orders", "x"),
            exprs: vec![NamedExpr::new(qcol("x", "customer_id"), "customer_id")],
        }
        .into_ref();
        let plan = RelNode::Filter {
            input: scan("customers", "c"),
            predicate: Expr::InSubquery { expr: Box::new(qcol("c", "id")), subquery: ids, negated: true },
        }
        .into_ref();
        let mut trace = CompileTrace::new();
        let out = decorrelate(&plan, &mut trace);
        assert!(std::sync::Arc::ptr_eq(&out, &plan));
        assert!(trace.is_empty());
    }
}
