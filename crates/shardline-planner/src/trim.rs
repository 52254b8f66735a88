//! Drop scan columns no operator above ever reads.

use shardline_ir::{transform_up, ColumnRef, Expr, NamedExpr, PlanRef, RelNode};
use std::sync::Arc;

pub fn trim_fields(plan: &PlanRef) -> PlanRef {
    let mut used: Vec<ColumnRef> = plan
        .schema()
        .fields
        .iter()
        .map(|f| match &f.qualifier {
            Some(q) => ColumnRef::qualified(q.clone(), f.name.clone()),
            None => ColumnRef::new(f.name.clone()),
        })
        .collect();
    collect_plan(plan, &mut used);

    transform_up(plan, &mut |node| {
        let RelNode::TableScan { schema, .. } = node.as_ref() else {
            return None;
        };
        let kept: Vec<NamedExpr> = schema
            .fields
            .iter()
            .filter(|f| used.iter().any(|c| f.matches(c.table.as_deref(), &c.column)))
            .map(NamedExpr::field)
            .collect();
        if kept.len() == schema.len() {
            return None;
        }
        // A scan still has to produce rows, so keep at least one column.
        let exprs = match kept.is_empty() {
            true => schema.fields.first().map(NamedExpr::field).into_iter().collect(),
            false => kept,
        };
        Some(RelNode::Project { input: Arc::clone(node), exprs }.into_ref())
    })
}

fn collect_plan(node: &RelNode, used: &mut Vec<ColumnRef>) {
    for expr in node.expressions() {
        collect_expr(expr, used);
    }
    if let RelNode::View { fragment, .. } = node {
        collect_plan(fragment, used);
    }
    for input in node.inputs() {
        collect_plan(input, used);
    }
}

fn collect_expr(expr: &Expr, used: &mut Vec<ColumnRef>) {
    match expr {
        Expr::Column { col } | Expr::OuterColumn { col } => {
            if !used.contains(col) {
                used.push(col.clone());
            }
        }
        Expr::Exists { subquery, .. } | Expr::InSubquery { subquery, .. } | Expr::ScalarSubquery { subquery } => {
            collect_plan(subquery, used)
        }
        _ => {}
    }
    for child in expr.children() {
        collect_expr(child, used);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_ir::{eq, lit, qcol, DataType, Field, Schema, TableId};

    fn scan() -> PlanRef {
        let fields = ["id", "customer_id", "status", "note"]
            .iter()
            .map(|name| Field::new(*name, DataType::Text).with_qualifier("o"))
            .collect();
        RelNode::TableScan {
            table: TableId::new("shop", "orders"),
            alias: "o".into(),
            schema: Schema::new(fields),
        }
        .into_ref()
    }

    #[test]
    fn test_unused_columns_dropped() {
        let plan = RelNode::Project {
            input: RelNode::Filter {
                input: scan(),
                predicate: eq(qcol("o", "status"), lit("NEW")),
            }
            .into_ref(),
            exprs: vec![NamedExpr::new(qcol("o", "id"), "id")],
        }
        .into_ref();

        let trimmed = trim_fields(&plan);
        let names: Vec<String> = trimmed.inputs()[0].inputs()[0]
            .schema()
            .fields
            .iter()
            .map(|f| f.name.clone())
            .collect();
        assert_eq!(names, vec!["id", "status"]);
        assert_eq!(trimmed.schema(), plan.schema());
    }

    #[test]
    fn test_fully_used_scan_untouched() {
        let plan = scan();
        assert!(Arc::ptr_eq(&trim_fields(&plan), &plan));
    }
}
