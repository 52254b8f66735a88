//! Indented text rendering of plans

use shardline_ir::{ConditionKind, RelNode};
use std::fmt::Write;

pub fn explain(plan: &RelNode) -> String {
    let mut out = String::new();
    write_node(plan, 0, &mut out);
    out
}

fn write_node(node: &RelNode, depth: usize, out: &mut String) {
    let _ = writeln!(out, "{}{}", "  ".repeat(depth), line(node));
    if let RelNode::View { fragment, .. } = node {
        write_node(fragment, depth + 1, out);
    }
    for input in node.inputs() {
        write_node(input, depth + 1, out);
    }
}

fn line(node: &RelNode) -> String {
    let join = |items: Vec<String>| items.join(", ");
    match node {
        RelNode::TableScan { table, alias, .. } => format!("TableScan(table={}, alias={})", table, alias),
        RelNode::Values { rows, .. } => format!("Values(rows={})", rows.len()),
        RelNode::Filter { predicate, .. } => format!("Filter(condition={})", predicate),
        RelNode::Project { exprs, .. } => format!(
            "Project({})",
            join(exprs.iter().map(|e| format!("{} AS {}", e.expr, e.alias)).collect())
        ),
        RelNode::Calc { exprs, condition, .. } => {
            let exprs = join(exprs.iter().map(|e| format!("{} AS {}", e.expr, e.alias)).collect());
            match condition {
                Some(c) => format!("Calc({}, condition={})", exprs, c),
                None => format!("Calc({})", exprs),
            }
        }
        RelNode::Join { kind, condition, .. } => format!("Join(type={:?}, condition={})", kind, condition),
        RelNode::MultiJoin { inputs, condition } => {
            format!("MultiJoin(inputs={}, condition={})", inputs.len(), condition)
        }
        RelNode::Aggregate { group_by, aggs, .. } => format!(
            "Aggregate(group=[{}], aggs=[{}])",
            join(group_by.iter().map(|g| g.to_string()).collect()),
            join(
                aggs.iter()
                    .map(|a| {
                        let args = join(a.args.iter().map(|x| x.to_string()).collect());
                        let args = if args.is_empty() { "*".to_string() } else { args };
                        format!("{}({}{}) AS {}", a.func.name(), if a.distinct { "DISTINCT " } else { "" }, args, a.alias)
                    })
                    .collect()
            )
        ),
        RelNode::Sort { keys, offset, fetch, .. } => {
            let mut s = format!(
                "Sort({})",
                join(
                    keys.iter()
                        .map(|k| format!("{}{}", k.expr, if k.descending { " DESC" } else { "" }))
                        .collect()
                )
            );
            if let Some(fetch) = fetch {
                let _ = write!(s, " fetch={}", fetch);
            }
            if let Some(offset) = offset {
                let _ = write!(s, " offset={}", offset);
            }
            s
        }
        RelNode::Union { inputs, all } => format!("Union(all={}, inputs={})", all, inputs.len()),
        RelNode::TableModify { table, op, .. } => format!("TableModify(table={}, op={:?})", table, op),
        RelNode::View { table, condition, single_node, index_probe, .. } => {
            let kind = match condition.kind {
                ConditionKind::Point => "Point",
                ConditionKind::Range => "Range",
                ConditionKind::Unknown => "Unknown",
            };
            let mut s = format!("View(table={}, condition={}, single_node={}", table, kind, single_node);
            if let Some(probe) = index_probe {
                let _ = write!(s, ", index={}", probe.index);
            }
            s.push(')');
            s
        }
        RelNode::RoutedScan { target, sql, params, .. } => format!(
            "RoutedScan(target={}, sql=\"{}\", params=[{}])",
            target,
            sql,
            join(params.iter().map(|p| p.to_string()).collect())
        ),
        RelNode::Gather { inputs } => format!("Gather(inputs={})", inputs.len()),
        RelNode::Spool { id, .. } => format!("Spool(id={})", id),
        RelNode::SpoolRef { id, .. } => format!("SpoolRef(id={})", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_ir::{DataType, Field, Schema, Value};

    #[test]
    fn test_gather_of_routed_scans() {
        let scan = |target: &str| {
            RelNode::RoutedScan {
                target: target.into(),
                sql: "SELECT o.id FROM db_0.orders AS o WHERE o.status = ?".into(),
                params: vec![Value::from("NEW")],
                schema: Schema::new(vec![Field::new("id", DataType::Int64)]),
            }
            .into_ref()
        };
        let plan = RelNode::Gather { inputs: vec![scan("N1"), scan("N2")] };

        let text = explain(&plan);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Gather(inputs=2)");
        assert_eq!(
            lines[1],
            "  RoutedScan(target=N1, sql=\"SELECT o.id FROM db_0.orders AS o WHERE o.status = ?\", params=['NEW'])"
        );
        assert_eq!(lines.len(), 3);
    }
}
