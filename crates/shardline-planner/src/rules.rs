//! Rule-based rewrites
//!
//! Each rule looks at a single node and either returns its replacement or
//! `None`. [`RuleProgram`] drives the rules top-down to a fixed point, capped
//! by a total number of applications.

use crate::decorrelate::SubQueryToCorrelate;
use crate::resolves_in;
use crate::trace::{CompileTrace, Phase};
use shardline_ir::{
    conjunction, transform_down, BinOp, Expr, JoinKind, NamedExpr, PlanRef, RelNode, Schema, UnOp, Value,
};
use std::cmp::Ordering;

/// Hard cap on rule applications per program run.
pub const DEFAULT_MATCH_LIMIT: usize = 512;

pub trait RewriteRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replacement for `node`, or `None` when the rule does not match.
    fn apply(&self, node: &PlanRef) -> Option<PlanRef>;
}

pub struct RuleProgram {
    rules: Vec<Box<dyn RewriteRule>>,
    match_limit: usize,
}

impl RuleProgram {
    pub fn new(match_limit: usize) -> Self {
        Self {
            rules: Vec::new(),
            match_limit,
        }
    }

    pub fn with_rule(mut self, rule: impl RewriteRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Pushdown and simplification rules, in priority order.
    pub fn rbo(match_limit: usize) -> Self {
        Self::new(match_limit)
            .with_rule(ReduceExpressions)
            .with_rule(FilterMerge)
            .with_rule(SubQueryToCorrelate)
            .with_rule(FilterProjectTranspose)
            .with_rule(FilterIntoJoin)
            .with_rule(JoinConditionPush)
            .with_rule(FilterAggregateTranspose)
            .with_rule(FilterSetOpTranspose)
    }

    pub fn match_limit(&self) -> usize {
        self.match_limit
    }

    /// Apply rules until nothing matches or the cap is reached. Hitting the
    /// cap is not an error: the plan rewritten so far is returned.
    pub fn run(&self, plan: &PlanRef, phase: Phase, trace: &mut CompileTrace) -> PlanRef {
        let mut applied = 0usize;
        let mut current = plan.clone();
        loop {
            let mut changed = false;
            let mut capped = false;
            current = transform_down(&current, &mut |node| {
                if capped {
                    return None;
                }
                for rule in &self.rules {
                    if let Some(next) = rule.apply(node) {
                        if applied >= self.match_limit {
                            capped = true;
                            return None;
                        }
                        applied += 1;
                        changed = true;
                        trace.record(phase, rule.name(), node.name());
                        return Some(next);
                    }
                }
                None
            });
            if capped {
                tracing::debug!(limit = self.match_limit, "rule application limit reached");
                trace.record(phase, "MatchLimit", format!("stopped after {} applications", applied));
                break;
            }
            if !changed {
                break;
            }
        }
        current
    }
}

fn filter(input: PlanRef, predicates: Vec<Expr>) -> PlanRef {
    match conjunction(predicates) {
        Some(predicate) => RelNode::Filter { input, predicate }.into_ref(),
        None => input,
    }
}

fn has_columns(expr: &Expr) -> bool {
    !expr.column_refs().is_empty()
}

/// `Filter(Filter(x, a), b)` to `Filter(x, a AND b)`.
pub struct FilterMerge;

impl RewriteRule for FilterMerge {
    fn name(&self) -> &'static str {
        "FilterMerge"
    }

    fn apply(&self, node: &PlanRef) -> Option<PlanRef> {
        let RelNode::Filter { input, predicate } = node.as_ref() else {
            return None;
        };
        let RelNode::Filter { input: inner, predicate: inner_predicate } = input.as_ref() else {
            return None;
        };
        Some(filter(inner.clone(), vec![inner_predicate.clone(), predicate.clone()]))
    }
}

/// Constant folding in filter and join predicates.
pub struct ReduceExpressions;

impl RewriteRule for ReduceExpressions {
    fn name(&self) -> &'static str {
        "ReduceExpressions"
    }

    fn apply(&self, node: &PlanRef) -> Option<PlanRef> {
        match node.as_ref() {
            RelNode::Filter { input, predicate } => {
                let reduced = reduce(predicate);
                if reduced.is_true_literal() {
                    Some(input.clone())
                } else if reduced.is_false_literal() {
                    Some(
                        RelNode::Values {
                            schema: input.schema(),
                            rows: vec![],
                        }
                        .into_ref(),
                    )
                } else if &reduced != predicate {
                    Some(RelNode::Filter { input: input.clone(), predicate: reduced }.into_ref())
                } else {
                    None
                }
            }
            RelNode::Join { left, right, kind, condition } => {
                let reduced = reduce(condition);
                (&reduced != condition).then(|| {
                    RelNode::Join {
                        left: left.clone(),
                        right: right.clone(),
                        kind: *kind,
                        condition: reduced,
                    }
                    .into_ref()
                })
            }
            _ => None,
        }
    }
}

/// Fold literal sub-expressions.
pub fn reduce(expr: &Expr) -> Expr {
    expr.transform(&mut |e| match e {
        Expr::BinaryOp { op: BinOp::And, left, right } => {
            if left.is_true_literal() {
                Some(right.as_ref().clone())
            } else if right.is_true_literal() {
                Some(left.as_ref().clone())
            } else if left.is_false_literal() || right.is_false_literal() {
                Some(shardline_ir::lit(false))
            } else {
                None
            }
        }
        Expr::BinaryOp { op: BinOp::Or, left, right } => {
            if left.is_true_literal() || right.is_true_literal() {
                Some(shardline_ir::lit(true))
            } else if left.is_false_literal() {
                Some(right.as_ref().clone())
            } else if right.is_false_literal() {
                Some(left.as_ref().clone())
            } else {
                None
            }
        }
        Expr::BinaryOp { op, left, right } => {
            let (Expr::Literal { value: l }, Expr::Literal { value: r }) = (left.as_ref(), right.as_ref()) else {
                return None;
            };
            fold_binary(*op, l, r).map(|value| Expr::Literal { value })
        }
        Expr::UnaryOp { op: UnOp::Not, expr } => match expr.as_ref() {
            Expr::Literal { value: Value::Bool(b) } => Some(shardline_ir::lit(!b)),
            _ => None,
        },
        Expr::UnaryOp { op: UnOp::Neg, expr } => match expr.as_ref() {
            Expr::Literal { value: Value::Int(i) } => i.checked_neg().map(shardline_ir::lit),
            Expr::Literal { value: Value::Float(f) } => Some(shardline_ir::lit(-f)),
            _ => None,
        },
        _ => None,
    })
}

fn fold_binary(op: BinOp, l: &Value, r: &Value) -> Option<Value> {
    if l.is_null() || r.is_null() {
        return None;
    }
    if op.is_comparison() {
        let ordering = l.compare(r)?;
        let result = match op {
            BinOp::Eq => ordering == Ordering::Equal,
            BinOp::Ne => ordering != Ordering::Equal,
            BinOp::Lt => ordering == Ordering::Less,
            BinOp::Le => ordering != Ordering::Greater,
            BinOp::Gt => ordering == Ordering::Greater,
            BinOp::Ge => ordering != Ordering::Less,
            _ => return None,
        };
        return Some(Value::Bool(result));
    }
    let (Value::Int(a), Value::Int(b)) = (l, r) else {
        return None;
    };
    match op {
        BinOp::Add => a.checked_add(*b).map(Value::Int),
        BinOp::Sub => a.checked_sub(*b).map(Value::Int),
        BinOp::Mul => a.checked_mul(*b).map(Value::Int),
        _ => None,
    }
}

/// Filter below a projection, with projected aliases inlined.
pub struct FilterProjectTranspose;

impl RewriteRule for FilterProjectTranspose {
    fn name(&self) -> &'static str {
        "FilterProjectTranspose"
    }

    fn apply(&self, node: &PlanRef) -> Option<PlanRef> {
        let RelNode::Filter { input, predicate } = node.as_ref() else {
            return None;
        };
        let RelNode::Project { input: below, exprs } = input.as_ref() else {
            return None;
        };
        if predicate.contains_subquery() {
            return None;
        }
        let pushed = inline_through(predicate, &input.schema(), exprs)?;
        Some(
            RelNode::Project {
                input: RelNode::Filter { input: below.clone(), predicate: pushed }.into_ref(),
                exprs: exprs.clone(),
            }
            .into_ref(),
        )
    }
}

/// Rewrite `expr`, written over a projection's output, in terms of its input.
pub(crate) fn inline_through(expr: &Expr, output: &Schema, exprs: &[NamedExpr]) -> Option<Expr> {
    let mut ok = true;
    let inlined = expr.map_columns(&mut |c| match output.resolve(c.table.as_deref(), &c.column) {
        Ok(i) if !exprs[i].expr.contains_subquery() => Some(exprs[i].expr.clone()),
        _ => {
            ok = false;
            None
        }
    });
    ok.then_some(inlined)
}

/// Distribute filter conjuncts over a join's inputs and condition.
pub struct FilterIntoJoin;

impl RewriteRule for FilterIntoJoin {
    fn name(&self) -> &'static str {
        "FilterIntoJoin"
    }

    fn apply(&self, node: &PlanRef) -> Option<PlanRef> {
        let RelNode::Filter { input, predicate } = node.as_ref() else {
            return None;
        };
        let RelNode::Join { left, right, kind, condition } = input.as_ref() else {
            return None;
        };
        let (left_schema, right_schema) = (left.schema(), right.schema());
        let (mut to_left, mut to_right, mut to_condition, mut keep) = (vec![], vec![], vec![], vec![]);
        for conjunct in predicate.split_conjunction() {
            if conjunct.contains_subquery() {
                keep.push(conjunct);
                continue;
            }
            let on_left = resolves_in(&conjunct, &left_schema);
            let on_right = has_columns(&conjunct) && resolves_in(&conjunct, &right_schema);
            match kind {
                JoinKind::Inner if on_left => to_left.push(conjunct),
                JoinKind::Inner if on_right => to_right.push(conjunct),
                JoinKind::Inner => to_condition.push(conjunct),
                JoinKind::Left | JoinKind::Semi | JoinKind::Anti if on_left => to_left.push(conjunct),
                JoinKind::Right if on_right => to_right.push(conjunct),
                _ => keep.push(conjunct),
            }
        }
        if to_left.is_empty() && to_right.is_empty() && to_condition.is_empty() {
            return None;
        }
        let condition = join_condition(condition, to_condition);
        let join = RelNode::Join {
            left: filter(left.clone(), to_left),
            right: filter(right.clone(), to_right),
            kind: *kind,
            condition,
        }
        .into_ref();
        Some(filter(join, keep))
    }
}

fn join_condition(existing: &Expr, extra: Vec<Expr>) -> Expr {
    let conjuncts = existing
        .split_conjunction()
        .into_iter()
        .chain(extra)
        .filter(|c| !c.is_true_literal());
    conjunction(conjuncts).unwrap_or_else(|| shardline_ir::lit(true))
}

/// Push single-input join conjuncts into that input where the join kind allows.
pub struct JoinConditionPush;

impl RewriteRule for JoinConditionPush {
    fn name(&self) -> &'static str {
        "JoinConditionPush"
    }

    fn apply(&self, node: &PlanRef) -> Option<PlanRef> {
        let RelNode::Join { left, right, kind, condition } = node.as_ref() else {
            return None;
        };
        let (push_left, push_right) = match kind {
            JoinKind::Inner | JoinKind::Semi => (true, true),
            JoinKind::Left | JoinKind::Anti => (false, true),
            JoinKind::Right => (true, false),
            JoinKind::Full => return None,
        };
        let (left_schema, right_schema) = (left.schema(), right.schema());
        let (mut to_left, mut to_right, mut keep) = (vec![], vec![], vec![]);
        for conjunct in condition.split_conjunction() {
            let local = has_columns(&conjunct) && !conjunct.contains_subquery();
            if local && push_left && resolves_in(&conjunct, &left_schema) {
                to_left.push(conjunct);
            } else if local && push_right && resolves_in(&conjunct, &right_schema) {
                to_right.push(conjunct);
            } else {
                keep.push(conjunct);
            }
        }
        if to_left.is_empty() && to_right.is_empty() {
            return None;
        }
        Some(
            RelNode::Join {
                left: filter(left.clone(), to_left),
                right: filter(right.clone(), to_right),
                kind: *kind,
                condition: conjunction(keep).unwrap_or_else(|| shardline_ir::lit(true)),
            }
            .into_ref(),
        )
    }
}

/// Conjuncts on grouping columns move below the aggregate.
pub struct FilterAggregateTranspose;

impl RewriteRule for FilterAggregateTranspose {
    fn name(&self) -> &'static str {
        "FilterAggregateTranspose"
    }

    fn apply(&self, node: &PlanRef) -> Option<PlanRef> {
        let RelNode::Filter { input, predicate } = node.as_ref() else {
            return None;
        };
        let RelNode::Aggregate { input: below, group_by, aggs } = input.as_ref() else {
            return None;
        };
        let output = input.schema();
        let (mut pushed, mut keep) = (vec![], vec![]);
        for conjunct in predicate.split_conjunction() {
            let mut ok = has_columns(&conjunct) && !conjunct.contains_subquery();
            let rewritten = conjunct.map_columns(&mut |c| match output.resolve(c.table.as_deref(), &c.column) {
                Ok(i) if i < group_by.len() => Some(group_by[i].clone()),
                _ => {
                    ok = false;
                    None
                }
            });
            if ok {
                pushed.push(rewritten);
            } else {
                keep.push(conjunct);
            }
        }
        if pushed.is_empty() {
            return None;
        }
        let aggregate = RelNode::Aggregate {
            input: filter(below.clone(), pushed),
            group_by: group_by.clone(),
            aggs: aggs.clone(),
        }
        .into_ref();
        Some(filter(aggregate, keep))
    }
}

/// Filter copied into every union branch, columns mapped by position.
pub struct FilterSetOpTranspose;

impl RewriteRule for FilterSetOpTranspose {
    fn name(&self) -> &'static str {
        "FilterSetOpTranspose"
    }

    fn apply(&self, node: &PlanRef) -> Option<PlanRef> {
        let RelNode::Filter { input, predicate } = node.as_ref() else {
            return None;
        };
        let RelNode::Union { inputs, all } = input.as_ref() else {
            return None;
        };
        if predicate.contains_subquery() {
            return None;
        }
        let output = input.schema();
        let mut branches = Vec::with_capacity(inputs.len());
        for branch in inputs {
            let schema = branch.schema();
            let mut ok = true;
            let mapped = predicate.map_columns(&mut |c| {
                match output.resolve(c.table.as_deref(), &c.column) {
                    Ok(i) if i < schema.len() => Some(NamedExpr::field(&schema.fields[i]).expr),
                    _ => {
                        ok = false;
                        None
                    }
                }
            });
            if !ok {
                return None;
            }
            branches.push(RelNode::Filter { input: branch.clone(), predicate: mapped }.into_ref());
        }
        Some(RelNode::Union { inputs: branches, all: *all }.into_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_ir::{eq, lit, qcol, AggCall, AggFunc, DataType, Field, TableId};

    fn scan(alias: &str) -> PlanRef {
        RelNode::TableScan {
            table: TableId::new("shop", alias),
            alias: alias.to_string(),
            schema: Schema::new(vec![
                Field::new("id", DataType::Int64).with_qualifier(alias),
                Field::new("customer_id", DataType::Int64).with_qualifier(alias),
            ]),
        }
        .into_ref()
    }

    fn run(plan: &PlanRef) -> (PlanRef, CompileTrace) {
        let mut trace = CompileTrace::new();
        let out = RuleProgram::rbo(DEFAULT_MATCH_LIMIT).run(plan, Phase::Rbo, &mut trace);
        (out, trace)
    }

    #[test]
    fn test_reduce_folds_constants() {
        let expr = shardline_ir::and(
            eq(lit(1), lit(1)),
            shardline_ir::binary(qcol("o", "id"), BinOp::Gt, shardline_ir::binary(lit(2), BinOp::Add, lit(3))),
        );
        assert_eq!(reduce(&expr).to_string(), "(o.id > 5)");
        assert!(reduce(&eq(lit("a"), lit("b"))).is_false_literal());
    }

    #[test]
    fn test_filter_pushed_through_join_sides() {
        let join = RelNode::Join {
            left: scan("o"),
            right: scan("c"),
            kind: JoinKind::Inner,
            condition: lit(true),
        }
        .into_ref();
        let predicate = shardline_ir::and(
            eq(qcol("o", "customer_id"), qcol("c", "id")),
            shardline_ir::and(eq(qcol("o", "id"), lit(7)), eq(qcol("c", "id"), lit(3))),
        );
        let plan = RelNode::Filter { input: join, predicate }.into_ref();

        let (out, trace) = run(&plan);

        let RelNode::Join { left, right, condition, .. } = out.as_ref() else {
            panic!("expected join at root, got {}", out.name());
        };
        assert_eq!(condition.to_string(), "(o.customer_id = c.id)");
        assert!(matches!(left.as_ref(), RelNode::Filter { predicate, .. } if predicate.to_string() == "(o.id = 7)"));
        assert!(matches!(right.as_ref(), RelNode::Filter { predicate, .. } if predicate.to_string() == "(c.id = 3)"));
        assert!(trace.fired("FilterIntoJoin"));
    }

    #[test]
    fn test_left_join_keeps_right_side_filter_above() {
        let join = RelNode::Join {
            left: scan("o"),
            right: scan("c"),
            kind: JoinKind::Left,
            condition: eq(qcol("o", "customer_id"), qcol("c", "id")),
        }
        .into_ref();
        let plan = RelNode::Filter { input: join, predicate: eq(qcol("c", "id"), lit(3)) }.into_ref();

        let (out, _) = run(&plan);

        // Filtering the null-extended side after the join is not the same as before it.
        assert!(matches!(out.as_ref(), RelNode::Filter { .. }));
    }

    #[test]
    fn test_filter_through_project_and_aggregate() {
        let aggregate = RelNode::Aggregate {
            input: scan("o"),
            group_by: vec![qcol("o", "customer_id")],
            aggs: vec![AggCall { func: AggFunc::Count, args: vec![], distinct: false, alias: "agg0".into() }],
        }
        .into_ref();
        let project = RelNode::Project {
            input: aggregate,
            exprs: vec![
                NamedExpr::new(qcol("o", "customer_id"), "customer_id"),
                NamedExpr::new(shardline_ir::col("agg0"), "n"),
            ],
        }
        .into_ref();
        let predicate = shardline_ir::and(
            eq(shardline_ir::col("customer_id"), lit(5)),
            shardline_ir::binary(shardline_ir::col("n"), BinOp::Gt, lit(1)),
        );
        let plan = RelNode::Filter { input: project, predicate }.into_ref();

        let (out, trace) = run(&plan);

        let RelNode::Project { input, .. } = out.as_ref() else { panic!("expected project") };
        let RelNode::Filter { input: aggregate, predicate } = input.as_ref() else { panic!("expected having filter") };
        assert_eq!(predicate.to_string(), "(agg0 > 1)");
        let RelNode::Aggregate { input: below, .. } = aggregate.as_ref() else { panic!("expected aggregate") };
        assert!(matches!(below.as_ref(), RelNode::Filter { predicate, .. } if predicate.to_string() == "(o.customer_id = 5)"));
        assert!(trace.fired("FilterProjectTranspose"));
        assert!(trace.fired("FilterAggregateTranspose"));
    }

    #[test]
    fn test_filter_copied_into_union_branches() {
        let union = RelNode::Union { inputs: vec![scan("a"), scan("b")], all: true }.into_ref();
        let plan = RelNode::Filter { input: union, predicate: eq(qcol("a", "id"), lit(1)) }.into_ref();

        let (out, _) = run(&plan);

        let RelNode::Union { inputs, .. } = out.as_ref() else { panic!("expected union") };
        let predicates: Vec<String> = inputs
            .iter()
            .map(|i| match i.as_ref() {
                RelNode::Filter { predicate, .. } => predicate.to_string(),
                other => other.name().to_string(),
            })
            .collect();
        assert_eq!(predicates, vec!["(a.id = 1)", "(b.id = 1)"]);
    }

    #[test]
    fn test_match_limit_stops_rewriting() {
        let mut plan = scan("o");
        for i in 0..4 {
            plan = RelNode::Filter { input: plan, predicate: eq(qcol("o", "id"), lit(i)) }.into_ref();
        }
        let mut trace = CompileTrace::new();
        let out = RuleProgram::rbo(1).run(&plan, Phase::Rbo, &mut trace);

        assert!(trace.fired("MatchLimit"));
        assert_eq!(trace.rules(Phase::Rbo), vec!["FilterMerge", "MatchLimit"]);
        // Still a valid plan over the same scan
        assert_eq!(out.tables(), vec![TableId::new("shop", "o")]);
    }
}
