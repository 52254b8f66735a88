//! Join flattening and ordering
//!
//! Inner join trees are flattened into a [`RelNode::MultiJoin`] and later
//! rebuilt left-deep in the cheapest order found. Small joins are searched
//! exhaustively; larger ones greedily.

use crate::cost::{connects, CostModel};
use crate::resolves_in;
use indexmap::IndexSet;
use shardline_ir::{conjunction, transform_up, Expr, JoinKind, NamedExpr, PlanRef, RelNode};

/// Largest join searched over every permutation.
const EXHAUSTIVE_LIMIT: usize = 6;

/// Flatten nested inner joins into multi-joins.
pub fn to_multi_join(plan: &PlanRef) -> PlanRef {
    transform_up(plan, &mut |node| {
        let RelNode::Join { left, right, kind: JoinKind::Inner, condition } = node.as_ref() else {
            return None;
        };
        if condition.contains_subquery() {
            return None;
        }
        let mut inputs = Vec::new();
        let mut conjuncts = Vec::new();
        for side in [left, right] {
            match side.as_ref() {
                RelNode::MultiJoin { inputs: nested, condition } => {
                    inputs.extend(nested.iter().cloned());
                    conjuncts.extend(condition.split_conjunction());
                }
                _ => inputs.push(side.clone()),
            }
        }
        conjuncts.extend(condition.split_conjunction());
        conjuncts.retain(|c| !c.is_true_literal());
        Some(
            RelNode::MultiJoin {
                inputs,
                condition: conjunction(conjuncts).unwrap_or_else(|| shardline_ir::lit(true)),
            }
            .into_ref(),
        )
    })
}

pub struct JoinOrderer<'a> {
    cost: &'a CostModel<'a>,
}

impl<'a> JoinOrderer<'a> {
    pub fn new(cost: &'a CostModel<'a>) -> Self {
        Self { cost }
    }

    /// Cheapest left-deep order, as input positions.
    pub fn best_order(&self, inputs: &[PlanRef], condition: &Expr) -> Vec<usize> {
        let conjuncts = condition.split_conjunction();
        let rows: Vec<f64> = inputs.iter().map(|i| self.cost.rows(i)).collect();
        let score = |order: &[usize]| -> f64 {
            self.cost
                .intermediate_rows(inputs, &rows, order, &conjuncts)
                .iter()
                .skip(1)
                .sum()
        };

        if inputs.len() <= EXHAUSTIVE_LIMIT {
            let mut best: Vec<usize> = (0..inputs.len()).collect();
            let mut best_cost = score(&best);
            for order in permutations(inputs.len()) {
                let cost = score(&order);
                if cost < best_cost {
                    best_cost = cost;
                    best = order;
                }
            }
            return best;
        }

        // Greedy: smallest input first, then the cheapest next step.
        let mut remaining: IndexSet<usize> = (0..inputs.len()).collect();
        let start = (0..inputs.len())
            .min_by(|a, b| rows[*a].total_cmp(&rows[*b]))
            .unwrap_or(0);
        remaining.shift_remove(&start);
        let mut order = vec![start];
        while !remaining.is_empty() {
            let mut pick = None;
            let mut pick_cost = f64::INFINITY;
            for &candidate in &remaining {
                let mut trial = order.clone();
                trial.push(candidate);
                let cost = score(&trial);
                if cost < pick_cost {
                    pick_cost = cost;
                    pick = Some(candidate);
                }
            }
            let Some(next) = pick else { break };
            remaining.shift_remove(&next);
            order.push(next);
        }
        order
    }

    /// Rebuild a multi-join as a left-deep join tree in the cheapest order.
    /// Output columns keep the original multi-join order.
    pub fn order(&self, inputs: &[PlanRef], condition: &Expr) -> PlanRef {
        let order = self.best_order(inputs, condition);
        let mut pending: Vec<Expr> = condition
            .split_conjunction()
            .into_iter()
            .filter(|c| !c.is_true_literal())
            .collect();

        let mut plan = inputs[order[0]].clone();
        for &next in &order[1..] {
            let right = inputs[next].clone();
            let joined = plan.schema().join(&right.schema());
            let (placed, rest): (Vec<Expr>, Vec<Expr>) = pending.into_iter().partition(|c| resolves_in(c, &joined));
            pending = rest;
            plan = RelNode::Join {
                left: plan,
                right,
                kind: JoinKind::Inner,
                condition: conjunction(placed).unwrap_or_else(|| shardline_ir::lit(true)),
            }
            .into_ref();
        }
        if let Some(predicate) = conjunction(pending) {
            plan = RelNode::Filter { input: plan, predicate }.into_ref();
        }

        let identity = order.iter().enumerate().all(|(i, o)| i == *o);
        if identity {
            return plan;
        }
        let original = RelNode::MultiJoin { inputs: inputs.to_vec(), condition: condition.clone() }.schema();
        RelNode::Project {
            input: plan,
            exprs: original.fields.iter().map(NamedExpr::field).collect(),
        }
        .into_ref()
    }

    /// Do the inputs at `a` and `b` share a join conjunct?
    pub fn connected(&self, inputs: &[PlanRef], condition: &Expr, a: usize, b: usize) -> bool {
        connects(&condition.split_conjunction(), &inputs[a].schema(), &inputs[b].schema())
    }
}

/// Every permutation of `0..n` in lexicographic order.
fn permutations(n: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current: Vec<usize> = (0..n).collect();
    loop {
        out.push(current.clone());
        // next lexicographic permutation
        let Some(i) = (1..n).rev().find(|&i| current[i - 1] < current[i]) else {
            break;
        };
        let j = (i..n).rev().find(|&j| current[j] > current[i - 1]).unwrap_or(i);
        current.swap(i - 1, j);
        current[i..].reverse();
    }
    out
}
