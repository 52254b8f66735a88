//! Final physical touches: residual multi-joins become binary joins and
//! identical data-node reads are spooled once.

use crate::trace::{CompileTrace, Phase};
use indexmap::IndexMap;
use shardline_ir::{fingerprint, transform_up, JoinKind, PlanRef, RelNode};
use std::sync::Arc;

pub fn materialize(plan: &PlanRef, trace: &mut CompileTrace) -> PlanRef {
    let plan = transform_up(plan, &mut |node| {
        let RelNode::MultiJoin { inputs, condition } = node.as_ref() else {
            return None;
        };
        trace.record(Phase::Materialize, "MultiJoinToJoin", inputs.len().to_string());
        let mut iter = inputs.iter().cloned();
        let first = iter.next()?;
        let joined = iter.fold(first, |left, right| {
            RelNode::Join {
                left,
                right,
                kind: JoinKind::Inner,
                condition: shardline_ir::lit(true),
            }
            .into_ref()
        });
        Some(if condition.is_true_literal() {
            joined
        } else {
            RelNode::Filter { input: joined, predicate: condition.clone() }.into_ref()
        })
    });

    let mut counts: IndexMap<String, usize> = IndexMap::new();
    count_reads(&plan, &mut counts);
    if counts.values().all(|c| *c < 2) {
        return plan;
    }
    let mut spooler = Spooler {
        shared: counts.into_iter().filter(|(_, c)| *c > 1).map(|(k, _)| (k, None)).collect(),
        next_id: 0,
    };
    let spooled = spooler.rewrite(&plan);
    trace.record(Phase::Materialize, "Spool", format!("{} shared reads", spooler.next_id));
    spooled
}

fn read_key(node: &RelNode) -> Option<String> {
    match node {
        RelNode::RoutedScan { .. } | RelNode::Gather { .. } => fingerprint(node).ok(),
        _ => None,
    }
}

fn count_reads(node: &PlanRef, counts: &mut IndexMap<String, usize>) {
    if let Some(key) = read_key(node) {
        *counts.entry(key).or_default() += 1;
        return;
    }
    for input in node.inputs() {
        count_reads(input, counts);
    }
}

struct Spooler {
    /// Fingerprint to spool id, assigned at first use.
    shared: IndexMap<String, Option<usize>>,
    next_id: usize,
}

impl Spooler {
    fn rewrite(&mut self, node: &PlanRef) -> PlanRef {
        if let Some(key) = read_key(node) {
            if let Some(slot) = self.shared.get_mut(&key) {
                return match slot {
                    Some(id) => RelNode::SpoolRef { id: *id, schema: node.schema() }.into_ref(),
                    None => {
                        let id = self.next_id;
                        self.next_id += 1;
                        *slot = Some(id);
                        RelNode::Spool { id, input: node.clone() }.into_ref()
                    }
                };
            }
            return node.clone();
        }
        let inputs = node.inputs();
        if inputs.is_empty() {
            return node.clone();
        }
        let rewritten: Vec<PlanRef> = inputs.iter().map(|i| self.rewrite(i)).collect();
        if rewritten.iter().zip(inputs.iter()).all(|(n, o)| Arc::ptr_eq(n, o)) {
            node.clone()
        } else {
            node.with_inputs(rewritten).into_ref()
        }
    }
}
