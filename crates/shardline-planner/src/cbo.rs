//! Cost-based conversion into data-node views
//!
//! Logical operators are folded bottom-up into [`RelNode::View`] nodes: every
//! scan starts a view, and projections, filters and colocated joins above it
//! are pushed into the view's fragment as long as the fragment still renders
//! as one SQL statement. Sorting and aggregation only move into views that
//! read a single data node.

use crate::cost::CostModel;
use crate::join_reorder::JoinOrderer;
use crate::rules::inline_through;
use crate::to_sql::fragment_select;
use crate::trace::{CompileTrace, Phase};
use crate::PlanError;
use shardline_ir::{
    conjunction, transform_up, BinOp, Catalog, ConditionKind, Distribution, Expr, IndexCondition, IndexProbe,
    JoinKind, KeyConstraint, LogicalTable, NamedExpr, Operand, PlanRef, RelNode, ShardingFunction, TableId,
    TableType,
};
use shardline_route::{DistributionResolver, PredicateAnalyzer, ShardingInput};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Already expressed as data-node reads.
pub fn in_convention(plan: &RelNode) -> bool {
    match plan {
        RelNode::View { .. } | RelNode::RoutedScan { .. } => true,
        RelNode::Gather { inputs } => inputs.iter().all(|i| in_convention(i)),
        RelNode::Spool { input, .. } => in_convention(input),
        _ => false,
    }
}

pub struct Cbo<'a> {
    catalog: &'a dyn Catalog,
    cost: CostModel<'a>,
    gsi_available: bool,
}

impl<'a> Cbo<'a> {
    pub fn new(catalog: &'a dyn Catalog) -> Self {
        Self {
            catalog,
            cost: CostModel::new(catalog),
            gsi_available: false,
        }
    }

    pub fn with_gsi(mut self, available: bool) -> Self {
        self.gsi_available = available;
        self
    }

    pub fn optimize(&self, plan: &PlanRef, reorder: bool, trace: &mut CompileTrace) -> Result<PlanRef, PlanError> {
        if in_convention(plan) {
            trace.record(Phase::Cbo, "InConvention", plan.name());
            return Ok(plan.clone());
        }
        let plan = self.order_joins(plan, reorder, trace);
        let plan = to_calc(&plan, trace);

        let mut error = None;
        let plan = transform_up(&plan, &mut |node| {
            if error.is_some() {
                return None;
            }
            match self.push_into_view(node, trace) {
                Ok(next) => next,
                Err(err) => {
                    error = Some(err);
                    None
                }
            }
        });
        match error {
            Some(err) => Err(err),
            None => Ok(plan),
        }
    }

    fn order_joins(&self, plan: &PlanRef, reorder: bool, trace: &mut CompileTrace) -> PlanRef {
        let orderer = JoinOrderer::new(&self.cost);
        transform_up(plan, &mut |node| {
            let RelNode::MultiJoin { inputs, condition } = node.as_ref() else {
                return None;
            };
            let order = if reorder {
                orderer.best_order(inputs, condition)
            } else {
                (0..inputs.len()).collect()
            };
            trace.record(
                Phase::JoinReorder,
                "JoinOrder",
                order.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(","),
            );
            Some(if reorder {
                orderer.order(inputs, condition)
            } else {
                left_deep(inputs, condition)
            })
        })
    }

    fn table(&self, id: &TableId) -> Result<Arc<LogicalTable>, PlanError> {
        self.catalog
            .get_table(&id.schema, &id.table)
            .ok_or_else(|| PlanError::UnknownTable(id.to_string()))
    }

    fn push_into_view(&self, node: &PlanRef, trace: &mut CompileTrace) -> Result<Option<PlanRef>, PlanError> {
        match node.as_ref() {
            RelNode::TableScan { table, .. } => {
                let logical = self.table(table)?;
                if logical.table_type() == TableType::Custom {
                    return Err(PlanError::UnsupportedTableType {
                        table: table.to_string(),
                        table_type: TableType::Custom,
                    });
                }
                self.view(table.clone(), node.clone(), trace).map(Some)
            }
            RelNode::Calc { input, exprs, condition } => {
                let RelNode::View { table, fragment, .. } = input.as_ref() else {
                    return Ok(None);
                };
                let candidate = merge_calc(fragment, exprs, condition.as_ref()).unwrap_or_else(|| {
                    RelNode::Calc {
                        input: fragment.clone(),
                        exprs: exprs.clone(),
                        condition: condition.clone(),
                    }
                    .into_ref()
                });
                if fragment_select(&candidate).is_err() {
                    return Ok(None);
                }
                trace.record(Phase::Cbo, "CalcIntoView", table.to_string());
                self.view(table.clone(), candidate, trace).map(Some)
            }
            RelNode::Sort { input, .. } | RelNode::Aggregate { input, .. } => {
                let RelNode::View { table, fragment, single_node: true, .. } = input.as_ref() else {
                    return Ok(None);
                };
                let candidate = node.with_inputs(vec![fragment.clone()]).into_ref();
                if fragment_select(&candidate).is_err() {
                    return Ok(None);
                }
                trace.record(Phase::Cbo, format!("{}IntoView", node.name()).as_str(), table.to_string());
                self.view(table.clone(), candidate, trace).map(Some)
            }
            RelNode::Join { left, right, kind, condition } => {
                let (
                    RelNode::View { table: left_table, fragment: left_fragment, condition: left_condition, .. },
                    RelNode::View { table: right_table, fragment: right_fragment, condition: right_condition, .. },
                ) = (left.as_ref(), right.as_ref())
                else {
                    return Ok(None);
                };
                let lt = self.table(left_table)?;
                let rt = self.table(right_table)?;
                let sides = JoinSides {
                    left: (lt.as_ref(), left_fragment),
                    right: (rt.as_ref(), right_fragment),
                };
                if !sides.colocated(*kind, condition) {
                    trace.record(Phase::Cbo, "JoinNotColocated", format!("{} {} {}", left_table, kind.sql(), right_table));
                    return Ok(None);
                }
                let candidate = RelNode::Join {
                    left: left_fragment.clone(),
                    right: right_fragment.clone(),
                    kind: *kind,
                    condition: condition.clone(),
                }
                .into_ref();
                if fragment_select(&candidate).is_err() {
                    return Ok(None);
                }
                let anchor = if prefer_right(&lt, left_condition, &rt, right_condition) {
                    right_table
                } else {
                    left_table
                };
                trace.record(Phase::Cbo, "JoinIntoView", format!("{} {} {}", left_table, kind.sql(), right_table));
                self.view(anchor.clone(), candidate, trace).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Build a view anchored on `table`, deriving its shard condition.
    fn view(&self, table: TableId, fragment: PlanRef, trace: &mut CompileTrace) -> Result<PlanRef, PlanError> {
        let logical = self.table(&table)?;
        let alias = scan_alias(&fragment, &table).unwrap_or_else(|| table.table.clone());
        let predicate = conjunction(row_predicates(&fragment));
        let condition = PredicateAnalyzer::new(&logical)
            .with_qualifier(&alias)
            .analyze(predicate.as_ref());
        let single_node = single_node(&logical, &condition)?;
        let index_probe = if self.gsi_available {
            self.index_probe(&logical, &fragment, &condition, trace)
        } else {
            None
        };
        Ok(RelNode::View {
            table,
            fragment,
            condition,
            single_node,
            index_probe,
        }
        .into_ref())
    }

    /// Global index lookup for a broadcast view, when cheaper.
    ///
    /// Advisory only: it is shown by `explain` and recorded in the trace, while
    /// routing still broadcasts the view. Index lookups belong to the GSI
    /// service, which the compiler never calls.
    fn index_probe(
        &self,
        table: &LogicalTable,
        fragment: &PlanRef,
        condition: &IndexCondition,
        trace: &mut CompileTrace,
    ) -> Option<IndexProbe> {
        if table.table_type() != TableType::Sharding || !condition.is_unknown() {
            return None;
        }
        let index = table.indexes.iter().find(|i| condition.covers_columns(&i.columns))?;
        let broadcast = self.cost.view_cost(table.all_data_nodes().len(), self.cost.rows(fragment));
        let probe = self.cost.index_probe_cost();
        if probe >= broadcast {
            return None;
        }
        trace.record(Phase::Cbo, "IndexProbe", format!("{} via {}", table.id(), index.name));
        Some(IndexProbe {
            index: index.name.clone(),
            columns: index.columns.clone(),
        })
    }
}

fn left_deep(inputs: &[PlanRef], condition: &Expr) -> PlanRef {
    let mut iter = inputs.iter().cloned();
    let first = iter.next();
    let joined = iter.fold(first, |acc, right| {
        Some(match acc {
            Some(left) => RelNode::Join {
                left,
                right,
                kind: JoinKind::Inner,
                condition: shardline_ir::lit(true),
            }
            .into_ref(),
            None => right,
        })
    });
    let plan = joined.unwrap_or_else(|| {
        RelNode::Values {
            schema: Default::default(),
            rows: vec![],
        }
        .into_ref()
    });
    if condition.is_true_literal() {
        plan
    } else {
        RelNode::Filter {
            input: plan,
            predicate: condition.clone(),
        }
        .into_ref()
    }
}

/// Filters and projections to Calc, merging stacked Calcs.
fn to_calc(plan: &PlanRef, trace: &mut CompileTrace) -> PlanRef {
    transform_up(plan, &mut |node| {
        let calc = match node.as_ref() {
            RelNode::Filter { input, predicate } if !predicate.contains_subquery() => RelNode::Calc {
                input: input.clone(),
                exprs: input.schema().fields.iter().map(NamedExpr::field).collect(),
                condition: Some(predicate.clone()),
            },
            RelNode::Project { input, exprs } if !exprs.iter().any(|e| e.expr.contains_subquery()) => RelNode::Calc {
                input: input.clone(),
                exprs: exprs.clone(),
                condition: None,
            },
            _ => return None,
        };
        let RelNode::Calc { input, exprs, condition } = &calc else {
            return None;
        };
        trace.record(Phase::Cbo, "ToCalc", node.name());
        Some(merge_calc(input, exprs, condition.as_ref()).unwrap_or_else(|| calc.into_ref()))
    })
}

/// `Calc(exprs, condition)` over `input`, merged into `input` when it is a Calc.
fn merge_calc(input: &PlanRef, exprs: &[NamedExpr], condition: Option<&Expr>) -> Option<PlanRef> {
    let RelNode::Calc {
        input: inner_input,
        exprs: inner_exprs,
        condition: inner_condition,
    } = input.as_ref()
    else {
        return None;
    };
    let output = input.schema();
    let inlined = exprs
        .iter()
        .map(|e| inline_through(&e.expr, &output, inner_exprs).map(|expr| NamedExpr::new(expr, e.alias.clone())))
        .collect::<Option<Vec<_>>>()?;
    let outer_condition = match condition {
        Some(c) => Some(inline_through(c, &output, inner_exprs)?),
        None => None,
    };
    let merged = RelNode::Calc {
        input: inner_input.clone(),
        exprs: inlined,
        condition: conjunction(inner_condition.iter().cloned().chain(outer_condition)),
    };
    let expected = RelNode::Calc {
        input: input.clone(),
        exprs: exprs.to_vec(),
        condition: None,
    }
    .schema();
    // Inlining must not change the row type seen above.
    (merged.schema() == expected).then(|| merged.into_ref())
}

/// First scan alias of `table` inside a fragment.
fn scan_alias(fragment: &RelNode, table: &TableId) -> Option<String> {
    if let RelNode::TableScan { table: scanned, alias, .. } = fragment {
        if scanned == table {
            return Some(alias.clone());
        }
    }
    fragment.inputs().into_iter().find_map(|i| scan_alias(i, table))
}

/// Predicates every row of the fragment satisfies, for shard pruning.
fn row_predicates(node: &RelNode) -> Vec<Expr> {
    match node {
        RelNode::Calc { input, condition, .. } => {
            let mut out = row_predicates(input);
            if let Some(condition) = condition {
                if !aggregated(input) {
                    out.extend(condition.split_conjunction());
                }
            }
            out
        }
        RelNode::Filter { input, predicate } => {
            let mut out = row_predicates(input);
            if !aggregated(input) {
                out.extend(predicate.split_conjunction());
            }
            out
        }
        RelNode::Project { input, .. } | RelNode::Sort { input, .. } | RelNode::Aggregate { input, .. } => {
            row_predicates(input)
        }
        RelNode::Join { left, right, kind, condition } => match kind {
            JoinKind::Inner | JoinKind::Semi => {
                let mut out = row_predicates(left);
                out.extend(row_predicates(right));
                out.extend(condition.split_conjunction());
                out
            }
            JoinKind::Left | JoinKind::Anti => row_predicates(left),
            JoinKind::Right => row_predicates(right),
            JoinKind::Full => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Rows reaching this point are groups, not table rows.
fn aggregated(node: &RelNode) -> bool {
    match node {
        RelNode::Aggregate { .. } => true,
        RelNode::Calc { input, .. }
        | RelNode::Filter { input, .. }
        | RelNode::Project { input, .. }
        | RelNode::Sort { input, .. } => aggregated(input),
        _ => false,
    }
}

fn single_node(table: &LogicalTable, condition: &IndexCondition) -> Result<bool, PlanError> {
    let Distribution::Sharding(function) = &table.distribution else {
        return Ok(true);
    };
    if function.data_nodes().len() <= 1 {
        return Ok(true);
    }
    if condition.kind != ConditionKind::Point {
        return Ok(false);
    }
    let mut literal_only = true;
    for column in function.columns() {
        match condition.constraint(column) {
            Some(KeyConstraint::Points { values }) if values.len() == 1 => {
                literal_only &= matches!(values[0], Operand::Literal(_));
            }
            _ => return Ok(false),
        }
    }
    if !literal_only {
        // The bound value is unknown here; only a function that places every
        // key keeps the view on one node.
        return Ok(function.maps_key_to_one_node());
    }
    let resolution = DistributionResolver::resolve(table, ShardingInput::Condition { condition, params: &[] })?;
    Ok(resolution.nodes.len() == 1)
}

fn rank(table: &LogicalTable, condition: &IndexCondition) -> (u8, u8) {
    let by_type = match table.table_type() {
        TableType::Sharding => 0,
        TableType::Normal => 1,
        TableType::Global | TableType::Custom => 2,
    };
    let by_condition = match condition.kind {
        ConditionKind::Point => 0,
        ConditionKind::Range => 1,
        ConditionKind::Unknown => 2,
    };
    (by_type, by_condition)
}

/// Should the joined view be anchored on the right table?
fn prefer_right(lt: &LogicalTable, lc: &IndexCondition, rt: &LogicalTable, rc: &IndexCondition) -> bool {
    rank(rt, rc) < rank(lt, lc)
}

struct JoinSides<'s> {
    left: (&'s LogicalTable, &'s PlanRef),
    right: (&'s LogicalTable, &'s PlanRef),
}

impl JoinSides<'_> {
    /// Can every joined row pair be produced on one data node?
    fn colocated(&self, kind: JoinKind, condition: &Expr) -> bool {
        let (lt, _) = self.left;
        let (rt, _) = self.right;
        let global_right = matches!(kind, JoinKind::Inner | JoinKind::Left | JoinKind::Semi | JoinKind::Anti);
        let global_left = matches!(kind, JoinKind::Inner | JoinKind::Right);
        match (&lt.distribution, &rt.distribution) {
            (Distribution::Normal(a), Distribution::Normal(b)) => a.target == b.target,
            (Distribution::Normal(n), Distribution::Global(replicas))
            | (Distribution::Global(replicas), Distribution::Normal(n)) => {
                replicas.iter().any(|r| r.target == n.target)
            }
            (Distribution::Sharding(f), Distribution::Global(replicas)) => {
                global_right && covers(replicas, f.as_ref())
            }
            (Distribution::Global(replicas), Distribution::Sharding(f)) => {
                global_left && covers(replicas, f.as_ref())
            }
            (Distribution::Global(a), Distribution::Global(b)) => targets(a) == targets(b),
            (Distribution::Sharding(f), Distribution::Sharding(g)) => self.same_placement(f.as_ref(), g.as_ref(), condition),
            _ => false,
        }
    }

    fn same_placement(&self, f: &dyn ShardingFunction, g: &dyn ShardingFunction, condition: &Expr) -> bool {
        let (Some(pf), Some(pg)) = (f.placement(), g.placement()) else {
            return false;
        };
        if pf != pg || f.columns().len() != g.columns().len() {
            return false;
        }
        let (lt, left_fragment) = self.left;
        let (rt, right_fragment) = self.right;
        let (Some(left_alias), Some(right_alias)) = (scan_alias(left_fragment, &lt.id()), scan_alias(right_fragment, &rt.id()))
        else {
            return false;
        };
        let conjuncts = condition.split_conjunction();
        f.columns().iter().zip(g.columns()).all(|(lc, rc)| {
            conjuncts.iter().any(|c| {
                let Expr::BinaryOp { op: BinOp::Eq, left, right } = c else {
                    return false;
                };
                let is = |e: &Expr, alias: &str, column: &str| {
                    matches!(e, Expr::Column { col }
                        if col.column.eq_ignore_ascii_case(column)
                            && col.table.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(alias)))
                };
                (is(left, &left_alias, lc) && is(right, &right_alias, rc))
                    || (is(left, &right_alias, rc) && is(right, &left_alias, lc))
            })
        })
    }
}

fn targets(nodes: &[shardline_ir::DataNode]) -> BTreeSet<&str> {
    nodes.iter().map(|n| n.target.as_str()).collect()
}

/// Global replicas exist on every target of the sharded table.
fn covers(replicas: &[shardline_ir::DataNode], function: &dyn ShardingFunction) -> bool {
    let available = targets(replicas);
    function.data_nodes().iter().all(|n| available.contains(n.target.as_str()))
}
