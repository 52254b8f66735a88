//! View routing: one rendered statement per data node a view must read

use crate::to_sql::fragment_select;
use crate::trace::{CompileTrace, Phase};
use crate::PlanError;
use shardline_ast::{render, RenderMode, Statement, Substitution};
use shardline_ir::{
    transform_up, Catalog, DataNode, Distribution, IndexCondition, LogicalTable, PlanRef, RelNode, TableId, Value,
};
use shardline_route::{DistributionResolver, ReadReplica, ShardingInput};
use std::sync::Arc;

pub struct ScanRouter<'a> {
    catalog: &'a dyn Catalog,
    default_schema: &'a str,
    params: &'a [Value],
    global_read: ReadReplica,
}

impl<'a> ScanRouter<'a> {
    pub fn new(catalog: &'a dyn Catalog, default_schema: &'a str, params: &'a [Value]) -> Self {
        Self {
            catalog,
            default_schema,
            params,
            global_read: ReadReplica::default(),
        }
    }

    pub fn with_global_read(mut self, policy: ReadReplica) -> Self {
        self.global_read = policy;
        self
    }

    /// Replace every view (and any scan left outside one) with routed scans.
    pub fn route(&self, plan: &PlanRef, trace: &mut CompileTrace) -> Result<PlanRef, PlanError> {
        let mut error = None;
        let routed = transform_up(plan, &mut |node| {
            if error.is_some() {
                return None;
            }
            let result = match node.as_ref() {
                RelNode::View { table, fragment, condition, .. } => self.route_view(table, fragment, condition),
                RelNode::TableScan { table, .. } => self.route_view(table, node, &IndexCondition::unknown()),
                _ => return None,
            };
            match result {
                Ok(routed) => {
                    trace.record(Phase::Routing, "RouteView", describe(&routed));
                    Some(routed)
                }
                Err(err) => {
                    error = Some(err);
                    None
                }
            }
        });
        match error {
            Some(err) => Err(err),
            None => Ok(routed),
        }
    }

    fn table(&self, id: &TableId) -> Result<Arc<LogicalTable>, PlanError> {
        self.catalog
            .get_table(&id.schema, &id.table)
            .ok_or_else(|| PlanError::UnknownTable(id.to_string()))
    }

    fn route_view(&self, anchor: &TableId, fragment: &PlanRef, condition: &IndexCondition) -> Result<PlanRef, PlanError> {
        let table = self.table(anchor)?;
        let resolution = DistributionResolver::resolve(
            &table,
            ShardingInput::Condition {
                condition,
                params: self.params,
            },
        )?;
        let nodes = resolution.read_nodes(self.global_read);
        let statement = Statement::Select(fragment_select(fragment)?);
        let schema = fragment.schema();

        let mut others: Vec<Arc<LogicalTable>> = Vec::new();
        for id in fragment.tables() {
            if &id != anchor && !others.iter().any(|t| t.id() == id) {
                others.push(self.table(&id)?);
            }
        }

        let mut scans = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut substitution = Substitution::new(self.default_schema).table(anchor, node);
            for other in &others {
                let placed = colocated_node(other, &table, node).ok_or_else(|| PlanError::NotColocated {
                    table: other.id().to_string(),
                    target: node.target.clone(),
                })?;
                substitution = substitution.table(&other.id(), &placed);
            }
            let rendered = render(&statement.substitute(&substitution), RenderMode::Parameterized(self.params))?;
            scans.push(
                RelNode::RoutedScan {
                    target: node.target.clone(),
                    sql: rendered.sql,
                    params: rendered.params,
                    schema: schema.clone(),
                }
                .into_ref(),
            );
        }
        Ok(match scans.len() {
            1 => scans.remove(0),
            _ => RelNode::Gather { inputs: scans }.into_ref(),
        })
    }
}

/// Data node of `other` that joins node-locally with `anchor_node`.
fn colocated_node(other: &LogicalTable, anchor: &LogicalTable, anchor_node: &DataNode) -> Option<DataNode> {
    match &other.distribution {
        Distribution::Normal(node) => (node.target == anchor_node.target).then(|| node.clone()),
        Distribution::Global(replicas) => replicas.iter().find(|r| r.target == anchor_node.target).cloned(),
        Distribution::Sharding(function) => {
            // Equal placements list their data nodes in the same slot order.
            let Distribution::Sharding(anchor_function) = &anchor.distribution else {
                return None;
            };
            let slot = anchor_function.data_nodes().iter().position(|n| n == anchor_node)?;
            function
                .data_nodes()
                .get(slot)
                .filter(|n| n.target == anchor_node.target)
                .cloned()
        }
        Distribution::Custom => None,
    }
}

fn describe(node: &RelNode) -> String {
    match node {
        RelNode::RoutedScan { target, .. } => target.clone(),
        RelNode::Gather { inputs } => format!("gather of {}", inputs.len()),
        other => other.name().to_string(),
    }
}
