//! Distribution resolution: which data nodes a statement must reach

use crate::RouteError;
use serde::{Deserialize, Serialize};
use shardline_ir::{DataNode, Distribution, IndexCondition, LogicalTable, ShardingValues, TableType, Value};

/// Which replica serves a read of a global table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadReplica {
    #[default]
    First,
    Last,
}

/// Sharding input: an analyzed predicate plus bound parameters, or concrete values.
#[derive(Debug, Clone, Copy)]
pub enum ShardingInput<'a> {
    Condition {
        condition: &'a IndexCondition,
        params: &'a [Value],
    },
    Values(&'a ShardingValues),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub table_type: TableType,
    /// Sorted and deduplicated.
    pub nodes: Vec<DataNode>,
    /// Every data node of the table was selected.
    pub broadcast: bool,
    /// Any single node may serve a read (global tables).
    pub read_any: bool,
}

impl Resolution {
    /// Nodes a read must touch under `policy`.
    pub fn read_nodes(&self, policy: ReadReplica) -> Vec<DataNode> {
        if !self.read_any {
            return self.nodes.clone();
        }
        let pick = match policy {
            ReadReplica::First => self.nodes.first(),
            ReadReplica::Last => self.nodes.last(),
        };
        pick.cloned().into_iter().collect()
    }
}

pub struct DistributionResolver;

impl DistributionResolver {
    pub fn resolve(table: &LogicalTable, input: ShardingInput<'_>) -> Result<Resolution, RouteError> {
        let all = table.all_data_nodes();
        match &table.distribution {
            Distribution::Sharding(function) => {
                let mut nodes = match input {
                    ShardingInput::Condition { condition, .. } if condition.is_unknown() => all.clone(),
                    ShardingInput::Condition { condition, params } => function.calculate(&condition.bind(params)),
                    ShardingInput::Values(values) => function.calculate(values),
                };
                nodes.sort();
                nodes.dedup();
                if nodes.is_empty() {
                    // A function that places nothing is treated as unplaced, not as no match.
                    nodes = all.clone();
                }
                let broadcast = nodes.len() == all.len();
                if broadcast && all.len() > 1 {
                    tracing::debug!(table = %table.id(), nodes = all.len(), "broadcast to all data nodes");
                }
                Ok(Resolution {
                    table_type: TableType::Sharding,
                    nodes,
                    broadcast,
                    read_any: false,
                })
            }
            Distribution::Global(_) => Ok(Resolution {
                table_type: TableType::Global,
                nodes: all,
                broadcast: true,
                read_any: true,
            }),
            Distribution::Normal(node) => Ok(Resolution {
                table_type: TableType::Normal,
                nodes: vec![node.clone()],
                broadcast: true,
                read_any: false,
            }),
            Distribution::Custom => Err(RouteError::UnsupportedTableType {
                table: table.id().to_string(),
                table_type: TableType::Custom,
            }),
        }
    }
}
