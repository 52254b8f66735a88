//! Catalog contract: logical tables, their distribution and data nodes

use crate::{DataType, Field, Schema, ShardingValues, TableId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableType {
    Sharding,
    Global,
    Normal,
    Custom,
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableType::Sharding => "SHARDING",
            TableType::Global => "GLOBAL",
            TableType::Normal => "NORMAL",
            TableType::Custom => "CUSTOM",
        };
        f.write_str(name)
    }
}

/// One physical (connection target, schema, table) location.
///
/// Ordering is by target, then schema, then table; resolvers return data
/// nodes in this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataNode {
    pub target: String,
    pub schema: String,
    pub table: String,
}

impl DataNode {
    pub fn new(target: impl Into<String>, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.target, self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// Global secondary index declared on a logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalIndex {
    pub name: String,
    pub columns: Vec<String>,
}

/// Maps constrained column values to data nodes.
pub trait ShardingFunction: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Sharding-key columns, in key order.
    fn columns(&self) -> &[String];

    fn is_sharding_key(&self, column: &str) -> bool {
        self.columns().iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Every data node of the table.
    fn data_nodes(&self) -> &[DataNode];

    /// Data nodes that may hold rows matching `values`. Must return a superset
    /// of the matching nodes; columns absent from `values` are unconstrained.
    fn calculate(&self, values: &ShardingValues) -> Vec<DataNode>;

    /// Every complete key value lands on exactly one data node. Functions
    /// that broadcast unplaced keys answer `false`.
    fn maps_key_to_one_node(&self) -> bool {
        false
    }

    /// Placement signature. Functions with equal signatures send equal keys to
    /// the same connection target, so their tables can be joined node-locally.
    fn placement(&self) -> Option<String> {
        None
    }
}

/// Closed set of placements, one per table type.
#[derive(Debug, Clone)]
pub enum Distribution {
    Sharding(Arc<dyn ShardingFunction>),
    Global(Vec<DataNode>),
    Normal(DataNode),
    Custom,
}

#[derive(Debug, Clone)]
pub struct LogicalTable {
    pub schema_name: String,
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub auto_increment: Option<String>,
    pub indexes: Vec<GlobalIndex>,
    /// Estimated rows, used by the cost model.
    pub row_count: f64,
    pub distribution: Distribution,
}

impl LogicalTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            schema_name: schema.into(),
            table_name: table.into(),
            columns,
            primary_key: Vec::new(),
            auto_increment: None,
            indexes: Vec::new(),
            row_count: 1000.0,
            distribution: Distribution::Custom,
        }
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_auto_increment(mut self, column: &str) -> Self {
        self.auto_increment = Some(column.to_string());
        self
    }

    pub fn with_index(mut self, name: &str, columns: &[&str]) -> Self {
        self.indexes.push(GlobalIndex {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn with_row_count(mut self, rows: f64) -> Self {
        self.row_count = rows;
        self
    }

    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn id(&self) -> TableId {
        TableId::new(self.schema_name.clone(), self.table_name.clone())
    }

    pub fn table_type(&self) -> TableType {
        match self.distribution {
            Distribution::Sharding(_) => TableType::Sharding,
            Distribution::Global(_) => TableType::Global,
            Distribution::Normal(_) => TableType::Normal,
            Distribution::Custom => TableType::Custom,
        }
    }

    /// Every data node holding rows or replicas of this table.
    pub fn all_data_nodes(&self) -> Vec<DataNode> {
        let mut nodes = match &self.distribution {
            Distribution::Sharding(f) => f.data_nodes().to_vec(),
            Distribution::Global(replicas) => replicas.clone(),
            Distribution::Normal(node) => vec![node.clone()],
            Distribution::Custom => Vec::new(),
        };
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn sharding_columns(&self) -> &[String] {
        match &self.distribution {
            Distribution::Sharding(f) => f.columns(),
            _ => &[],
        }
    }

    pub fn is_sharding_key(&self, column: &str) -> bool {
        match &self.distribution {
            Distribution::Sharding(f) => f.is_sharding_key(column),
            _ => false,
        }
    }

    /// Columns worth analyzing: sharding key, primary key and indexed columns.
    pub fn analyzable_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let candidates = self
            .sharding_columns()
            .iter()
            .chain(self.primary_key.iter())
            .chain(self.indexes.iter().flat_map(|i| i.columns.iter()));
        for c in candidates {
            if !out.iter().any(|o| o.eq_ignore_ascii_case(c)) {
                out.push(c.clone());
            }
        }
        out
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_indexed(&self, column: &str) -> bool {
        self.indexes
            .iter()
            .any(|i| i.columns.iter().any(|c| c.eq_ignore_ascii_case(column)))
    }

    /// Row type of a scan of this table under `qualifier`.
    pub fn row_schema(&self, qualifier: &str) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| Field {
                    qualifier: Some(qualifier.to_string()),
                    name: c.name.clone(),
                    data_type: c.data_type.clone(),
                    nullable: c.nullable,
                })
                .collect(),
        )
    }
}

/// Read-only view of the logical schema. Implementations must present a
/// consistent snapshot for the duration of one compilation.
pub trait Catalog: Send + Sync {
    fn get_table(&self, schema: &str, table: &str) -> Option<Arc<LogicalTable>>;
}

/// Source of auto-increment values for rows that omit them.
pub trait SequenceGenerator: Send + Sync {
    fn next_value(&self, table: &TableId) -> i64;
}

/// In-memory catalog for tests and embedding
#[derive(Debug, Default, Clone)]
pub struct MockCatalog {
    tables: HashMap<(String, String), Arc<LogicalTable>>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: LogicalTable) {
        let key = (
            table.schema_name.to_ascii_lowercase(),
            table.table_name.to_ascii_lowercase(),
        );
        self.tables.insert(key, Arc::new(table));
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<LogicalTable>> {
        self.tables.values()
    }
}

impl Catalog for MockCatalog {
    fn get_table(&self, schema: &str, table: &str) -> Option<Arc<LogicalTable>> {
        self.tables
            .get(&(schema.to_ascii_lowercase(), table.to_ascii_lowercase()))
            .cloned()
    }
}
