//! Catalog built from the configured topology

use crate::config::{ConfigError, TableConfig, TopologyConfig};
use crate::EngineError;
use parking_lot::Mutex;
use shardline_ir::{Catalog, ColumnInfo, DataType, Distribution, LogicalTable, SequenceGenerator, TableId, TableType};
use shardline_registry::ShardingFunctionRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Immutable catalog of the tables declared in configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    tables: HashMap<(String, String), Arc<LogicalTable>>,
}

impl StaticCatalog {
    pub fn from_topology(topology: &TopologyConfig, registry: &ShardingFunctionRegistry) -> Result<Self, EngineError> {
        let mut tables = HashMap::new();
        for config in &topology.tables {
            let table = build_table(config, &topology.default_schema, registry)?;
            debug!(
                table = %table.id(),
                table_type = %table.table_type(),
                nodes = table.all_data_nodes().len(),
                "Registered table"
            );
            let key = (
                table.schema_name.to_ascii_lowercase(),
                table.table_name.to_ascii_lowercase(),
            );
            tables.insert(key, Arc::new(table));
        }
        Ok(Self { tables })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Catalog for StaticCatalog {
    fn get_table(&self, schema: &str, table: &str) -> Option<Arc<LogicalTable>> {
        self.tables
            .get(&(schema.to_ascii_lowercase(), table.to_ascii_lowercase()))
            .cloned()
    }
}

fn build_table(
    config: &TableConfig,
    default_schema: &str,
    registry: &ShardingFunctionRegistry,
) -> Result<LogicalTable, EngineError> {
    let schema = config.schema.as_deref().unwrap_or(default_schema);
    let invalid = |reason: &str| ConfigError::InvalidTable {
        table: format!("{}.{}", schema, config.name),
        reason: reason.to_string(),
    };

    let columns = config
        .columns
        .iter()
        .map(|c| ColumnInfo {
            nullable: c.nullable,
            ..ColumnInfo::new(c.name.clone(), DataType::from_sql_name(&c.data_type))
        })
        .collect();
    let mut table = LogicalTable::new(schema, config.name.clone(), columns);

    if !config.primary_key.is_empty() {
        let pk: Vec<&str> = config.primary_key.iter().map(String::as_str).collect();
        table = table.with_primary_key(&pk);
    }
    if let Some(column) = &config.auto_increment {
        table = table.with_auto_increment(column);
    }
    for index in &config.indexes {
        let columns: Vec<&str> = index.columns.iter().map(String::as_str).collect();
        table = table.with_index(&index.name, &columns);
    }
    if let Some(rows) = config.row_count {
        table = table.with_row_count(rows);
    }

    let distribution = match config.table_type {
        TableType::Sharding => {
            let spec = config.sharding.as_ref().ok_or_else(|| invalid("sharding table needs a sharding rule"))?;
            Distribution::Sharding(registry.build(spec)?)
        }
        TableType::Global => {
            if config.replicas.is_empty() {
                return Err(invalid("global table needs at least one replica").into());
            }
            Distribution::Global(config.replicas.clone())
        }
        TableType::Normal => Distribution::Normal(config.node.clone().ok_or_else(|| invalid("normal table needs a node"))?),
        TableType::Custom => Distribution::Custom,
    };
    Ok(table.with_distribution(distribution))
}

/// Per-table counters for generated keys, starting at 1.
#[derive(Debug, Default)]
pub struct InMemorySequence {
    next: Mutex<HashMap<TableId, i64>>,
}

impl InMemorySequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next value of `table` at least `value`.
    pub fn advance_to(&self, table: &TableId, value: i64) {
        let mut next = self.next.lock();
        let slot = next.entry(table.clone()).or_insert(1);
        *slot = (*slot).max(value);
    }
}

impl SequenceGenerator for InMemorySequence {
    fn next_value(&self, table: &TableId) -> i64 {
        let mut next = self.next.lock();
        let slot = next.entry(table.clone()).or_insert(1);
        let value = *slot;
        *slot += 1;
        value
    }
}
