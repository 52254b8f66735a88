//! Sharding function registry
//!
//! Sharding functions are named and built from serde specs, so topology
//! configuration can refer to them by name.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shardline_ir::{ColumnValues, DataNode, ShardingFunction, ShardingValues, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Sharding function not found: {0}")]
    FunctionNotFound(String),

    #[error("Invalid sharding rule for {function}: {reason}")]
    InvalidRule { function: String, reason: String },
}

/// Inclusive key range owned by the node at `node` (index into the node list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub start: i64,
    pub end: i64,
    pub node: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingRuleSpec {
    pub function: String,
    pub columns: Vec<String>,
    pub nodes: Vec<DataNode>,
    #[serde(default)]
    pub ranges: Vec<RangeSpec>,
}

pub type Constructor = fn(&ShardingRuleSpec) -> Result<Arc<dyn ShardingFunction>, RegistryError>;

pub struct ShardingFunctionRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ShardingFunctionRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        self.register("hash_mod", |spec| Ok(Arc::new(HashModSharding::from_spec(spec)?)));
        self.register("range", |spec| Ok(Arc::new(RangeSharding::from_spec(spec)?)));
    }

    pub fn register(&mut self, name: &str, constructor: Constructor) {
        self.constructors.insert(name.to_ascii_lowercase(), constructor);
    }

    pub fn build(&self, spec: &ShardingRuleSpec) -> Result<Arc<dyn ShardingFunction>, RegistryError> {
        let constructor = self
            .constructors
            .get(&spec.function.to_ascii_lowercase())
            .ok_or_else(|| RegistryError::FunctionNotFound(spec.function.clone()))?;
        constructor(spec)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ShardingFunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(spec: &ShardingRuleSpec, reason: impl Into<String>) -> RegistryError {
    RegistryError::InvalidRule {
        function: spec.function.clone(),
        reason: reason.into(),
    }
}

fn validate_common(spec: &ShardingRuleSpec) -> Result<(), RegistryError> {
    validate_shape(&spec.function, &spec.columns, &spec.nodes)
}

fn validate_shape(function: &str, columns: &[String], nodes: &[DataNode]) -> Result<(), RegistryError> {
    let reason = if columns.is_empty() {
        "at least one sharding column is required"
    } else if nodes.is_empty() {
        "at least one data node is required"
    } else {
        return Ok(());
    };
    Err(RegistryError::InvalidRule {
        function: function.to_string(),
        reason: reason.to_string(),
    })
}

fn sorted(nodes: impl IntoIterator<Item = DataNode>) -> Vec<DataNode> {
    nodes.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Row goes to `nodes[key mod n]`. Integer keys use their value, anything else
/// a SHA-256 of its literal rendering.
#[derive(Debug, Clone)]
pub struct HashModSharding {
    columns: Vec<String>,
    nodes: Vec<DataNode>,
}

impl HashModSharding {
    pub fn new(columns: Vec<String>, nodes: Vec<DataNode>) -> Result<Self, RegistryError> {
        validate_shape("hash_mod", &columns, &nodes)?;
        Ok(Self { columns, nodes })
    }

    pub fn from_spec(spec: &ShardingRuleSpec) -> Result<Self, RegistryError> {
        validate_common(spec)?;
        Self::new(spec.columns.clone(), spec.nodes.clone())
    }

    fn bucket(&self, key: &[Value]) -> usize {
        let n = self.nodes.len() as u64;
        if let [single] = key {
            if let Some(i) = single.as_i64() {
                return i.rem_euclid(n as i64) as usize;
            }
        }
        let mut hasher = Sha256::new();
        for v in key {
            hasher.update(v.to_sql_literal().as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % n) as usize
    }
}

impl ShardingFunction for HashModSharding {
    fn name(&self) -> &str {
        "hash_mod"
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn data_nodes(&self) -> &[DataNode] {
        &self.nodes
    }

    fn calculate(&self, values: &ShardingValues) -> Vec<DataNode> {
        match values.point_combinations(&self.columns) {
            Some(keys) => sorted(keys.iter().map(|k| self.nodes[self.bucket(k)].clone())),
            None => sorted(self.nodes.iter().cloned()),
        }
    }

    fn maps_key_to_one_node(&self) -> bool {
        true
    }

    fn placement(&self) -> Option<String> {
        let targets: Vec<&str> = self.nodes.iter().map(|n| n.target.as_str()).collect();
        Some(format!("hash_mod/{}:{}", self.columns.len(), targets.join(",")))
    }
}

/// Integer key ranges mapped to nodes. Keys outside every range may be
/// anywhere and route to all nodes.
#[derive(Debug, Clone)]
pub struct RangeSharding {
    columns: Vec<String>,
    nodes: Vec<DataNode>,
    ranges: Vec<RangeSpec>,
}

impl RangeSharding {
    pub fn from_spec(spec: &ShardingRuleSpec) -> Result<Self, RegistryError> {
        validate_common(spec)?;
        if spec.columns.len() != 1 {
            return Err(invalid(spec, "range sharding takes exactly one column"));
        }
        if spec.ranges.is_empty() {
            return Err(invalid(spec, "no ranges configured"));
        }
        for range in &spec.ranges {
            if range.node >= spec.nodes.len() {
                return Err(invalid(spec, format!("range points at missing node {}", range.node)));
            }
            if range.start > range.end {
                return Err(invalid(spec, format!("empty range {}..={}", range.start, range.end)));
            }
        }
        Ok(Self {
            columns: spec.columns.clone(),
            nodes: spec.nodes.clone(),
            ranges: spec.ranges.clone(),
        })
    }

    fn node_for(&self, key: i64) -> Option<&DataNode> {
        self.ranges
            .iter()
            .find(|r| r.start <= key && key <= r.end)
            .map(|r| &self.nodes[r.node])
    }

    fn all(&self) -> Vec<DataNode> {
        sorted(self.nodes.iter().cloned())
    }

    fn overlapping(&self, lower: Option<i64>, upper: Option<i64>) -> Vec<DataNode> {
        // Keys outside the configured ranges are unplaced.
        let min = self.ranges.iter().map(|r| r.start).min().unwrap_or(i64::MIN);
        let max = self.ranges.iter().map(|r| r.end).max().unwrap_or(i64::MAX);
        if lower.map_or(true, |l| l < min) || upper.map_or(true, |u| u > max) {
            return self.all();
        }
        let (lo, hi) = (lower.unwrap_or(i64::MIN), upper.unwrap_or(i64::MAX));
        let hit: Vec<DataNode> = self
            .ranges
            .iter()
            .filter(|r| r.start <= hi && lo <= r.end)
            .map(|r| self.nodes[r.node].clone())
            .collect();
        // A gap between ranges can hold unplaced keys too.
        let covered: i128 = self
            .ranges
            .iter()
            .filter(|r| r.start <= hi && lo <= r.end)
            .map(|r| (r.end.min(hi) as i128) - (r.start.max(lo) as i128) + 1)
            .sum();
        if covered < (hi as i128) - (lo as i128) + 1 {
            return self.all();
        }
        sorted(hit)
    }
}

impl ShardingFunction for RangeSharding {
    fn name(&self) -> &str {
        "range"
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn data_nodes(&self) -> &[DataNode] {
        &self.nodes
    }

    fn calculate(&self, values: &ShardingValues) -> Vec<DataNode> {
        match values.get(&self.columns[0]) {
            Some(ColumnValues::Points(points)) => {
                let mut out = Vec::with_capacity(points.len());
                for value in points {
                    match value.as_i64().and_then(|k| self.node_for(k)) {
                        Some(node) => out.push(node.clone()),
                        None => return self.all(),
                    }
                }
                sorted(out)
            }
            Some(ColumnValues::Range { lower, upper }) => {
                let bound = |b: &Option<(Value, bool)>, step: i64| -> Result<Option<i64>, ()> {
                    match b {
                        None => Ok(None),
                        Some((v, inclusive)) => {
                            let k = v.as_i64().ok_or(())?;
                            Ok(Some(if *inclusive { k } else { k.saturating_add(step) }))
                        }
                    }
                };
                match (bound(lower, 1), bound(upper, -1)) {
                    (Ok(lo), Ok(hi)) => self.overlapping(lo, hi),
                    _ => self.all(),
                }
            }
            None => self.all(),
        }
    }

    fn placement(&self) -> Option<String> {
        let ranges: Vec<String> = self
            .ranges
            .iter()
            .map(|r| format!("{}-{}@{}", r.start, r.end, self.nodes[r.node].target))
            .collect();
        Some(format!("range:{}", ranges.join(",")))
    }
}
