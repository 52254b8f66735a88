//! Global secondary index service contract

use crate::session::BackendError;
use shardline_ir::{ModifyOp, Value};
use std::collections::BTreeMap;

/// Index entries to move after one physical write.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexUpdate {
    pub tx_id: String,
    pub schema: String,
    pub table: String,
    pub op: ModifyOp,
    pub changed_columns: BTreeMap<String, Value>,
    /// Primary keys as they were before the write.
    pub primary_keys: Vec<Vec<Value>>,
    pub target: String,
}

pub trait GsiService {
    fn update_by_primary_key(&self, update: &IndexUpdate) -> Result<(), BackendError>;
}
