//! Session and connection contracts

use crate::ExecError;
use indexmap::IndexMap;
use serde::Serialize;
use shardline_ir::Value;

/// Error raised by a backend driver.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub affected: u64,
    /// Key generated by the backend, if it reports one.
    pub last_insert_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Open connection to one data-node target. Dropping it releases it.
pub trait PhysicalConnection {
    fn execute_update(&mut self, sql: &str, params: &[Value]) -> Result<Outcome, BackendError>;

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, BackendError>;
}

/// Transaction context of one client request.
pub trait TransactionSession {
    fn transaction_id(&self) -> &str;

    fn get_connection(&self, target: &str) -> Result<Box<dyn PhysicalConnection + '_>, BackendError>;
}

/// Connections opened during one call, at most one per target. Everything is
/// released when the set is dropped, on success and on error alike.
pub struct ConnectionSet<'s> {
    session: &'s dyn TransactionSession,
    open: IndexMap<String, Box<dyn PhysicalConnection + 's>>,
}

impl<'s> ConnectionSet<'s> {
    pub fn new(session: &'s dyn TransactionSession) -> Self {
        Self {
            session,
            open: IndexMap::new(),
        }
    }

    pub fn get(&mut self, target: &str) -> Result<&mut (dyn PhysicalConnection + 's), ExecError> {
        if !self.open.contains_key(target) {
            let conn = self.session.get_connection(target).map_err(|source| ExecError::Connection {
                target: target.to_string(),
                source,
            })?;
            tracing::debug!(node = %target, "Opened connection");
            self.open.insert(target.to_string(), conn);
        }
        match self.open.get_mut(target) {
            Some(conn) => Ok(conn.as_mut()),
            None => Err(ExecError::Connection {
                target: target.to_string(),
                source: "connection vanished from set".into(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

impl Drop for ConnectionSet<'_> {
    fn drop(&mut self) {
        if !self.open.is_empty() {
            tracing::debug!(connections = self.open.len(), "Releasing connections");
        }
    }
}
