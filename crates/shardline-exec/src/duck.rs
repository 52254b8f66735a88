//! DuckDB-backed data nodes: one in-memory database per target

use crate::session::{BackendError, Outcome, PhysicalConnection, Rows, TransactionSession};
use duckdb::types::{Value as DuckValue, ValueRef};
use duckdb::{params_from_iter, Connection};
use shardline_ir::Value;
use std::collections::HashMap;

pub struct DuckSession {
    tx_id: String,
    targets: HashMap<String, Connection>,
}

impl DuckSession {
    pub fn new(tx_id: impl Into<String>, targets: &[&str]) -> duckdb::Result<Self> {
        let mut map = HashMap::new();
        for target in targets {
            map.insert(target.to_string(), Connection::open_in_memory()?);
        }
        Ok(Self {
            tx_id: tx_id.into(),
            targets: map,
        })
    }

    /// Raw connection of a target, for schema setup.
    pub fn connection(&self, target: &str) -> Option<&Connection> {
        self.targets.get(target)
    }
}

impl TransactionSession for DuckSession {
    fn transaction_id(&self) -> &str {
        &self.tx_id
    }

    fn get_connection(&self, target: &str) -> Result<Box<dyn PhysicalConnection + '_>, BackendError> {
        let conn = self
            .targets
            .get(target)
            .ok_or_else(|| format!("unknown data node target {}", target))?;
        Ok(Box::new(DuckConnection { conn }))
    }
}

struct DuckConnection<'a> {
    conn: &'a Connection,
}

fn to_duck(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Int(i) => DuckValue::BigInt(*i),
        Value::Float(f) => DuckValue::Double(*f),
        Value::String(s) => DuckValue::Text(s.clone()),
        Value::Bytes(b) => DuckValue::Blob(b.clone()),
    }
}

fn from_duck(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Int(i.into()),
        ValueRef::SmallInt(i) => Value::Int(i.into()),
        ValueRef::Int(i) => Value::Int(i.into()),
        ValueRef::BigInt(i) => Value::Int(i),
        ValueRef::HugeInt(i) => i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64)),
        ValueRef::UTinyInt(i) => Value::Int(i.into()),
        ValueRef::USmallInt(i) => Value::Int(i.into()),
        ValueRef::UInt(i) => Value::Int(i.into()),
        ValueRef::UBigInt(i) => i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64)),
        ValueRef::Float(f) => Value::Float(f.into()),
        ValueRef::Double(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
        _ => Value::Null,
    }
}

impl PhysicalConnection for DuckConnection<'_> {
    fn execute_update(&mut self, sql: &str, params: &[Value]) -> Result<Outcome, BackendError> {
        let affected = self.conn.execute(sql, params_from_iter(params.iter().map(to_duck)))?;
        Ok(Outcome {
            affected: affected as u64,
            last_insert_id: None,
        })
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows, BackendError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut out = Vec::new();
        {
            let mut rows = stmt.query(params_from_iter(params.iter().map(to_duck)))?;
            while let Some(row) = rows.next()? {
                let width = row.as_ref().column_count();
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(from_duck(row.get_ref(i)?));
                }
                out.push(values);
            }
        }
        Ok(Rows {
            columns: stmt.column_names(),
            rows: out,
        })
    }
}
