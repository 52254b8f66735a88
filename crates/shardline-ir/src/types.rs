//! Row types for Shardline plans

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    // Primitives
    Bool,
    Int32,
    Int64,
    Float64,
    Decimal { precision: u8, scale: u8 },

    // Text
    Text,
    Varchar(Option<u32>),

    // Binary
    Blob,

    // Temporal
    Date,
    Time,
    Timestamp,

    // Special
    Unknown,
}

impl DataType {
    /// Map a SQL type name from configuration to a data type.
    pub fn from_sql_name(name: &str) -> DataType {
        let lower = name.trim().to_ascii_lowercase();
        let (base, args) = match lower.find('(') {
            Some(pos) => (&lower[..pos], lower[pos + 1..].trim_end_matches(')')),
            None => (lower.as_str(), ""),
        };
        match base.trim() {
            "bool" | "boolean" => DataType::Bool,
            "int" | "integer" | "int4" | "smallint" | "tinyint" | "mediumint" => DataType::Int32,
            "bigint" | "int8" | "long" => DataType::Int64,
            "float" | "double" | "real" | "float8" => DataType::Float64,
            "decimal" | "numeric" => {
                let mut parts = args.split(',').map(|p| p.trim().parse::<u8>().ok());
                let precision = parts.next().flatten().unwrap_or(38);
                let scale = parts.next().flatten().unwrap_or(0);
                DataType::Decimal { precision, scale }
            }
            "text" | "string" | "char" | "longtext" => DataType::Text,
            "varchar" => DataType::Varchar(args.trim().parse().ok()),
            "blob" | "binary" | "varbinary" | "bytea" => DataType::Blob,
            "date" => DataType::Date,
            "time" => DataType::Time,
            "timestamp" | "datetime" => DataType::Timestamp,
            _ => DataType::Unknown,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int32 | DataType::Int64 | DataType::Float64 | DataType::Decimal { .. }
        )
    }

    /// Nominal width in bytes, used by the cost model.
    pub fn width(&self) -> f64 {
        match self {
            DataType::Bool => 1.0,
            DataType::Int32 | DataType::Date | DataType::Time => 4.0,
            DataType::Int64 | DataType::Float64 | DataType::Timestamp => 8.0,
            DataType::Decimal { .. } => 16.0,
            DataType::Varchar(Some(n)) => (*n as f64).min(64.0),
            DataType::Text | DataType::Varchar(None) | DataType::Blob | DataType::Unknown => 32.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Table name or alias the field is reachable through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    pub fn matches(&self, qualifier: Option<&str>, name: &str) -> bool {
        if !self.name.eq_ignore_ascii_case(name) {
            return false;
        }
        match (qualifier, &self.qualifier) {
            (None, _) => true,
            (Some(q), Some(own)) => own.eq_ignore_ascii_case(q),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("column not found: {0}")]
    NotFound(String),

    #[error("ambiguous column reference: {0}")]
    Ambiguous(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Position of a (possibly qualified) column; errors when absent or ambiguous.
    pub fn resolve(&self, qualifier: Option<&str>, name: &str) -> Result<usize, ResolveError> {
        let mut found = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.matches(qualifier, name))
            .map(|(i, _)| i);
        let display = match qualifier {
            Some(q) => format!("{}.{}", q, name),
            None => name.to_string(),
        };
        let first = found.next().ok_or_else(|| ResolveError::NotFound(display.clone()))?;
        if found.next().is_some() {
            return Err(ResolveError::Ambiguous(display));
        }
        Ok(first)
    }

    /// Concatenate two row types, as produced by a join.
    pub fn join(&self, other: &Schema) -> Schema {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        Schema { fields }
    }

    pub fn requalify(&self, qualifier: &str) -> Schema {
        Schema {
            fields: self
                .fields
                .iter()
                .map(|f| Field { qualifier: Some(qualifier.to_string()), ..f.clone() })
                .collect(),
        }
    }

    pub fn row_width(&self) -> f64 {
        self.fields.iter().map(|f| f.data_type.width()).sum::<f64>().max(1.0)
    }
}
