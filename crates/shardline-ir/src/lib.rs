//! Shardline Intermediate Representation (IR)
//!
//! Shared model for the sharding-aware compiler: scalar values, expressions,
//! row types, the relational plan tree and the catalog contract.
//! All types are deterministically serializable for caching and provenance.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

pub mod catalog;
pub mod condition;
pub mod plan;
mod types;

pub use catalog::*;
pub use condition::*;
pub use plan::*;
pub use types::*;

/// SHA-256 fingerprint of any serializable IR value.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Scalar value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view used by sharding functions. Numeric strings count.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Total order between comparable values, `None` across incompatible types.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Render as a SQL literal with quotes escaped.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => {
                let hex: String = b.iter().map(|byte| format!("{:02X}", byte)).collect();
                format!("X'{}'", hex)
            }
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Unknown,
            Value::Bool(_) => DataType::Bool,
            Value::Int(_) => DataType::Int64,
            Value::Float(_) => DataType::Float64,
            Value::String(_) => DataType::Text,
            Value::Bytes(_) => DataType::Blob,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql_literal())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => f.write_str(&self.column),
        }
    }
}

/// Expression types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Literal { value: Value },
    Column { col: ColumnRef },
    /// Reference to a column of an enclosing query (correlation).
    OuterColumn { col: ColumnRef },
    /// Positional placeholder, index into the logical parameter list.
    Param { index: usize },
    BinaryOp { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    UnaryOp { op: UnOp, expr: Box<Expr> },
    FuncCall { func: String, args: Vec<Expr> },
    InList { expr: Box<Expr>, list: Vec<Expr>, negated: bool },
    Between { expr: Box<Expr>, low: Box<Expr>, high: Box<Expr>, negated: bool },
    IsNull { expr: Box<Expr>, negated: bool },
    Exists { subquery: PlanRef, negated: bool },
    InSubquery { expr: Box<Expr>, subquery: PlanRef, negated: bool },
    ScalarSubquery { subquery: PlanRef },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    // Arithmetic
    Add, Sub, Mul, Div, Mod,
    // Comparison
    Eq, Ne, Lt, Le, Gt, Ge,
    // Logical
    And, Or,
    // String
    Like,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::Like => "LIKE",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }

    /// Operator with operands swapped: `a < b` becomes `b > a`.
    pub fn swap(&self) -> BinOp {
        match self {
            BinOp::Lt => BinOp::Gt,
            BinOp::Le => BinOp::Ge,
            BinOp::Gt => BinOp::Lt,
            BinOp::Ge => BinOp::Le,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

pub fn col(name: &str) -> Expr {
    Expr::Column { col: ColumnRef::new(name) }
}

pub fn qcol(table: &str, name: &str) -> Expr {
    Expr::Column { col: ColumnRef::qualified(table, name) }
}

pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal { value: value.into() }
}

pub fn param(index: usize) -> Expr {
    Expr::Param { index }
}

pub fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
    Expr::BinaryOp { op, left: Box::new(left), right: Box::new(right) }
}

pub fn eq(left: Expr, right: Expr) -> Expr {
    binary(left, BinOp::Eq, right)
}

pub fn and(left: Expr, right: Expr) -> Expr {
    binary(left, BinOp::And, right)
}

/// AND together a list of predicates, `None` when empty.
pub fn conjunction(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    exprs.into_iter().reduce(and)
}

impl Expr {
    pub fn is_true_literal(&self) -> bool {
        matches!(self, Expr::Literal { value: Value::Bool(true) })
    }

    pub fn is_false_literal(&self) -> bool {
        matches!(self, Expr::Literal { value: Value::Bool(false) })
    }

    /// Split a predicate on top-level ANDs.
    pub fn split_conjunction(&self) -> Vec<Expr> {
        let mut out = Vec::new();
        fn collect(expr: &Expr, out: &mut Vec<Expr>) {
            match expr {
                Expr::BinaryOp { op: BinOp::And, left, right } => {
                    collect(left, out);
                    collect(right, out);
                }
                other => out.push(other.clone()),
            }
        }
        collect(self, &mut out);
        out
    }

    /// Split a predicate on top-level ORs.
    pub fn split_disjunction(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        fn collect<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
            match expr {
                Expr::BinaryOp { op: BinOp::Or, left, right } => {
                    collect(left, out);
                    collect(right, out);
                }
                other => out.push(other),
            }
        }
        collect(self, &mut out);
        out
    }

    /// Direct children, not descending into subquery plans.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal { .. }
            | Expr::Column { .. }
            | Expr::OuterColumn { .. }
            | Expr::Param { .. }
            | Expr::Exists { .. }
            | Expr::ScalarSubquery { .. } => vec![],
            Expr::BinaryOp { left, right, .. } => vec![left, right],
            Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } => vec![expr],
            Expr::FuncCall { args, .. } => args.iter().collect(),
            Expr::InList { expr, list, .. } => {
                let mut out: Vec<&Expr> = vec![expr];
                out.extend(list.iter());
                out
            }
            Expr::Between { expr, low, high, .. } => vec![expr, low, high],
            Expr::InSubquery { expr, .. } => vec![expr],
        }
    }

    /// Column references in this expression, outside subqueries.
    pub fn column_refs(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        fn collect<'a>(expr: &'a Expr, out: &mut Vec<&'a ColumnRef>) {
            if let Expr::Column { col } = expr {
                out.push(col);
            }
            for child in expr.children() {
                collect(child, out);
            }
        }
        collect(self, &mut out);
        out
    }

    pub fn contains_subquery(&self) -> bool {
        matches!(
            self,
            Expr::Exists { .. } | Expr::InSubquery { .. } | Expr::ScalarSubquery { .. }
        ) || self.children().into_iter().any(Expr::contains_subquery)
    }

    pub fn contains_outer_ref(&self) -> bool {
        matches!(self, Expr::OuterColumn { .. })
            || self.children().into_iter().any(Expr::contains_outer_ref)
    }

    /// True when the expression only consists of literals and placeholders.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Literal { .. } | Expr::Param { .. } => true,
            Expr::Column { .. }
            | Expr::OuterColumn { .. }
            | Expr::Exists { .. }
            | Expr::InSubquery { .. }
            | Expr::ScalarSubquery { .. } => false,
            other => other.children().into_iter().all(Expr::is_constant),
        }
    }

    /// Highest placeholder index referenced, including inside subqueries.
    pub fn max_param(&self) -> Option<usize> {
        let own = match self {
            Expr::Param { index } => Some(*index),
            Expr::Exists { subquery, .. }
            | Expr::InSubquery { subquery, .. }
            | Expr::ScalarSubquery { subquery } => subquery.max_param(),
            _ => None,
        };
        self.children()
            .into_iter()
            .filter_map(Expr::max_param)
            .chain(own)
            .max()
    }

    /// Rebuild the expression bottom-up, replacing nodes for which `f` returns `Some`.
    pub fn transform(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
        let rebuilt = match self {
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: *op,
                left: Box::new(left.transform(f)),
                right: Box::new(right.transform(f)),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp { op: *op, expr: Box::new(expr.transform(f)) },
            Expr::FuncCall { func, args } => Expr::FuncCall {
                func: func.clone(),
                args: args.iter().map(|a| a.transform(f)).collect(),
            },
            Expr::InList { expr, list, negated } => Expr::InList {
                expr: Box::new(expr.transform(f)),
                list: list.iter().map(|e| e.transform(f)).collect(),
                negated: *negated,
            },
            Expr::Between { expr, low, high, negated } => Expr::Between {
                expr: Box::new(expr.transform(f)),
                low: Box::new(low.transform(f)),
                high: Box::new(high.transform(f)),
                negated: *negated,
            },
            Expr::IsNull { expr, negated } => Expr::IsNull { expr: Box::new(expr.transform(f)), negated: *negated },
            Expr::InSubquery { expr, subquery, negated } => Expr::InSubquery {
                expr: Box::new(expr.transform(f)),
                subquery: subquery.clone(),
                negated: *negated,
            },
            other => other.clone(),
        };
        f(&rebuilt).unwrap_or(rebuilt)
    }

    /// Replace column references, e.g. to strip or rename qualifiers.
    pub fn map_columns(&self, f: &mut dyn FnMut(&ColumnRef) -> Option<Expr>) -> Expr {
        self.transform(&mut |e| match e {
            Expr::Column { col } => f(col),
            _ => None,
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal { value } => write!(f, "{}", value),
            Expr::Column { col } => write!(f, "{}", col),
            Expr::OuterColumn { col } => write!(f, "$outer.{}", col),
            Expr::Param { index } => write!(f, "?{}", index),
            Expr::BinaryOp { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::UnaryOp { op: UnOp::Neg, expr } => write!(f, "-{}", expr),
            Expr::UnaryOp { op: UnOp::Not, expr } => write!(f, "NOT {}", expr),
            Expr::FuncCall { func, args } => {
                write!(f, "{}(", func)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::InList { expr, list, negated } => {
                write!(f, "{} {}IN (", expr, if *negated { "NOT " } else { "" })?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Expr::Between { expr, low, high, negated } => write!(
                f,
                "{} {}BETWEEN {} AND {}",
                expr,
                if *negated { "NOT " } else { "" },
                low,
                high
            ),
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::Exists { subquery, negated } => {
                write!(f, "{}EXISTS({})", if *negated { "NOT " } else { "" }, subquery.name())
            }
            Expr::InSubquery { expr, subquery, negated } => write!(
                f,
                "{} {}IN ({})",
                expr,
                if *negated { "NOT " } else { "" },
                subquery.name()
            ),
            Expr::ScalarSubquery { subquery } => write!(f, "$scalar({})", subquery.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let expr = eq(col("customer_id"), param(0));
        let copy = expr.clone();

        assert_eq!(fingerprint(&expr).unwrap(), fingerprint(&copy).unwrap());
        assert_ne!(
            fingerprint(&expr).unwrap(),
            fingerprint(&eq(col("customer_id"), param(1))).unwrap()
        );
    }

    #[test]
    fn test_json_round_trip() {
        let expr = and(
            eq(qcol("o", "customer_id"), lit(150)),
            Expr::InList {
                expr: Box::new(col("status")),
                list: vec![lit("NEW"), param(2)],
                negated: false,
            },
        );

        let json = serde_json::to_string(&expr).unwrap();
        let parsed: Expr = serde_json::from_str(&json).unwrap();

        assert_eq!(expr, parsed);
    }

    #[test]
    fn test_split_conjunction_flattens_nested_ands() {
        let expr = and(and(eq(col("a"), lit(1)), eq(col("b"), lit(2))), eq(col("c"), lit(3)));
        assert_eq!(expr.split_conjunction().len(), 3);
        assert_eq!(conjunction(expr.split_conjunction()), Some(expr));
    }

    #[test]
    fn test_max_param() {
        let expr = and(eq(col("a"), param(3)), Expr::Between {
            expr: Box::new(col("b")),
            low: Box::new(param(1)),
            high: Box::new(param(7)),
            negated: false,
        });
        assert_eq!(expr.max_param(), Some(7));
        assert_eq!(eq(col("a"), lit(1)).max_param(), None);
    }

    #[test]
    fn test_sql_literal_escaping() {
        assert_eq!(Value::from("O'Brien").to_sql_literal(), "'O''Brien'");
        assert_eq!(Value::Bytes(vec![0xAB, 0x01]).to_sql_literal(), "X'AB01'");
        assert_eq!(Value::Null.to_sql_literal(), "NULL");
    }

    #[test]
    fn test_value_compare_across_numeric_types() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
        assert_eq!(Value::from(" 42 ").as_i64(), Some(42));
    }
}
