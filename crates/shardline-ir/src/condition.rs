//! Shard/index conditions extracted from predicates
//!
//! An [`IndexCondition`] only ever over-approximates the rows a predicate can
//! match: constraints that cannot be represented are dropped, which widens
//! routing but never excludes a data node that could hold a match.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Upper bound on enumerated key combinations before falling back to a broadcast.
pub const MAX_KEY_COMBINATIONS: usize = 1024;

/// A constant known at analysis time or a placeholder bound at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Operand {
    Literal(Value),
    Param(usize),
}

impl Operand {
    pub fn bind(&self, params: &[Value]) -> Option<Value> {
        match self {
            Operand::Literal(v) => Some(v.clone()),
            Operand::Param(i) => params.get(*i).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub value: Operand,
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KeyConstraint {
    /// Column equals one of the listed values.
    Points { values: Vec<Operand> },
    Range {
        lower: Option<Bound>,
        upper: Option<Bound>,
    },
}

impl KeyConstraint {
    pub fn point(value: Operand) -> Self {
        KeyConstraint::Points { values: vec![value] }
    }

    pub fn is_points(&self) -> bool {
        matches!(self, KeyConstraint::Points { .. })
    }

    /// Conjunction. Keeping either side is a superset of the intersection.
    fn and(self, other: KeyConstraint) -> KeyConstraint {
        match (self, other) {
            (points @ KeyConstraint::Points { .. }, _) => points,
            (KeyConstraint::Range { .. }, points @ KeyConstraint::Points { .. }) => points,
            (
                KeyConstraint::Range { lower, upper },
                KeyConstraint::Range { lower: other_lower, upper: other_upper },
            ) => KeyConstraint::Range {
                lower: lower.or(other_lower),
                upper: upper.or(other_upper),
            },
        }
    }

    /// Disjunction; only point lists can be unioned exactly.
    fn or(self, other: KeyConstraint) -> Option<KeyConstraint> {
        match (self, other) {
            (KeyConstraint::Points { mut values }, KeyConstraint::Points { values: more }) => {
                for v in more {
                    if !values.contains(&v) {
                        values.push(v);
                    }
                }
                Some(KeyConstraint::Points { values })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionKind {
    /// Every sharding column is pinned to a finite set of values.
    Point,
    /// Some sharding columns are constrained but not pinned.
    Range,
    /// Nothing usable; resolves to every data node.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCondition {
    pub kind: ConditionKind,
    /// Keyed by lower-cased column name.
    pub constraints: BTreeMap<String, KeyConstraint>,
}

impl Default for IndexCondition {
    fn default() -> Self {
        Self::unknown()
    }
}

impl IndexCondition {
    pub fn unknown() -> Self {
        Self {
            kind: ConditionKind::Unknown,
            constraints: BTreeMap::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.kind == ConditionKind::Unknown
    }

    pub fn constraint(&self, column: &str) -> Option<&KeyConstraint> {
        self.constraints.get(&column.to_ascii_lowercase())
    }

    /// Add a conjunct's constraint on `column`.
    pub fn and_constraint(&mut self, column: &str, constraint: KeyConstraint) {
        let key = column.to_ascii_lowercase();
        let merged = match self.constraints.remove(&key) {
            Some(existing) => existing.and(constraint),
            None => constraint,
        };
        self.constraints.insert(key, merged);
    }

    /// Union of two alternatives; columns not pinned on both sides are dropped.
    pub fn or(self, other: IndexCondition) -> IndexCondition {
        let mut other_constraints = other.constraints;
        let constraints = self
            .constraints
            .into_iter()
            .filter_map(|(column, c)| {
                let rhs = other_constraints.remove(&column)?;
                c.or(rhs).map(|merged| (column, merged))
            })
            .collect();
        IndexCondition {
            kind: ConditionKind::Unknown,
            constraints,
        }
    }

    /// Recompute `kind` against the table's sharding columns.
    pub fn classify(mut self, sharding_columns: &[String]) -> IndexCondition {
        let constrained: Vec<&KeyConstraint> = sharding_columns
            .iter()
            .filter_map(|c| self.constraint(c))
            .collect();
        self.kind = if sharding_columns.is_empty() || constrained.is_empty() {
            ConditionKind::Unknown
        } else if constrained.len() == sharding_columns.len()
            && constrained.iter().all(|c| c.is_points())
        {
            ConditionKind::Point
        } else {
            ConditionKind::Range
        };
        self
    }

    /// All listed columns pinned to point values.
    pub fn covers_columns(&self, columns: &[String]) -> bool {
        !columns.is_empty()
            && columns
                .iter()
                .all(|c| self.constraint(c).is_some_and(KeyConstraint::is_points))
    }

    /// Bind placeholders; constraints that cannot be bound are dropped.
    pub fn bind(&self, params: &[Value]) -> ShardingValues {
        let mut columns = BTreeMap::new();
        for (column, constraint) in &self.constraints {
            let bound = match constraint {
                KeyConstraint::Points { values } => values
                    .iter()
                    .map(|v| v.bind(params))
                    .collect::<Option<Vec<_>>>()
                    .map(ColumnValues::Points),
                KeyConstraint::Range { lower, upper } => {
                    let bind_bound = |b: &Option<Bound>| match b {
                        None => Some(None),
                        Some(b) => b.value.bind(params).map(|v| Some((v, b.inclusive))),
                    };
                    match (bind_bound(lower), bind_bound(upper)) {
                        (Some(lower), Some(upper)) => Some(ColumnValues::Range { lower, upper }),
                        (Some(lower), None) => Some(ColumnValues::Range { lower, upper: None }),
                        (None, Some(upper)) => Some(ColumnValues::Range { lower: None, upper }),
                        (None, None) => None,
                    }
                }
            };
            if let Some(values) = bound {
                columns.insert(column.clone(), values);
            }
        }
        ShardingValues { columns }
    }

    /// Primary-key tuples pinned by the condition, in `columns` order.
    pub fn primary_key_rows(&self, columns: &[String], params: &[Value]) -> Option<Vec<Vec<Value>>> {
        if !self.covers_columns(columns) {
            return None;
        }
        let bound = self.bind(params);
        let per_column = columns
            .iter()
            .map(|c| match bound.get(c) {
                Some(ColumnValues::Points(values)) => Some(values.clone()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        cartesian(&per_column, MAX_KEY_COMBINATIONS)
    }
}

/// Values a sharding function sees for each constrained column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Points(Vec<Value>),
    Range {
        lower: Option<(Value, bool)>,
        upper: Option<(Value, bool)>,
    },
}

impl ColumnValues {
    /// Whether `value` can satisfy this constraint. Incomparable values count as matches.
    pub fn admits(&self, value: &Value) -> bool {
        match self {
            ColumnValues::Points(values) => values
                .iter()
                .any(|v| v.compare(value).map_or(true, |o| o == Ordering::Equal)),
            ColumnValues::Range { lower, upper } => {
                let above = lower.as_ref().map_or(true, |(l, inclusive)| {
                    match value.compare(l) {
                        Some(Ordering::Greater) => true,
                        Some(Ordering::Equal) => *inclusive,
                        Some(Ordering::Less) => false,
                        None => true,
                    }
                });
                let below = upper.as_ref().map_or(true, |(u, inclusive)| {
                    match value.compare(u) {
                        Some(Ordering::Less) => true,
                        Some(Ordering::Equal) => *inclusive,
                        Some(Ordering::Greater) => false,
                        None => true,
                    }
                });
                above && below
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardingValues {
    pub columns: BTreeMap<String, ColumnValues>,
}

impl ShardingValues {
    /// Values of one concrete row.
    pub fn from_row<'a>(row: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Self {
            columns: row
                .into_iter()
                .map(|(c, v)| (c.to_ascii_lowercase(), ColumnValues::Points(vec![v])))
                .collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValues> {
        self.columns.get(&column.to_ascii_lowercase())
    }

    /// Every combination of point values over `columns`, `None` if any column
    /// is not pinned or the product is too large to enumerate.
    pub fn point_combinations(&self, columns: &[String]) -> Option<Vec<Vec<Value>>> {
        let per_column = columns
            .iter()
            .map(|c| match self.get(c) {
                Some(ColumnValues::Points(values)) if !values.is_empty() => Some(values.clone()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        cartesian(&per_column, MAX_KEY_COMBINATIONS)
    }
}

fn cartesian(per_column: &[Vec<Value>], limit: usize) -> Option<Vec<Vec<Value>>> {
    let total = per_column
        .iter()
        .try_fold(1usize, |acc, v| acc.checked_mul(v.len()))?;
    if total > limit {
        return None;
    }
    let mut rows: Vec<Vec<Value>> = vec![Vec::new()];
    for values in per_column {
        rows = rows
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut row = prefix.clone();
                    row.push(v.clone());
                    row
                })
            })
            .collect();
    }
    Some(rows)
}

/// Global secondary index able to serve a lookup in place of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProbe {
    pub index: String,
    pub columns: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_point_and_range() {
        let mut cond = IndexCondition::unknown();
        cond.and_constraint("Customer_Id", KeyConstraint::point(Operand::Param(0)));
        let cond = cond.classify(&cols(&["customer_id"]));
        assert_eq!(cond.kind, ConditionKind::Point);

        let mut partial = IndexCondition::unknown();
        partial.and_constraint("a", KeyConstraint::point(Operand::Literal(Value::Int(1))));
        assert_eq!(partial.classify(&cols(&["a", "b"])).kind, ConditionKind::Range);

        assert_eq!(IndexCondition::unknown().classify(&cols(&["a"])).kind, ConditionKind::Unknown);
    }

    #[test]
    fn test_or_drops_columns_not_on_both_sides() {
        let mut left = IndexCondition::unknown();
        left.and_constraint("a", KeyConstraint::point(Operand::Literal(Value::Int(1))));
        left.and_constraint("b", KeyConstraint::point(Operand::Literal(Value::Int(2))));
        let mut right = IndexCondition::unknown();
        right.and_constraint("a", KeyConstraint::point(Operand::Literal(Value::Int(3))));

        let merged = left.or(right).classify(&cols(&["a"]));
        assert_eq!(merged.kind, ConditionKind::Point);
        assert!(merged.constraint("b").is_none());
        assert_eq!(
            merged.constraint("a"),
            Some(&KeyConstraint::Points {
                values: vec![Operand::Literal(Value::Int(1)), Operand::Literal(Value::Int(3))]
            })
        );
    }

    #[test]
    fn test_bind_drops_missing_params() {
        let mut cond = IndexCondition::unknown();
        cond.and_constraint("a", KeyConstraint::point(Operand::Param(5)));
        cond.and_constraint("b", KeyConstraint::point(Operand::Param(0)));
        let bound = cond.bind(&[Value::Int(9)]);
        assert!(bound.get("a").is_none());
        assert_eq!(bound.get("b"), Some(&ColumnValues::Points(vec![Value::Int(9)])));
    }

    #[test]
    fn test_primary_key_rows() {
        let mut cond = IndexCondition::unknown();
        cond.and_constraint(
            "id",
            KeyConstraint::Points {
                values: vec![Operand::Param(0), Operand::Literal(Value::Int(7))],
            },
        );
        let rows = cond.primary_key_rows(&cols(&["id"]), &[Value::Int(3)]).unwrap();
        assert_eq!(rows, vec![vec![Value::Int(3)], vec![Value::Int(7)]]);
        assert!(cond.primary_key_rows(&cols(&["id", "other"]), &[]).is_none());
    }

    #[test]
    fn test_range_admits() {
        let range = ColumnValues::Range {
            lower: Some((Value::Int(100), true)),
            upper: Some((Value::Int(200), false)),
        };
        assert!(range.admits(&Value::Int(100)));
        assert!(!range.admits(&Value::Int(200)));
        assert!(!range.admits(&Value::Int(99)));
    }
}
