//! Relational plan tree
//!
//! Plans are immutable: every rewrite builds new nodes and shares untouched
//! subtrees through [`PlanRef`].

use crate::{BinOp, ColumnRef, DataType, Expr, Field, IndexCondition, IndexProbe, Schema, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type PlanRef = Arc<RelNode>;

/// Logical (schema, table) identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedExpr {
    pub expr: Expr,
    pub alias: String,
}

impl NamedExpr {
    pub fn new(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: alias.into(),
        }
    }

    /// Pass-through projection of an input field.
    pub fn field(field: &Field) -> Self {
        let col = match &field.qualifier {
            Some(q) => ColumnRef::qualified(q.clone(), field.name.clone()),
            None => ColumnRef::new(field.name.clone()),
        };
        Self {
            expr: Expr::Column { col },
            alias: field.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
}

impl JoinKind {
    pub fn sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
            JoinKind::Semi => "SEMI JOIN",
            JoinKind::Anti => "ANTI JOIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn from_name(name: &str) -> Option<AggFunc> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggFunc::Count),
            "sum" => Some(AggFunc::Sum),
            "avg" => Some(AggFunc::Avg),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggCall {
    pub func: AggFunc,
    /// Empty for `COUNT(*)`.
    pub args: Vec<Expr>,
    pub distinct: bool,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModifyOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

/// Relational operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rel")]
pub enum RelNode {
    TableScan {
        table: TableId,
        alias: String,
        schema: Schema,
    },
    Values {
        schema: Schema,
        rows: Vec<Vec<Expr>>,
    },
    Filter {
        input: PlanRef,
        predicate: Expr,
    },
    Project {
        input: PlanRef,
        exprs: Vec<NamedExpr>,
    },
    /// Filter followed by projection, the physical form of Filter/Project.
    Calc {
        input: PlanRef,
        exprs: Vec<NamedExpr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        condition: Option<Expr>,
    },
    Join {
        left: PlanRef,
        right: PlanRef,
        kind: JoinKind,
        condition: Expr,
    },
    /// Flattened inner joins awaiting ordering.
    MultiJoin {
        inputs: Vec<PlanRef>,
        condition: Expr,
    },
    Aggregate {
        input: PlanRef,
        group_by: Vec<Expr>,
        aggs: Vec<AggCall>,
    },
    Sort {
        input: PlanRef,
        keys: Vec<SortKey>,
        #[serde(skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fetch: Option<u64>,
    },
    Union {
        inputs: Vec<PlanRef>,
        all: bool,
    },
    TableModify {
        table: TableId,
        op: ModifyOp,
        input: PlanRef,
        assignments: Vec<Assignment>,
    },
    /// Fragment executable by data nodes, anchored on one distributed table.
    View {
        table: TableId,
        fragment: PlanRef,
        condition: IndexCondition,
        /// Every row the fragment can produce lives on one data node.
        single_node: bool,
        /// Index that could serve the view; annotation for explain, routing ignores it.
        #[serde(skip_serializing_if = "Option::is_none")]
        index_probe: Option<IndexProbe>,
    },
    /// A view routed to one data node with its rendered SQL.
    RoutedScan {
        target: String,
        sql: String,
        params: Vec<Value>,
        schema: Schema,
    },
    /// Union of the per-node results of a broadcast view.
    Gather {
        inputs: Vec<PlanRef>,
    },
    /// Materialized subtree shared by later [`RelNode::SpoolRef`] readers.
    Spool {
        id: usize,
        input: PlanRef,
    },
    SpoolRef {
        id: usize,
        schema: Schema,
    },
}

impl RelNode {
    pub fn into_ref(self) -> PlanRef {
        Arc::new(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelNode::TableScan { .. } => "TableScan",
            RelNode::Values { .. } => "Values",
            RelNode::Filter { .. } => "Filter",
            RelNode::Project { .. } => "Project",
            RelNode::Calc { .. } => "Calc",
            RelNode::Join { .. } => "Join",
            RelNode::MultiJoin { .. } => "MultiJoin",
            RelNode::Aggregate { .. } => "Aggregate",
            RelNode::Sort { .. } => "Sort",
            RelNode::Union { .. } => "Union",
            RelNode::TableModify { .. } => "TableModify",
            RelNode::View { .. } => "View",
            RelNode::RoutedScan { .. } => "RoutedScan",
            RelNode::Gather { .. } => "Gather",
            RelNode::Spool { .. } => "Spool",
            RelNode::SpoolRef { .. } => "SpoolRef",
        }
    }

    pub fn inputs(&self) -> Vec<&PlanRef> {
        match self {
            RelNode::TableScan { .. }
            | RelNode::Values { .. }
            | RelNode::View { .. }
            | RelNode::RoutedScan { .. }
            | RelNode::SpoolRef { .. } => vec![],
            RelNode::Filter { input, .. }
            | RelNode::Project { input, .. }
            | RelNode::Calc { input, .. }
            | RelNode::Aggregate { input, .. }
            | RelNode::Sort { input, .. }
            | RelNode::TableModify { input, .. }
            | RelNode::Spool { input, .. } => vec![input],
            RelNode::Join { left, right, .. } => vec![left, right],
            RelNode::MultiJoin { inputs, .. }
            | RelNode::Union { inputs, .. }
            | RelNode::Gather { inputs } => inputs.iter().collect(),
        }
    }

    /// Same operator over new inputs. `inputs` must match [`RelNode::inputs`] in arity.
    pub fn with_inputs(&self, mut inputs: Vec<PlanRef>) -> RelNode {
        let mut next = || inputs.remove(0);
        match self {
            RelNode::Filter { predicate, .. } => RelNode::Filter {
                input: next(),
                predicate: predicate.clone(),
            },
            RelNode::Project { exprs, .. } => RelNode::Project {
                input: next(),
                exprs: exprs.clone(),
            },
            RelNode::Calc { exprs, condition, .. } => RelNode::Calc {
                input: next(),
                exprs: exprs.clone(),
                condition: condition.clone(),
            },
            RelNode::Aggregate { group_by, aggs, .. } => RelNode::Aggregate {
                input: next(),
                group_by: group_by.clone(),
                aggs: aggs.clone(),
            },
            RelNode::Sort { keys, offset, fetch, .. } => RelNode::Sort {
                input: next(),
                keys: keys.clone(),
                offset: *offset,
                fetch: *fetch,
            },
            RelNode::TableModify { table, op, assignments, .. } => RelNode::TableModify {
                table: table.clone(),
                op: *op,
                input: next(),
                assignments: assignments.clone(),
            },
            RelNode::Spool { id, .. } => RelNode::Spool { id: *id, input: next() },
            RelNode::Join { kind, condition, .. } => {
                let left = next();
                let right = next();
                RelNode::Join {
                    left,
                    right,
                    kind: *kind,
                    condition: condition.clone(),
                }
            }
            RelNode::MultiJoin { condition, .. } => RelNode::MultiJoin {
                inputs,
                condition: condition.clone(),
            },
            RelNode::Union { all, .. } => RelNode::Union { inputs, all: *all },
            RelNode::Gather { .. } => RelNode::Gather { inputs },
            leaf => leaf.clone(),
        }
    }

    /// Output row type
    pub fn schema(&self) -> Schema {
        match self {
            RelNode::TableScan { schema, .. }
            | RelNode::Values { schema, .. }
            | RelNode::RoutedScan { schema, .. }
            | RelNode::SpoolRef { schema, .. } => schema.clone(),
            RelNode::Filter { input, .. }
            | RelNode::Sort { input, .. }
            | RelNode::Spool { input, .. } => input.schema(),
            RelNode::Project { input, exprs } | RelNode::Calc { input, exprs, .. } => {
                project_schema(&input.schema(), exprs)
            }
            RelNode::Join { left, right, kind, .. } => match kind {
                JoinKind::Semi | JoinKind::Anti => left.schema(),
                _ => left.schema().join(&right.schema()),
            },
            RelNode::MultiJoin { inputs, .. } => inputs
                .iter()
                .fold(Schema::empty(), |acc, input| acc.join(&input.schema())),
            RelNode::Aggregate { input, group_by, aggs } => {
                let input_schema = input.schema();
                let mut fields: Vec<Field> = group_by
                    .iter()
                    .map(|e| expr_field(e, &input_schema, None))
                    .collect();
                fields.extend(aggs.iter().map(|agg| {
                    let data_type = match agg.func {
                        AggFunc::Count => DataType::Int64,
                        AggFunc::Avg => DataType::Float64,
                        _ => agg
                            .args
                            .first()
                            .map(|a| infer_type(a, &input_schema))
                            .unwrap_or(DataType::Unknown),
                    };
                    Field::new(agg.alias.clone(), data_type)
                }));
                Schema::new(fields)
            }
            RelNode::Union { inputs, .. } | RelNode::Gather { inputs } => inputs
                .first()
                .map(|i| i.schema())
                .unwrap_or_default(),
            RelNode::TableModify { .. } => Schema::new(vec![Field {
                qualifier: None,
                name: "affected_rows".to_string(),
                data_type: DataType::Int64,
                nullable: false,
            }]),
            RelNode::View { fragment, .. } => fragment.schema(),
        }
    }

    /// Expressions held directly by this node.
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            RelNode::Values { rows, .. } => rows.iter().flatten().collect(),
            RelNode::Filter { predicate, .. } => vec![predicate],
            RelNode::Project { exprs, .. } => exprs.iter().map(|e| &e.expr).collect(),
            RelNode::Calc { exprs, condition, .. } => exprs
                .iter()
                .map(|e| &e.expr)
                .chain(condition.iter())
                .collect(),
            RelNode::Join { condition, .. } | RelNode::MultiJoin { condition, .. } => vec![condition],
            RelNode::Aggregate { group_by, aggs, .. } => group_by
                .iter()
                .chain(aggs.iter().flat_map(|a| a.args.iter()))
                .collect(),
            RelNode::Sort { keys, .. } => keys.iter().map(|k| &k.expr).collect(),
            RelNode::TableModify { assignments, .. } => assignments.iter().map(|a| &a.value).collect(),
            _ => vec![],
        }
    }

    /// Highest placeholder index referenced anywhere in the plan.
    pub fn max_param(&self) -> Option<usize> {
        let own = self.expressions().into_iter().filter_map(Expr::max_param).max();
        let nested = match self {
            RelNode::View { fragment, .. } => fragment.max_param(),
            _ => None,
        };
        self.inputs()
            .into_iter()
            .filter_map(|i| i.max_param())
            .chain(own)
            .chain(nested)
            .max()
    }

    pub fn count_joins(&self) -> usize {
        let own = usize::from(matches!(self, RelNode::Join { .. }));
        own + self.inputs().into_iter().map(|i| i.count_joins()).sum::<usize>()
    }

    /// Does any node satisfy `pred`? Descends into view fragments.
    pub fn any(&self, pred: &dyn Fn(&RelNode) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        if let RelNode::View { fragment, .. } = self {
            if fragment.any(pred) {
                return true;
            }
        }
        self.inputs().into_iter().any(|i| i.any(pred))
    }

    /// Tables scanned by this subtree, in scan order.
    pub fn tables(&self) -> Vec<TableId> {
        let mut out = Vec::new();
        fn collect(node: &RelNode, out: &mut Vec<TableId>) {
            match node {
                RelNode::TableScan { table, .. } => out.push(table.clone()),
                RelNode::View { fragment, .. } => collect(fragment, out),
                _ => {}
            }
            for input in node.inputs() {
                collect(input, out);
            }
        }
        collect(self, &mut out);
        out
    }
}

/// Bottom-up rewrite. Returning `None` keeps a node; subtrees whose inputs
/// did not change are shared rather than copied.
pub fn transform_up(plan: &PlanRef, f: &mut dyn FnMut(&PlanRef) -> Option<PlanRef>) -> PlanRef {
    let inputs = plan.inputs();
    let current = if inputs.is_empty() {
        plan.clone()
    } else {
        let new_inputs: Vec<PlanRef> = inputs.iter().map(|i| transform_up(i, f)).collect();
        let unchanged = new_inputs
            .iter()
            .zip(inputs.iter())
            .all(|(new, old)| Arc::ptr_eq(new, old));
        if unchanged {
            plan.clone()
        } else {
            Arc::new(plan.with_inputs(new_inputs))
        }
    };
    f(&current).unwrap_or(current)
}

/// Top-down rewrite: `f` sees a node before its inputs.
pub fn transform_down(plan: &PlanRef, f: &mut dyn FnMut(&PlanRef) -> Option<PlanRef>) -> PlanRef {
    let current = f(plan).unwrap_or_else(|| plan.clone());
    let inputs = current.inputs();
    if inputs.is_empty() {
        return current;
    }
    let new_inputs: Vec<PlanRef> = inputs.iter().map(|i| transform_down(i, f)).collect();
    if new_inputs.iter().zip(inputs.iter()).all(|(n, o)| Arc::ptr_eq(n, o)) {
        current
    } else {
        Arc::new(current.with_inputs(new_inputs))
    }
}

fn project_schema(input: &Schema, exprs: &[NamedExpr]) -> Schema {
    Schema::new(
        exprs
            .iter()
            .map(|e| expr_field(&e.expr, input, Some(&e.alias)))
            .collect(),
    )
}

fn expr_field(expr: &Expr, input: &Schema, alias: Option<&str>) -> Field {
    if let Expr::Column { col } = expr {
        if let Ok(idx) = input.resolve(col.table.as_deref(), &col.column) {
            let source = &input.fields[idx];
            let keeps_name = alias.map_or(true, |a| a.eq_ignore_ascii_case(&source.name));
            return Field {
                qualifier: if keeps_name { source.qualifier.clone() } else { None },
                name: alias.unwrap_or(&source.name).to_string(),
                data_type: source.data_type.clone(),
                nullable: source.nullable,
            };
        }
    }
    Field::new(
        alias.map(str::to_string).unwrap_or_else(|| expr.to_string()),
        infer_type(expr, input),
    )
}

/// Best-effort result type of an expression over an input row.
pub fn infer_type(expr: &Expr, input: &Schema) -> DataType {
    match expr {
        Expr::Literal { value } => value.data_type(),
        Expr::Column { col } => input
            .resolve(col.table.as_deref(), &col.column)
            .map(|i| input.fields[i].data_type.clone())
            .unwrap_or(DataType::Unknown),
        Expr::BinaryOp { op, left, .. } => match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Mod => infer_type(left, input),
            BinOp::Div => DataType::Float64,
            _ => DataType::Bool,
        },
        Expr::UnaryOp { expr, .. } => infer_type(expr, input),
        Expr::InList { .. }
        | Expr::Between { .. }
        | Expr::IsNull { .. }
        | Expr::Exists { .. }
        | Expr::InSubquery { .. } => DataType::Bool,
        Expr::ScalarSubquery { subquery } => subquery
            .schema()
            .fields
            .first()
            .map(|f| f.data_type.clone())
            .unwrap_or(DataType::Unknown),
        _ => DataType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{col, eq, lit};

    fn scan(table: &str) -> PlanRef {
        RelNode::TableScan {
            table: TableId::new("db", table),
            alias: table.to_string(),
            schema: Schema::new(vec![
                Field::new("id", DataType::Int64).with_qualifier(table),
                Field::new("name", DataType::Text).with_qualifier(table),
            ]),
        }
        .into_ref()
    }

    #[test]
    fn test_transform_shares_untouched_subtrees() {
        let left = scan("a");
        let right = RelNode::Filter {
            input: scan("b"),
            predicate: eq(col("id"), lit(1)),
        }
        .into_ref();
        let join = RelNode::Join {
            left: left.clone(),
            right,
            kind: JoinKind::Inner,
            condition: Expr::Literal { value: Value::Bool(true) },
        }
        .into_ref();

        let rewritten = transform_up(&join, &mut |node| match node.as_ref() {
            RelNode::Filter { input, .. } => Some(input.clone()),
            _ => None,
        });

        let RelNode::Join { left: new_left, right: new_right, .. } = rewritten.as_ref() else {
            panic!("expected join");
        };
        assert!(Arc::ptr_eq(new_left, &left));
        assert_eq!(new_right.name(), "TableScan");
        // The original tree is untouched
        assert_eq!(join.count_joins(), 1);
        assert!(join.any(&|n| matches!(n, RelNode::Filter { .. })));
    }

    #[test]
    fn test_semi_join_keeps_left_schema() {
        let join = RelNode::Join {
            left: scan("a"),
            right: scan("b"),
            kind: JoinKind::Semi,
            condition: eq(crate::qcol("a", "id"), crate::qcol("b", "id")),
        };
        assert_eq!(join.schema().len(), 2);
    }

    #[test]
    fn test_plan_json_round_trip() {
        let plan = RelNode::Sort {
            input: RelNode::Project {
                input: scan("a"),
                exprs: vec![NamedExpr::new(col("name"), "name")],
            }
            .into_ref(),
            keys: vec![SortKey { expr: col("name"), descending: true }],
            offset: None,
            fetch: Some(10),
        };
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: RelNode = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, parsed);
        assert_eq!(parsed.schema().fields[0].qualifier.as_deref(), Some("a"));
    }

    #[test]
    fn test_modify_plan_keeps_its_op_in_json() {
        let plan = RelNode::TableModify {
            table: TableId::new("db", "a"),
            op: ModifyOp::Update,
            input: scan("a"),
            assignments: vec![Assignment {
                column: "name".into(),
                value: lit("x"),
            }],
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["rel"], "TableModify");
        assert_eq!(json["op"], "Update");
        let parsed: RelNode = serde_json::from_value(json).unwrap();
        assert_eq!(plan, parsed);
    }
}
