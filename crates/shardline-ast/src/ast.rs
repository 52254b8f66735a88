//! AST types for parsed SQL statements
//!
//! Statements are plain values. Nothing here is mutated once built:
//! per-node variants come from [`crate::Substitution`].

use serde::{Deserialize, Serialize};
pub use shardline_ir::{BinOp, JoinKind, UnOp, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self { schema: None, name: name.into() }
    }

    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Select {
    pub distinct: bool,
    pub projection: Vec<SelectItem>,
    pub from: Vec<FromItem>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Further `UNION [ALL]` branches.
    pub unions: Vec<UnionBranch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionBranch {
    pub all: bool,
    pub select: Select,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectItem {
    Wildcard,
    QualifiedWildcard(String),
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FromItem {
    Table {
        name: TableName,
        alias: Option<String>,
    },
    Join {
        left: Box<FromItem>,
        right: Box<FromItem>,
        kind: JoinKind,
        on: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    pub table: TableName,
    /// Empty when the statement omits its column list.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub table: TableName,
    pub assignments: Vec<Assignment>,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub table: TableName,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Possibly qualified name: `col`, `t.col` or `schema.t.col`.
    Identifier(Vec<String>),
    Literal(Value),
    /// Positional `?`, numbered from 0 in textual order.
    Placeholder(usize),
    Binary { left: Box<Expr>, op: BinOp, right: Box<Expr> },
    Unary { op: UnOp, expr: Box<Expr> },
    Function { name: String, args: Vec<Expr>, distinct: bool },
    /// `*` argument of `COUNT(*)`.
    Wildcard,
    InList { expr: Box<Expr>, list: Vec<Expr>, negated: bool },
    Between { expr: Box<Expr>, low: Box<Expr>, high: Box<Expr>, negated: bool },
    IsNull { expr: Box<Expr>, negated: bool },
    Exists { subquery: Box<Select>, negated: bool },
    InSubquery { expr: Box<Expr>, subquery: Box<Select>, negated: bool },
    Subquery(Box<Select>),
    Nested(Box<Expr>),
}

impl Expr {
    pub fn ident(name: &str) -> Expr {
        Expr::Identifier(name.split('.').map(str::to_string).collect())
    }

    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn placeholder(index: usize) -> Expr {
        Expr::Placeholder(index)
    }

    pub fn binary(self, op: BinOp, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    pub fn equals(self, right: Expr) -> Expr {
        self.binary(BinOp::Eq, right)
    }

    pub fn gt(self, right: Expr) -> Expr {
        self.binary(BinOp::Gt, right)
    }

    pub fn lt(self, right: Expr) -> Expr {
        self.binary(BinOp::Lt, right)
    }

    pub fn and(self, right: Expr) -> Expr {
        self.binary(BinOp::And, right)
    }

    pub fn or(self, right: Expr) -> Expr {
        self.binary(BinOp::Or, right)
    }

    pub fn in_list(self, list: Vec<Expr>) -> Expr {
        Expr::InList {
            expr: Box::new(self),
            list,
            negated: false,
        }
    }

    pub fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Function {
            name: name.to_string(),
            args,
            distinct: false,
        }
    }

    /// Children in textual order, not descending into subqueries.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Identifier(_)
            | Expr::Literal(_)
            | Expr::Placeholder(_)
            | Expr::Wildcard
            | Expr::Exists { .. }
            | Expr::Subquery(_) => vec![],
            Expr::Binary { left, right, .. } => vec![left, right],
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Nested(expr) => vec![expr],
            Expr::Function { args, .. } => args.iter().collect(),
            Expr::InList { expr, list, .. } => std::iter::once(expr.as_ref()).chain(list.iter()).collect(),
            Expr::Between { expr, low, high, .. } => vec![expr, low, high],
            Expr::InSubquery { expr, .. } => vec![expr],
        }
    }

    pub fn max_placeholder(&self) -> Option<usize> {
        let own = match self {
            Expr::Placeholder(i) => Some(*i),
            Expr::Exists { subquery, .. }
            | Expr::InSubquery { subquery, .. }
            | Expr::Subquery(subquery) => subquery.max_placeholder(),
            _ => None,
        };
        self.children()
            .into_iter()
            .filter_map(Expr::max_placeholder)
            .chain(own)
            .max()
    }

    pub fn is_aggregate_call(&self) -> bool {
        matches!(self, Expr::Function { name, .. } if shardline_ir::AggFunc::from_name(name).is_some())
    }
}

impl Select {
    pub fn from_table(table: TableName) -> Self {
        Self {
            projection: vec![SelectItem::Wildcard],
            from: vec![FromItem::Table { name: table, alias: None }],
            ..Default::default()
        }
    }

    pub fn project(mut self, items: Vec<SelectItem>) -> Self {
        self.projection = items;
        self
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.selection = Some(predicate);
        self
    }

    pub fn max_placeholder(&self) -> Option<usize> {
        let projection = self.projection.iter().filter_map(|item| match item {
            SelectItem::Expr { expr, .. } => expr.max_placeholder(),
            _ => None,
        });
        let joins = self.from.iter().filter_map(FromItem::max_placeholder);
        let clauses = self
            .selection
            .iter()
            .chain(self.group_by.iter())
            .chain(self.having.iter())
            .chain(self.order_by.iter().map(|o| &o.expr))
            .filter_map(Expr::max_placeholder);
        let unions = self.unions.iter().filter_map(|u| u.select.max_placeholder());
        projection.chain(joins).chain(clauses).chain(unions).max()
    }
}

impl SelectItem {
    pub fn expr(expr: Expr) -> Self {
        SelectItem::Expr { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: &str) -> Self {
        SelectItem::Expr {
            expr,
            alias: Some(alias.to_string()),
        }
    }
}

impl FromItem {
    pub fn table(name: TableName, alias: Option<&str>) -> Self {
        FromItem::Table {
            name,
            alias: alias.map(str::to_string),
        }
    }

    pub fn join(self, right: FromItem, kind: JoinKind, on: Expr) -> Self {
        FromItem::Join {
            left: Box::new(self),
            right: Box::new(right),
            kind,
            on: Some(on),
        }
    }

    fn max_placeholder(&self) -> Option<usize> {
        match self {
            FromItem::Table { .. } => None,
            FromItem::Join { left, right, on, .. } => [
                left.max_placeholder(),
                right.max_placeholder(),
                on.as_ref().and_then(Expr::max_placeholder),
            ]
            .into_iter()
            .flatten()
            .max(),
        }
    }
}

impl Statement {
    /// Highest placeholder index referenced anywhere in the statement.
    pub fn max_placeholder(&self) -> Option<usize> {
        match self {
            Statement::Select(select) => select.max_placeholder(),
            Statement::Insert(insert) => insert
                .rows
                .iter()
                .flatten()
                .filter_map(Expr::max_placeholder)
                .max(),
            Statement::Update(update) => update
                .assignments
                .iter()
                .map(|a| &a.value)
                .chain(update.selection.iter())
                .filter_map(Expr::max_placeholder)
                .max(),
            Statement::Delete(delete) => delete.selection.as_ref().and_then(Expr::max_placeholder),
        }
    }

    /// Target table of a DML statement.
    pub fn target_table(&self) -> Option<&TableName> {
        match self {
            Statement::Select(_) => None,
            Statement::Insert(insert) => Some(&insert.table),
            Statement::Update(update) => Some(&update.table),
            Statement::Delete(delete) => Some(&delete.table),
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Statement::Select(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_placeholder_reaches_subqueries() {
        let inner = Select::from_table(TableName::new("items")).filter(Expr::ident("qty").gt(Expr::placeholder(4)));
        let stmt = Statement::Delete(Delete {
            table: TableName::new("orders"),
            selection: Some(Expr::ident("id").equals(Expr::placeholder(1)).and(Expr::Exists {
                subquery: Box::new(inner),
                negated: false,
            })),
        });
        assert_eq!(stmt.max_placeholder(), Some(4));
    }

    #[test]
    fn test_insert_without_placeholders() {
        let stmt = Statement::Insert(Insert {
            table: TableName::new("t"),
            columns: vec![],
            rows: vec![vec![Expr::lit(1), Expr::lit("a")]],
        });
        assert_eq!(stmt.max_placeholder(), None);
    }
}
