//! SQL rendering with positional parameter re-binding

use crate::ast::*;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("No value bound for parameter {0}")]
    MissingParameter(usize),
}

#[derive(Debug, Clone, Copy)]
pub enum RenderMode<'a> {
    /// `?` per placeholder, values collected in textual order.
    Parameterized(&'a [Value]),
    /// Placeholders replaced by escaped literals.
    Inline(&'a [Value]),
    /// Every literal and placeholder replaced by `?`.
    Fingerprint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub sql: String,
    pub params: Vec<Value>,
}

pub fn render(stmt: &Statement, mode: RenderMode<'_>) -> Result<Rendered, RenderError> {
    let mut renderer = Renderer::new(mode);
    renderer.statement(stmt);
    renderer.finish()
}

pub fn render_select(select: &Select, mode: RenderMode<'_>) -> Result<Rendered, RenderError> {
    let mut renderer = Renderer::new(mode);
    renderer.select(select);
    renderer.finish()
}

impl Statement {
    /// Statement shape with literals and placeholders stripped.
    pub fn fingerprint_sql(&self) -> String {
        let mut renderer = Renderer::new(RenderMode::Fingerprint);
        renderer.statement(self);
        renderer.out
    }

    /// SHA-256 of [`Statement::fingerprint_sql`], the plan baseline key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.fingerprint_sql().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

struct Renderer<'a> {
    out: String,
    mode: RenderMode<'a>,
    params: Vec<Value>,
    missing: Option<usize>,
}

fn precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Or => 1,
        BinOp::And => 2,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Like => 3,
        BinOp::Add | BinOp::Sub => 4,
        BinOp::Mul | BinOp::Div | BinOp::Mod => 5,
    }
}

impl<'a> Renderer<'a> {
    fn new(mode: RenderMode<'a>) -> Self {
        Self {
            out: String::new(),
            mode,
            params: Vec::new(),
            missing: None,
        }
    }

    fn finish(self) -> Result<Rendered, RenderError> {
        match self.missing {
            Some(index) => Err(RenderError::MissingParameter(index)),
            None => Ok(Rendered {
                sql: self.out,
                params: self.params,
            }),
        }
    }

    fn push(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn list<T>(&mut self, items: &[T], mut each: impl FnMut(&mut Self, &T)) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            each(self, item);
        }
    }

    fn statement(&mut self, stmt: &Statement) {
        match stmt {
            Statement::Select(select) => self.select(select),
            Statement::Insert(insert) => self.insert(insert),
            Statement::Update(update) => self.update(update),
            Statement::Delete(delete) => self.delete(delete),
        }
    }

    fn table_name(&mut self, name: &TableName) {
        if let Some(schema) = &name.schema {
            self.push(schema);
            self.push(".");
        }
        self.push(&name.name);
    }

    fn select(&mut self, select: &Select) {
        self.push("SELECT ");
        if select.distinct {
            self.push("DISTINCT ");
        }
        self.list(&select.projection, |r, item| match item {
            SelectItem::Wildcard => r.push("*"),
            SelectItem::QualifiedWildcard(q) => {
                r.push(q);
                r.push(".*");
            }
            SelectItem::Expr { expr, alias } => {
                r.expr(expr);
                if let Some(alias) = alias {
                    r.push(" AS ");
                    r.push(alias);
                }
            }
        });
        if !select.from.is_empty() {
            self.push(" FROM ");
            self.list(&select.from, |r, item| r.from_item(item));
        }
        if let Some(selection) = &select.selection {
            self.push(" WHERE ");
            self.expr(selection);
        }
        if !select.group_by.is_empty() {
            self.push(" GROUP BY ");
            self.list(&select.group_by, |r, e| r.expr(e));
        }
        if let Some(having) = &select.having {
            self.push(" HAVING ");
            self.expr(having);
        }
        if !select.order_by.is_empty() {
            self.push(" ORDER BY ");
            self.list(&select.order_by, |r, o| {
                r.expr(&o.expr);
                if o.descending {
                    r.push(" DESC");
                }
            });
        }
        if let Some(limit) = select.limit {
            let _ = write!(self.out, " LIMIT {}", limit);
        }
        if let Some(offset) = select.offset {
            let _ = write!(self.out, " OFFSET {}", offset);
        }
        for branch in &select.unions {
            self.push(if branch.all { " UNION ALL " } else { " UNION " });
            self.select(&branch.select);
        }
    }

    fn from_item(&mut self, item: &FromItem) {
        match item {
            FromItem::Table { name, alias } => {
                self.table_name(name);
                if let Some(alias) = alias {
                    self.push(" AS ");
                    self.push(alias);
                }
            }
            FromItem::Join { left, right, kind, on } => {
                self.from_item(left);
                self.push(" ");
                self.push(kind.sql());
                self.push(" ");
                self.from_item(right);
                if let Some(on) = on {
                    self.push(" ON ");
                    self.expr(on);
                }
            }
        }
    }

    fn insert(&mut self, insert: &Insert) {
        self.push("INSERT INTO ");
        self.table_name(&insert.table);
        if !insert.columns.is_empty() {
            self.push(" (");
            self.list(&insert.columns, |r, c| r.push(c));
            self.push(")");
        }
        self.push(" VALUES ");
        self.list(&insert.rows, |r, row| {
            r.push("(");
            r.list(row, |r, e| r.expr(e));
            r.push(")");
        });
    }

    fn update(&mut self, update: &Update) {
        self.push("UPDATE ");
        self.table_name(&update.table);
        self.push(" SET ");
        self.list(&update.assignments, |r, a| {
            r.push(&a.column);
            r.push(" = ");
            r.expr(&a.value);
        });
        if let Some(selection) = &update.selection {
            self.push(" WHERE ");
            self.expr(selection);
        }
    }

    fn delete(&mut self, delete: &Delete) {
        self.push("DELETE FROM ");
        self.table_name(&delete.table);
        if let Some(selection) = &delete.selection {
            self.push(" WHERE ");
            self.expr(selection);
        }
    }

    fn literal(&mut self, value: &Value) {
        match self.mode {
            RenderMode::Fingerprint => self.push("?"),
            _ => {
                let text = value.to_sql_literal();
                self.push(&text);
            }
        }
    }

    fn placeholder(&mut self, index: usize) {
        match self.mode {
            RenderMode::Fingerprint => self.push("?"),
            RenderMode::Parameterized(values) => {
                self.push("?");
                match values.get(index) {
                    Some(v) => self.params.push(v.clone()),
                    None => {
                        self.missing.get_or_insert(index);
                    }
                }
            }
            RenderMode::Inline(values) => match values.get(index) {
                Some(v) => {
                    let text = v.to_sql_literal();
                    self.push(&text);
                }
                None => {
                    self.missing.get_or_insert(index);
                    self.push("?");
                }
            },
        }
    }

    fn operand(&mut self, expr: &Expr, parent: u8, right_side: bool) {
        let wrap = match expr {
            Expr::Binary { op, .. } => {
                let p = precedence(*op);
                p < parent || (right_side && p == parent)
            }
            _ => false,
        };
        if wrap {
            self.push("(");
            self.expr(expr);
            self.push(")");
        } else {
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Identifier(parts) => self.push(&parts.join(".")),
            Expr::Literal(value) => self.literal(value),
            Expr::Placeholder(index) => self.placeholder(*index),
            Expr::Binary { left, op, right } => {
                let p = precedence(*op);
                self.operand(left, p, false);
                self.push(" ");
                self.push(op.symbol());
                self.push(" ");
                self.operand(right, p, true);
            }
            Expr::Unary { op: UnOp::Not, expr } => {
                self.push("NOT ");
                self.operand(expr, 3, false);
            }
            Expr::Unary { op: UnOp::Neg, expr } => {
                self.push("-");
                self.operand(expr, 6, false);
            }
            Expr::Function { name, args, distinct } => {
                self.push(&name.to_ascii_uppercase());
                self.push("(");
                if *distinct {
                    self.push("DISTINCT ");
                }
                self.list(args, |r, a| r.expr(a));
                self.push(")");
            }
            Expr::Wildcard => self.push("*"),
            Expr::InList { expr, list, negated } => {
                self.operand(expr, 3, false);
                self.push(if *negated { " NOT IN (" } else { " IN (" });
                self.list(list, |r, e| r.expr(e));
                self.push(")");
            }
            Expr::Between { expr, low, high, negated } => {
                self.operand(expr, 3, false);
                self.push(if *negated { " NOT BETWEEN " } else { " BETWEEN " });
                self.operand(low, 3, false);
                self.push(" AND ");
                self.operand(high, 3, false);
            }
            Expr::IsNull { expr, negated } => {
                self.operand(expr, 3, false);
                self.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::Exists { subquery, negated } => {
                self.push(if *negated { "NOT EXISTS (" } else { "EXISTS (" });
                self.select(subquery);
                self.push(")");
            }
            Expr::InSubquery { expr, subquery, negated } => {
                self.operand(expr, 3, false);
                self.push(if *negated { " NOT IN (" } else { " IN (" });
                self.select(subquery);
                self.push(")");
            }
            Expr::Subquery(subquery) => {
                self.push("(");
                self.select(subquery);
                self.push(")");
            }
            Expr::Nested(inner) => {
                self.push("(");
                self.expr(inner);
                self.push(")");
            }
        }
    }
}
