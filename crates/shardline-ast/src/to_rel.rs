//! Validation pass: bind a parsed statement against the catalog and convert
//! it to a logical relational plan.

use crate::ast::{self, FromItem, SelectItem, Statement, TableName};
use shardline_ir::{
    self as ir, AggCall, AggFunc, Catalog, ColumnRef, Field, LogicalTable, ModifyOp, NamedExpr, PlanRef,
    RelNode, ResolveError, Schema, SortKey,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BindError {
    #[error("Unresolved table: {0}")]
    UnresolvedTable(String),

    #[error("Ambiguous column reference: {0}")]
    AmbiguousColumn(String),

    #[error("Unresolved column: {0}")]
    UnresolvedColumn(String),

    #[error("INSERT into {table} supplies {values} values for {columns} columns")]
    ColumnCountMismatch {
        table: String,
        values: usize,
        columns: usize,
    },

    #[error("Unsupported construct: {0}")]
    Unsupported(String),
}

/// Binds statements against one catalog snapshot.
pub struct Binder<'a> {
    catalog: &'a dyn Catalog,
    default_schema: String,
}

struct Scope<'s> {
    schema: &'s Schema,
    outer: &'s [Schema],
    /// Already-bound stand-ins for whole sub-expressions (aggregates, group keys).
    replacements: &'s [(ast::Expr, ir::Expr)],
}

impl<'s> Scope<'s> {
    fn plain(schema: &'s Schema, outer: &'s [Schema]) -> Self {
        Self {
            schema,
            outer,
            replacements: &[],
        }
    }
}

fn field_ref(field: &Field) -> ir::Expr {
    ir::Expr::Column {
        col: ColumnRef {
            table: field.qualifier.clone(),
            column: field.name.clone(),
        },
    }
}

fn column_error(err: ResolveError) -> BindError {
    match err {
        ResolveError::NotFound(name) => BindError::UnresolvedColumn(name),
        ResolveError::Ambiguous(name) => BindError::AmbiguousColumn(name),
    }
}

impl<'a> Binder<'a> {
    pub fn new(catalog: &'a dyn Catalog, default_schema: impl Into<String>) -> Self {
        Self {
            catalog,
            default_schema: default_schema.into(),
        }
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    pub fn resolve_table(&self, name: &TableName) -> Result<Arc<LogicalTable>, BindError> {
        let schema = name.schema.as_deref().unwrap_or(&self.default_schema);
        self.catalog.get_table(schema, &name.name).ok_or_else(|| {
            tracing::debug!(schema = %schema, table = %name.name, "Table not in catalog");
            BindError::UnresolvedTable(format!("{}.{}", schema, name.name))
        })
    }

    pub fn bind(&self, stmt: &Statement) -> Result<PlanRef, BindError> {
        match stmt {
            Statement::Select(select) => self.bind_query(select, &[]),
            Statement::Insert(insert) => self.bind_insert(insert),
            Statement::Update(update) => {
                let (table, scan) = self.scan(&update.table, None)?;
                let schema = scan.schema();
                let assignments = update
                    .assignments
                    .iter()
                    .map(|a| {
                        table
                            .column_index(&a.column)
                            .ok_or_else(|| BindError::UnresolvedColumn(a.column.clone()))?;
                        Ok(ir::Assignment {
                            column: a.column.clone(),
                            value: self.bind_expr(&a.value, &Scope::plain(&schema, &[]))?,
                        })
                    })
                    .collect::<Result<Vec<_>, BindError>>()?;
                let input = self.filtered(scan, update.selection.as_ref(), &[])?;
                Ok(RelNode::TableModify {
                    table: table.id(),
                    op: ModifyOp::Update,
                    input,
                    assignments,
                }
                .into_ref())
            }
            Statement::Delete(delete) => {
                let (table, scan) = self.scan(&delete.table, None)?;
                let input = self.filtered(scan, delete.selection.as_ref(), &[])?;
                Ok(RelNode::TableModify {
                    table: table.id(),
                    op: ModifyOp::Delete,
                    input,
                    assignments: vec![],
                }
                .into_ref())
            }
        }
    }

    fn scan(&self, name: &TableName, alias: Option<&str>) -> Result<(Arc<LogicalTable>, PlanRef), BindError> {
        let table = self.resolve_table(name)?;
        let alias = alias.unwrap_or(&name.name).to_string();
        let scan = RelNode::TableScan {
            table: table.id(),
            schema: table.row_schema(&alias),
            alias,
        }
        .into_ref();
        Ok((table, scan))
    }

    fn filtered(&self, input: PlanRef, predicate: Option<&ast::Expr>, outer: &[Schema]) -> Result<PlanRef, BindError> {
        match predicate {
            None => Ok(input),
            Some(predicate) => {
                let schema = input.schema();
                let predicate = self.bind_expr(predicate, &Scope::plain(&schema, outer))?;
                Ok(RelNode::Filter { input, predicate }.into_ref())
            }
        }
    }

    fn bind_insert(&self, insert: &ast::Insert) -> Result<PlanRef, BindError> {
        let table = self.resolve_table(&insert.table)?;
        let columns = insert_columns(&table, insert)?;
        let row_schema = table.row_schema(&table.table_name);
        let fields = columns
            .iter()
            .map(|c| {
                row_schema
                    .resolve(None, c)
                    .map(|i| row_schema.fields[i].clone())
                    .map_err(column_error)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let empty = Schema::empty();
        let rows = insert
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|e| self.bind_expr(e, &Scope::plain(&empty, &[])))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RelNode::TableModify {
            table: table.id(),
            op: ModifyOp::Insert,
            input: RelNode::Values {
                schema: Schema::new(fields),
                rows,
            }
            .into_ref(),
            assignments: vec![],
        }
        .into_ref())
    }

    fn bind_from(&self, item: &FromItem, outer: &[Schema]) -> Result<PlanRef, BindError> {
        match item {
            FromItem::Table { name, alias } => Ok(self.scan(name, alias.as_deref())?.1),
            FromItem::Join { left, right, kind, on } => {
                let left = self.bind_from(left, outer)?;
                let right = self.bind_from(right, outer)?;
                let joined = left.schema().join(&right.schema());
                let condition = match on {
                    Some(on) => self.bind_expr(on, &Scope::plain(&joined, outer))?,
                    None => ir::lit(true),
                };
                Ok(RelNode::Join {
                    left,
                    right,
                    kind: *kind,
                    condition,
                }
                .into_ref())
            }
        }
    }

    fn bind_query(&self, select: &ast::Select, outer: &[Schema]) -> Result<PlanRef, BindError> {
        let first = self.bind_select(select, outer)?;
        if select.unions.is_empty() {
            return Ok(first);
        }
        let mut inputs = vec![first];
        let mut all = true;
        for branch in &select.unions {
            inputs.push(self.bind_query(&branch.select, outer)?);
            all &= branch.all;
        }
        Ok(RelNode::Union { inputs, all }.into_ref())
    }

    fn bind_select(&self, select: &ast::Select, outer: &[Schema]) -> Result<PlanRef, BindError> {
        let mut input = match select.from.split_first() {
            None => RelNode::Values {
                schema: Schema::empty(),
                rows: vec![vec![]],
            }
            .into_ref(),
            Some((first, rest)) => {
                let mut plan = self.bind_from(first, outer)?;
                for item in rest {
                    plan = RelNode::Join {
                        left: plan,
                        right: self.bind_from(item, outer)?,
                        kind: ir::JoinKind::Inner,
                        condition: ir::lit(true),
                    }
                    .into_ref();
                }
                plan
            }
        };
        input = self.filtered(input, select.selection.as_ref(), outer)?;

        let mut agg_calls: Vec<&ast::Expr> = Vec::new();
        for item in &select.projection {
            if let SelectItem::Expr { expr, .. } = item {
                collect_aggregates(expr, &mut agg_calls);
            }
        }
        if let Some(having) = &select.having {
            collect_aggregates(having, &mut agg_calls);
        }

        let mut replacements: Vec<(ast::Expr, ir::Expr)> = Vec::new();
        if !agg_calls.is_empty() || !select.group_by.is_empty() {
            let input_schema = input.schema();
            let scope = Scope::plain(&input_schema, outer);
            let group_by = select
                .group_by
                .iter()
                .map(|g| self.bind_expr(g, &scope))
                .collect::<Result<Vec<_>, _>>()?;
            let mut aggs = Vec::with_capacity(agg_calls.len());
            for (i, call) in agg_calls.iter().enumerate() {
                let ast::Expr::Function { name, args, distinct } = call else {
                    continue;
                };
                let func = AggFunc::from_name(name).ok_or_else(|| BindError::Unsupported(name.clone()))?;
                let args = args
                    .iter()
                    .filter(|a| !matches!(a, ast::Expr::Wildcard))
                    .map(|a| self.bind_expr(a, &scope))
                    .collect::<Result<Vec<_>, _>>()?;
                let alias = format!("agg{}", i);
                replacements.push(((*call).clone(), ir::col(&alias)));
                aggs.push(AggCall {
                    func,
                    args,
                    distinct: *distinct,
                    alias,
                });
            }
            for (ast_key, bound) in select.group_by.iter().zip(group_by.iter()) {
                let stand_in = match bound {
                    ir::Expr::Column { .. } => bound.clone(),
                    other => ir::col(&other.to_string()),
                };
                replacements.push((ast_key.clone(), stand_in));
            }
            input = RelNode::Aggregate { input, group_by, aggs }.into_ref();
            if let Some(having) = &select.having {
                let schema = input.schema();
                let predicate = self.bind_expr(
                    having,
                    &Scope {
                        schema: &schema,
                        outer,
                        replacements: &replacements,
                    },
                )?;
                input = RelNode::Filter { input, predicate }.into_ref();
            }
        } else if select.having.is_some() {
            return Err(BindError::Unsupported("HAVING without aggregation".into()));
        }

        let input_schema = input.schema();
        let scope = Scope {
            schema: &input_schema,
            outer,
            replacements: &replacements,
        };
        let mut exprs = Vec::new();
        let mut projected: Vec<(ast::Expr, ir::Expr)> = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::Wildcard => exprs.extend(input_schema.fields.iter().map(NamedExpr::field)),
                SelectItem::QualifiedWildcard(q) => {
                    let before = exprs.len();
                    exprs.extend(
                        input_schema
                            .fields
                            .iter()
                            .filter(|f| f.qualifier.as_deref().is_some_and(|fq| fq.eq_ignore_ascii_case(q)))
                            .map(NamedExpr::field),
                    );
                    if exprs.len() == before {
                        return Err(BindError::UnresolvedTable(q.clone()));
                    }
                }
                SelectItem::Expr { expr, alias } => {
                    let bound = self.bind_expr(expr, &scope)?;
                    let alias = match (alias, &bound) {
                        (Some(alias), _) => alias.clone(),
                        (None, ir::Expr::Column { col }) => col.column.clone(),
                        (None, _) => expr_label(expr),
                    };
                    projected.push((expr.clone(), ir::col(&alias)));
                    exprs.push(NamedExpr::new(bound, alias));
                }
            }
        }
        let mut plan = RelNode::Project { input, exprs }.into_ref();

        if select.distinct {
            let group_by = plan.schema().fields.iter().map(field_ref).collect();
            plan = RelNode::Aggregate {
                input: plan,
                group_by,
                aggs: vec![],
            }
            .into_ref();
        }

        if !select.order_by.is_empty() || select.limit.is_some() || select.offset.is_some() {
            let output = plan.schema();
            let scope = Scope {
                schema: &output,
                outer,
                replacements: &projected,
            };
            let keys = select
                .order_by
                .iter()
                .map(|o| {
                    Ok(SortKey {
                        expr: self.bind_expr(&o.expr, &scope)?,
                        descending: o.descending,
                    })
                })
                .collect::<Result<Vec<_>, BindError>>()?;
            plan = RelNode::Sort {
                input: plan,
                keys,
                offset: select.offset,
                fetch: select.limit,
            }
            .into_ref();
        }
        Ok(plan)
    }

    fn bind_expr(&self, expr: &ast::Expr, scope: &Scope<'_>) -> Result<ir::Expr, BindError> {
        if let Some((_, bound)) = scope.replacements.iter().find(|(k, _)| k == expr) {
            return Ok(bound.clone());
        }
        let boxed = |e: &ast::Expr| self.bind_expr(e, scope).map(Box::new);
        Ok(match expr {
            ast::Expr::Identifier(parts) => self.bind_identifier(parts, scope)?,
            ast::Expr::Literal(value) => ir::Expr::Literal { value: value.clone() },
            ast::Expr::Placeholder(index) => ir::Expr::Param { index: *index },
            ast::Expr::Binary { left, op, right } => ir::Expr::BinaryOp {
                op: *op,
                left: boxed(left)?,
                right: boxed(right)?,
            },
            ast::Expr::Unary { op, expr } => ir::Expr::UnaryOp { op: *op, expr: boxed(expr)? },
            ast::Expr::Function { name, .. } if AggFunc::from_name(name).is_some() => {
                return Err(BindError::Unsupported(format!("aggregate {} in this clause", name)));
            }
            ast::Expr::Function { name, args, .. } => ir::Expr::FuncCall {
                func: name.to_ascii_lowercase(),
                args: args
                    .iter()
                    .map(|a| self.bind_expr(a, scope))
                    .collect::<Result<Vec<_>, _>>()?,
            },
            ast::Expr::Wildcard => return Err(BindError::Unsupported("bare *".into())),
            ast::Expr::InList { expr, list, negated } => ir::Expr::InList {
                expr: boxed(expr)?,
                list: list
                    .iter()
                    .map(|e| self.bind_expr(e, scope))
                    .collect::<Result<Vec<_>, _>>()?,
                negated: *negated,
            },
            ast::Expr::Between { expr, low, high, negated } => ir::Expr::Between {
                expr: boxed(expr)?,
                low: boxed(low)?,
                high: boxed(high)?,
                negated: *negated,
            },
            ast::Expr::IsNull { expr, negated } => ir::Expr::IsNull {
                expr: boxed(expr)?,
                negated: *negated,
            },
            ast::Expr::Exists { subquery, negated } => ir::Expr::Exists {
                subquery: self.bind_subquery(subquery, scope)?,
                negated: *negated,
            },
            ast::Expr::InSubquery { expr, subquery, negated } => ir::Expr::InSubquery {
                expr: boxed(expr)?,
                subquery: self.bind_subquery(subquery, scope)?,
                negated: *negated,
            },
            ast::Expr::Subquery(subquery) => ir::Expr::ScalarSubquery {
                subquery: self.bind_subquery(subquery, scope)?,
            },
            ast::Expr::Nested(inner) => self.bind_expr(inner, scope)?,
        })
    }

    fn bind_subquery(&self, select: &ast::Select, scope: &Scope<'_>) -> Result<PlanRef, BindError> {
        let mut outer = scope.outer.to_vec();
        outer.push(scope.schema.clone());
        self.bind_query(select, &outer)
    }

    fn bind_identifier(&self, parts: &[String], scope: &Scope<'_>) -> Result<ir::Expr, BindError> {
        let (qualifier, name) = match parts {
            [name] => (None, name.as_str()),
            [.., qualifier, name] => (Some(qualifier.as_str()), name.as_str()),
            [] => return Err(BindError::Unsupported("empty identifier".into())),
        };
        match scope.schema.resolve(qualifier, name) {
            Ok(i) => return Ok(field_ref(&scope.schema.fields[i])),
            Err(ResolveError::Ambiguous(n)) => return Err(BindError::AmbiguousColumn(n)),
            Err(ResolveError::NotFound(_)) => {}
        }
        // Correlated reference to an enclosing query
        for outer in scope.outer.iter().rev() {
            match outer.resolve(qualifier, name) {
                Ok(i) => {
                    let field = &outer.fields[i];
                    return Ok(ir::Expr::OuterColumn {
                        col: ColumnRef {
                            table: field.qualifier.clone(),
                            column: field.name.clone(),
                        },
                    });
                }
                Err(ResolveError::Ambiguous(n)) => return Err(BindError::AmbiguousColumn(n)),
                Err(ResolveError::NotFound(_)) => {}
            }
        }
        Err(BindError::UnresolvedColumn(parts.join(".")))
    }
}

/// Column list an INSERT writes, filling an omitted list from the table.
pub fn insert_columns(table: &LogicalTable, insert: &ast::Insert) -> Result<Vec<String>, BindError> {
    let width = insert.rows.first().map_or(0, Vec::len);
    let columns: Vec<String> = if !insert.columns.is_empty() {
        for c in &insert.columns {
            table
                .column_index(c)
                .ok_or_else(|| BindError::UnresolvedColumn(format!("{}.{}", table.table_name, c)))?;
        }
        insert.columns.clone()
    } else if width == table.columns.len() {
        table.columns.iter().map(|c| c.name.clone()).collect()
    } else {
        // The auto-increment column may be left out
        let without_auto: Vec<String> = table
            .columns
            .iter()
            .filter(|c| {
                table
                    .auto_increment
                    .as_ref()
                    .map_or(true, |auto| !auto.eq_ignore_ascii_case(&c.name))
            })
            .map(|c| c.name.clone())
            .collect();
        if table.auto_increment.is_none() || without_auto.len() != width {
            return Err(BindError::ColumnCountMismatch {
                table: table.table_name.clone(),
                values: width,
                columns: table.columns.len(),
            });
        }
        without_auto
    };
    if let Some(row) = insert.rows.iter().find(|r| r.len() != columns.len()) {
        return Err(BindError::ColumnCountMismatch {
            table: table.table_name.clone(),
            values: row.len(),
            columns: columns.len(),
        });
    }
    Ok(columns)
}

fn collect_aggregates<'e>(expr: &'e ast::Expr, out: &mut Vec<&'e ast::Expr>) {
    if expr.is_aggregate_call() {
        if !out.contains(&expr) {
            out.push(expr);
        }
        return;
    }
    for child in expr.children() {
        collect_aggregates(child, out);
    }
}

fn expr_label(expr: &ast::Expr) -> String {
    match expr {
        ast::Expr::Function { name, args, .. } => {
            let args: Vec<String> = args.iter().map(expr_label).collect();
            format!("{}({})", name.to_ascii_uppercase(), args.join(", "))
        }
        ast::Expr::Wildcard => "*".to_string(),
        ast::Expr::Identifier(parts) => parts.join("."),
        ast::Expr::Literal(v) => v.to_sql_literal(),
        _ => "expr".to_string(),
    }
}
