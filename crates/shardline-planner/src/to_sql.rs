//! Relational fragment to data-node SQL
//!
//! A view fragment is folded bottom-up into a single query block. Shapes that
//! would need a derived table (filtering above a LIMIT, aggregating an
//! aggregate) are reported as [`PlanError::Unrenderable`] so the optimizer can
//! keep them out of views.

use crate::PlanError;
use shardline_ast as ast;
use shardline_ir::{Expr, Field, JoinKind, RelNode, Schema};

#[derive(Debug, Default)]
struct Block {
    from: Vec<ast::FromItem>,
    selection: Vec<ast::Expr>,
    columns: Vec<(ast::Expr, Field)>,
    group_by: Vec<ast::Expr>,
    having: Vec<ast::Expr>,
    aggregated: bool,
    order_by: Vec<ast::OrderByItem>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Block {
    fn schema(&self) -> Schema {
        Schema::new(self.columns.iter().map(|(_, f)| f.clone()).collect())
    }

    fn is_plain(&self) -> bool {
        !self.aggregated && self.order_by.is_empty() && self.limit.is_none() && self.offset.is_none()
    }

    fn is_limited(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    fn condition(&mut self, predicate: &Expr) -> Result<(), PlanError> {
        if self.is_limited() {
            return Err(PlanError::Unrenderable("filter above LIMIT".into()));
        }
        let scope = self.schema();
        let conjuncts = predicate
            .split_conjunction()
            .iter()
            .map(|c| expr(c, &scope, &self.columns))
            .collect::<Result<Vec<_>, _>>()?;
        if self.aggregated {
            self.having.extend(conjuncts);
        } else {
            self.selection.extend(conjuncts);
        }
        Ok(())
    }

    fn into_select(self) -> ast::Select {
        ast::Select {
            distinct: false,
            projection: self
                .columns
                .into_iter()
                .map(|(expr, field)| {
                    let alias = match &expr {
                        ast::Expr::Identifier(parts)
                            if parts.last().is_some_and(|p| p.eq_ignore_ascii_case(&field.name)) =>
                        {
                            None
                        }
                        _ => Some(quote_alias(&field.name)),
                    };
                    ast::SelectItem::Expr { expr, alias }
                })
                .collect(),
            from: self.from,
            selection: and_all(self.selection),
            group_by: self.group_by,
            having: and_all(self.having),
            order_by: self.order_by,
            limit: self.limit,
            offset: self.offset,
            unions: vec![],
        }
    }
}

fn quote_alias(name: &str) -> String {
    let plain = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("`{}`", name.replace('`', "``"))
    }
}

fn and_all(conjuncts: Vec<ast::Expr>) -> Option<ast::Expr> {
    conjuncts.into_iter().reduce(|a, b| a.and(b))
}

/// Render a view fragment as one SELECT over logical table names.
pub fn fragment_select(node: &RelNode) -> Result<ast::Select, PlanError> {
    Ok(block(node)?.into_select())
}

fn block(node: &RelNode) -> Result<Block, PlanError> {
    match node {
        RelNode::TableScan { table, alias, schema } => Ok(Block {
            from: vec![ast::FromItem::Table {
                name: ast::TableName::qualified(table.schema.clone(), table.table.clone()),
                alias: Some(alias.clone()),
            }],
            columns: schema
                .fields
                .iter()
                .map(|f| (ast::Expr::Identifier(vec![alias.clone(), f.name.clone()]), f.clone()))
                .collect(),
            ..Default::default()
        }),
        RelNode::Values { schema, rows } if rows.len() == 1 => {
            let empty = Schema::empty();
            let columns = rows[0]
                .iter()
                .zip(schema.fields.iter())
                .map(|(e, f)| Ok((expr(e, &empty, &[])?, f.clone())))
                .collect::<Result<Vec<_>, PlanError>>()?;
            Ok(Block { columns, ..Default::default() })
        }
        RelNode::Filter { input, predicate } => {
            let mut b = block(input)?;
            b.condition(predicate)?;
            Ok(b)
        }
        RelNode::Project { input, exprs } | RelNode::Calc { input, exprs, .. } => {
            let mut b = block(input)?;
            if let RelNode::Calc { condition: Some(condition), .. } = node {
                b.condition(condition)?;
            }
            let scope = b.schema();
            let fields = node.schema().fields;
            let columns = exprs
                .iter()
                .zip(fields)
                .map(|(e, f)| Ok((expr(&e.expr, &scope, &b.columns)?, f)))
                .collect::<Result<Vec<_>, PlanError>>()?;
            b.columns = columns;
            Ok(b)
        }
        RelNode::Aggregate { input, group_by, aggs } => {
            let mut b = block(input)?;
            if !b.is_plain() {
                return Err(PlanError::Unrenderable("nested aggregation".into()));
            }
            let scope = b.schema();
            let keys = group_by
                .iter()
                .map(|g| expr(g, &scope, &b.columns))
                .collect::<Result<Vec<_>, _>>()?;
            let mut items = keys.clone();
            for agg in aggs {
                let args = if agg.args.is_empty() {
                    vec![ast::Expr::Wildcard]
                } else {
                    agg.args
                        .iter()
                        .map(|a| expr(a, &scope, &b.columns))
                        .collect::<Result<Vec<_>, _>>()?
                };
                items.push(ast::Expr::Function {
                    name: agg.func.name().to_string(),
                    args,
                    distinct: agg.distinct,
                });
            }
            b.columns = items.into_iter().zip(node.schema().fields).collect();
            b.group_by = keys;
            b.aggregated = true;
            Ok(b)
        }
        RelNode::Sort { input, keys, offset, fetch } => {
            let mut b = block(input)?;
            if b.is_limited() {
                return Err(PlanError::Unrenderable("sort above LIMIT".into()));
            }
            let scope = b.schema();
            b.order_by = keys
                .iter()
                .map(|k| {
                    Ok(ast::OrderByItem {
                        expr: expr(&k.expr, &scope, &b.columns)?,
                        descending: k.descending,
                    })
                })
                .collect::<Result<Vec<_>, PlanError>>()?;
            b.limit = *fetch;
            b.offset = *offset;
            Ok(b)
        }
        RelNode::Join { left, right, kind, condition } => join(block(left)?, block(right)?, *kind, condition),
        other => Err(PlanError::Unrenderable(other.name().to_string())),
    }
}

fn join(left: Block, right: Block, kind: JoinKind, condition: &Expr) -> Result<Block, PlanError> {
    if !left.is_plain() || !right.is_plain() || left.from.is_empty() || right.from.is_empty() {
        return Err(PlanError::Unrenderable(format!("{} over derived input", kind.sql())));
    }
    let mut columns = left.columns;
    columns.extend(right.columns.iter().cloned());
    let scope = Schema::new(columns.iter().map(|(_, f)| f.clone()).collect());
    let on = expr(condition, &scope, &columns)?;
    let on_true = condition.is_true_literal();

    let with = |base: ast::Expr, extra: Vec<ast::Expr>| {
        let conjuncts: Vec<ast::Expr> = if on_true { extra } else { std::iter::once(base).chain(extra).collect() };
        and_all(conjuncts).unwrap_or(ast::Expr::lit(true))
    };

    let (from, selection, columns) = match kind {
        JoinKind::Inner => {
            let mut selection = left.selection;
            selection.extend(right.selection);
            (joined(left.from, right.from, kind, on), selection, columns)
        }
        JoinKind::Left => (joined(left.from, right.from, kind, with(on, right.selection)), left.selection, columns),
        JoinKind::Right => (joined(left.from, right.from, kind, with(on, left.selection)), right.selection, columns),
        JoinKind::Full => {
            if !left.selection.is_empty() || !right.selection.is_empty() {
                return Err(PlanError::Unrenderable("filtered FULL JOIN input".into()));
            }
            (joined(left.from, right.from, kind, on), vec![], columns)
        }
        JoinKind::Semi | JoinKind::Anti => {
            let mut inner = right.selection;
            if !on_true {
                inner.push(on);
            }
            let subquery = ast::Select {
                projection: vec![ast::SelectItem::expr(ast::Expr::lit(1))],
                from: right.from,
                selection: and_all(inner),
                ..Default::default()
            };
            let mut selection = left.selection;
            selection.push(ast::Expr::Exists {
                subquery: Box::new(subquery),
                negated: kind == JoinKind::Anti,
            });
            let left_width = columns.len() - right.columns.len();
            columns.truncate(left_width);
            (left.from, selection, columns)
        }
    };
    Ok(Block {
        from,
        selection,
        columns,
        ..Default::default()
    })
}

fn single(items: Vec<ast::FromItem>) -> ast::FromItem {
    let mut iter = items.into_iter();
    let first = iter.next();
    iter.fold(first, |acc, item| {
        Some(match acc {
            Some(acc) => acc.join(item, JoinKind::Inner, ast::Expr::lit(true)),
            None => item,
        })
    })
    .unwrap_or(ast::FromItem::Table { name: ast::TableName::new("dual"), alias: None })
}

fn joined(left: Vec<ast::FromItem>, right: Vec<ast::FromItem>, kind: JoinKind, on: ast::Expr) -> Vec<ast::FromItem> {
    vec![single(left).join(single(right), kind, on)]
}

/// Translate an expression over a block's output into the block's terms.
fn expr(e: &Expr, scope: &Schema, columns: &[(ast::Expr, Field)]) -> Result<ast::Expr, PlanError> {
    let sub = |e: &Expr| expr(e, scope, columns).map(Box::new);
    Ok(match e {
        Expr::Literal { value } => ast::Expr::Literal(value.clone()),
        Expr::Column { col } => {
            let i = scope
                .resolve(col.table.as_deref(), &col.column)
                .map_err(|err| PlanError::Unrenderable(err.to_string()))?;
            columns[i].0.clone()
        }
        Expr::Param { index } => ast::Expr::Placeholder(*index),
        Expr::BinaryOp { op, left, right } => ast::Expr::Binary { left: sub(left)?, op: *op, right: sub(right)? },
        Expr::UnaryOp { op, expr: inner } => ast::Expr::Unary { op: *op, expr: sub(inner)? },
        Expr::FuncCall { func, args } => ast::Expr::Function {
            name: func.clone(),
            args: args
                .iter()
                .map(|a| expr(a, scope, columns))
                .collect::<Result<Vec<_>, _>>()?,
            distinct: false,
        },
        Expr::InList { expr: inner, list, negated } => ast::Expr::InList {
            expr: sub(inner)?,
            list: list
                .iter()
                .map(|a| expr(a, scope, columns))
                .collect::<Result<Vec<_>, _>>()?,
            negated: *negated,
        },
        Expr::Between { expr: inner, low, high, negated } => ast::Expr::Between {
            expr: sub(inner)?,
            low: sub(low)?,
            high: sub(high)?,
            negated: *negated,
        },
        Expr::IsNull { expr: inner, negated } => ast::Expr::IsNull { expr: sub(inner)?, negated: *negated },
        Expr::OuterColumn { .. } | Expr::Exists { .. } | Expr::InSubquery { .. } | Expr::ScalarSubquery { .. } => {
            return Err(PlanError::Unrenderable(e.to_string()));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_ast::{render_select, RenderMode};
    use shardline_ir::{eq, lit, param, qcol, AggCall, AggFunc, DataType, NamedExpr, PlanRef, SortKey, TableId};

    fn scan(table: &str, alias: &str) -> PlanRef {
        RelNode::TableScan {
            table: TableId::new("shop", table),
            alias: alias.to_string(),
            schema: Schema::new(vec![
                Field::new("id", DataType::Int64).with_qualifier(alias),
                Field::new("customer_id", DataType::Int64).with_qualifier(alias),
            ]),
        }
        .into_ref()
    }

    fn sql(node: &RelNode) -> String {
        render_select(&fragment_select(node).unwrap(), RenderMode::Inline(&[])).unwrap().sql
    }

    #[test]
    fn test_filtered_projection() {
        let plan = RelNode::Calc {
            input: scan("orders", "o"),
            exprs: vec![NamedExpr::new(qcol("o", "id"), "id"), NamedExpr::new(qcol("o", "customer_id"), "cid")],
            condition: Some(eq(qcol("o", "customer_id"), param(0))),
        };
        let select = fragment_select(&plan).unwrap();
        let rendered = render_select(&select, RenderMode::Parameterized(&[shardline_ir::Value::Int(150)])).unwrap();
        assert_eq!(rendered.sql, "SELECT o.id, o.customer_id AS cid FROM shop.orders AS o WHERE o.customer_id = ?");
        assert_eq!(rendered.params, vec![shardline_ir::Value::Int(150)]);
    }

    #[test]
    fn test_aggregate_having_order_limit() {
        let aggregate = RelNode::Aggregate {
            input: scan("orders", "o"),
            group_by: vec![qcol("o", "customer_id")],
            aggs: vec![AggCall { func: AggFunc::Count, args: vec![], distinct: false, alias: "agg0".into() }],
        }
        .into_ref();
        let having = RelNode::Filter {
            input: aggregate,
            predicate: shardline_ir::binary(shardline_ir::col("agg0"), shardline_ir::BinOp::Gt, lit(1)),
        }
        .into_ref();
        let project = RelNode::Project {
            input: having,
            exprs: vec![
                NamedExpr::new(qcol("o", "customer_id"), "customer_id"),
                NamedExpr::new(shardline_ir::col("agg0"), "COUNT(*)"),
            ],
        }
        .into_ref();
        let plan = RelNode::Sort {
            input: project,
            keys: vec![SortKey { expr: shardline_ir::col("COUNT(*)"), descending: true }],
            offset: None,
            fetch: Some(5),
        };
        assert_eq!(
            sql(&plan),
            "SELECT o.customer_id, COUNT(*) AS `COUNT(*)` FROM shop.orders AS o GROUP BY o.customer_id \
             HAVING COUNT(*) > 1 ORDER BY COUNT(*) DESC LIMIT 5"
        );
    }

    #[test]
    fn test_joins() {
        let inner = RelNode::Join {
            left: RelNode::Filter { input: scan("orders", "o"), predicate: eq(qcol("o", "id"), lit(1)) }.into_ref(),
            right: scan("customers", "c"),
            kind: JoinKind::Left,
            condition: eq(qcol("o", "customer_id"), qcol("c", "id")),
        };
        assert_eq!(
            sql(&inner),
            "SELECT o.id, o.customer_id, c.id, c.customer_id FROM shop.orders AS o \
             LEFT JOIN shop.customers AS c ON o.customer_id = c.id WHERE o.id = 1"
        );

        let semi = RelNode::Join {
            left: scan("customers", "c"),
            right: RelNode::Filter { input: scan("orders", "o"), predicate: eq(qcol("o", "id"), lit(1)) }.into_ref(),
            kind: JoinKind::Anti,
            condition: eq(qcol("o", "customer_id"), qcol("c", "id")),
        };
        assert_eq!(
            sql(&semi),
            "SELECT c.id, c.customer_id FROM shop.customers AS c WHERE NOT EXISTS \
             (SELECT 1 FROM shop.orders AS o WHERE o.id = 1 AND o.customer_id = c.id)"
        );
    }

    #[test]
    fn test_filter_above_limit_is_unrenderable() {
        let sorted = RelNode::Sort { input: scan("orders", "o"), keys: vec![], offset: None, fetch: Some(1) }.into_ref();
        let plan = RelNode::Filter { input: sorted, predicate: eq(qcol("o", "id"), lit(1)) };
        assert!(matches!(fragment_select(&plan), Err(PlanError::Unrenderable(_))));
    }
}
