//! Clone-with-substitution for per-data-node statements

use crate::ast::*;
use shardline_ir::{DataNode, TableId};

/// Describes how a physical variant differs from the logical statement.
#[derive(Debug, Clone, Default)]
pub struct Substitution {
    default_schema: String,
    tables: Vec<(TableId, TableName)>,
    columns: Option<Vec<String>>,
    appended: Vec<(String, Vec<Expr>)>,
    rows: Option<Vec<usize>>,
}

impl Substitution {
    pub fn new(default_schema: impl Into<String>) -> Self {
        Self {
            default_schema: default_schema.into(),
            ..Default::default()
        }
    }

    /// Point references to `logical` at the data node's physical table.
    pub fn table(mut self, logical: &TableId, node: &DataNode) -> Self {
        let key = TableId::new(logical.schema.to_ascii_lowercase(), logical.table.to_ascii_lowercase());
        self.tables
            .push((key, TableName::qualified(node.schema.clone(), node.table.clone())));
        self
    }

    /// Replace an INSERT's column list.
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Append an INSERT column with one value per original row.
    pub fn append_column(mut self, column: impl Into<String>, values: Vec<Expr>) -> Self {
        self.appended.push((column.into(), values));
        self
    }

    /// Keep only the listed INSERT rows, by original index.
    pub fn keep_rows(mut self, rows: Vec<usize>) -> Self {
        self.rows = Some(rows);
        self
    }

    fn physical(&self, name: &TableName) -> Option<&TableName> {
        let schema = name
            .schema
            .as_deref()
            .unwrap_or(&self.default_schema)
            .to_ascii_lowercase();
        let table = name.name.to_ascii_lowercase();
        self.tables
            .iter()
            .find(|(id, _)| id.schema == schema && id.table == table)
            .map(|(_, physical)| physical)
    }
}

impl Statement {
    /// Build the physical variant of this statement. `self` is left untouched.
    pub fn substitute(&self, sub: &Substitution) -> Statement {
        match self {
            Statement::Select(select) => Statement::Select(select_sub(select, sub)),
            Statement::Insert(insert) => Statement::Insert(insert_sub(insert, sub)),
            Statement::Update(update) => {
                let (table, renames) = dml_table(&update.table, sub);
                Statement::Update(Update {
                    table,
                    assignments: update
                        .assignments
                        .iter()
                        .map(|a| Assignment {
                            column: a.column.clone(),
                            value: expr_sub(&a.value, sub, &renames),
                        })
                        .collect(),
                    selection: update.selection.as_ref().map(|e| expr_sub(e, sub, &renames)),
                })
            }
            Statement::Delete(delete) => {
                let (table, renames) = dml_table(&delete.table, sub);
                Statement::Delete(Delete {
                    table,
                    selection: delete.selection.as_ref().map(|e| expr_sub(e, sub, &renames)),
                })
            }
        }
    }
}

/// Qualifier rewrites `(old prefix, new prefix)` for column identifiers.
type Renames = Vec<(Vec<String>, Vec<String>)>;

fn dml_table(name: &TableName, sub: &Substitution) -> (TableName, Renames) {
    match sub.physical(name) {
        Some(physical) => {
            let mut renames = vec![(vec![name.name.clone()], vec![physical.name.clone()])];
            if let (Some(schema), Some(phys_schema)) = (&name.schema, &physical.schema) {
                renames.insert(
                    0,
                    (
                        vec![schema.clone(), name.name.clone()],
                        vec![phys_schema.clone(), physical.name.clone()],
                    ),
                );
            }
            (physical.clone(), renames)
        }
        None => (name.clone(), Vec::new()),
    }
}

fn insert_sub(insert: &Insert, sub: &Substitution) -> Insert {
    let table = sub.physical(&insert.table).cloned().unwrap_or_else(|| insert.table.clone());
    let mut columns = sub.columns.clone().unwrap_or_else(|| insert.columns.clone());
    columns.extend(sub.appended.iter().map(|(c, _)| c.clone()));
    let indexes: Vec<usize> = match &sub.rows {
        Some(rows) => rows.clone(),
        None => (0..insert.rows.len()).collect(),
    };
    let rows = indexes
        .into_iter()
        .filter_map(|i| {
            let mut row: Vec<Expr> = insert.rows.get(i)?.iter().map(|e| expr_sub(e, sub, &[])).collect();
            for (_, values) in &sub.appended {
                row.push(values.get(i).cloned().unwrap_or(Expr::Literal(Value::Null)));
            }
            Some(row)
        })
        .collect();
    Insert { table, columns, rows }
}

fn select_sub(select: &Select, sub: &Substitution) -> Select {
    let no_renames: Renames = Vec::new();
    let e = |expr: &Expr| expr_sub(expr, sub, &no_renames);
    Select {
        distinct: select.distinct,
        projection: select
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::Expr { expr, alias } => SelectItem::Expr {
                    expr: e(expr),
                    alias: alias.clone(),
                },
                other => other.clone(),
            })
            .collect(),
        from: select.from.iter().map(|f| from_sub(f, sub)).collect(),
        selection: select.selection.as_ref().map(e),
        group_by: select.group_by.iter().map(e).collect(),
        having: select.having.as_ref().map(e),
        order_by: select
            .order_by
            .iter()
            .map(|o| OrderByItem {
                expr: e(&o.expr),
                descending: o.descending,
            })
            .collect(),
        limit: select.limit,
        offset: select.offset,
        unions: select
            .unions
            .iter()
            .map(|u| UnionBranch {
                all: u.all,
                select: select_sub(&u.select, sub),
            })
            .collect(),
    }
}

fn from_sub(item: &FromItem, sub: &Substitution) -> FromItem {
    match item {
        FromItem::Table { name, alias } => match sub.physical(name) {
            // Keep the logical name reachable as a qualifier.
            Some(physical) => FromItem::Table {
                name: physical.clone(),
                alias: Some(alias.clone().unwrap_or_else(|| name.name.clone())),
            },
            None => item.clone(),
        },
        FromItem::Join { left, right, kind, on } => FromItem::Join {
            left: Box::new(from_sub(left, sub)),
            right: Box::new(from_sub(right, sub)),
            kind: *kind,
            on: on.as_ref().map(|e| expr_sub(e, sub, &[])),
        },
    }
}

fn expr_sub(expr: &Expr, sub: &Substitution, renames: &[(Vec<String>, Vec<String>)]) -> Expr {
    let boxed = |e: &Expr| Box::new(expr_sub(e, sub, renames));
    match expr {
        Expr::Identifier(parts) => {
            for (old, new) in renames {
                let prefix = parts.len().saturating_sub(1);
                if prefix == old.len()
                    && parts[..prefix]
                        .iter()
                        .zip(old)
                        .all(|(a, b)| a.eq_ignore_ascii_case(b))
                {
                    let mut renamed = new.clone();
                    renamed.extend(parts[prefix..].iter().cloned());
                    return Expr::Identifier(renamed);
                }
            }
            expr.clone()
        }
        Expr::Literal(_) | Expr::Placeholder(_) | Expr::Wildcard => expr.clone(),
        Expr::Binary { left, op, right } => Expr::Binary {
            left: boxed(left),
            op: *op,
            right: boxed(right),
        },
        Expr::Unary { op, expr } => Expr::Unary { op: *op, expr: boxed(expr) },
        Expr::Function { name, args, distinct } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(|a| expr_sub(a, sub, renames)).collect(),
            distinct: *distinct,
        },
        Expr::InList { expr, list, negated } => Expr::InList {
            expr: boxed(expr),
            list: list.iter().map(|a| expr_sub(a, sub, renames)).collect(),
            negated: *negated,
        },
        Expr::Between { expr, low, high, negated } => Expr::Between {
            expr: boxed(expr),
            low: boxed(low),
            high: boxed(high),
            negated: *negated,
        },
        Expr::IsNull { expr, negated } => Expr::IsNull { expr: boxed(expr), negated: *negated },
        Expr::Exists { subquery, negated } => Expr::Exists {
            subquery: Box::new(select_sub(subquery, sub)),
            negated: *negated,
        },
        Expr::InSubquery { expr, subquery, negated } => Expr::InSubquery {
            expr: boxed(expr),
            subquery: Box::new(select_sub(subquery, sub)),
            negated: *negated,
        },
        Expr::Subquery(subquery) => Expr::Subquery(Box::new(select_sub(subquery, sub))),
        Expr::Nested(inner) => Expr::Nested(boxed(inner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{render, RenderMode};

    fn node() -> DataNode {
        DataNode::new("n2", "db_1", "orders_1")
    }

    #[test]
    fn test_substitute_leaves_original_untouched() {
        let original = Statement::Update(Update {
            table: TableName::new("orders"),
            assignments: vec![Assignment {
                column: "status".into(),
                value: Expr::placeholder(0),
            }],
            selection: Some(Expr::ident("orders.id").equals(Expr::placeholder(1))),
        });
        let snapshot = original.clone();
        let sub = Substitution::new("db").table(&TableId::new("db", "orders"), &node());

        let physical = original.substitute(&sub);

        assert_eq!(original, snapshot);
        let sql = render(&physical, RenderMode::Inline(&[Value::from("PAID"), Value::Int(3)]))
            .unwrap()
            .sql;
        assert_eq!(sql, "UPDATE db_1.orders_1 SET status = 'PAID' WHERE orders_1.id = 3");
    }

    #[test]
    fn test_select_keeps_logical_alias() {
        let select = Select::from_table(TableName::new("orders"))
            .filter(Expr::ident("orders.customer_id").equals(Expr::lit(1)));
        let sub = Substitution::new("db").table(&TableId::new("DB", "Orders"), &node());
        let sql = render(&Statement::Select(select).substitute(&sub), RenderMode::Inline(&[]))
            .unwrap()
            .sql;
        assert_eq!(sql, "SELECT * FROM db_1.orders_1 AS orders WHERE orders.customer_id = 1");
    }

    #[test]
    fn test_insert_rows_and_appended_column() {
        let insert = Statement::Insert(Insert {
            table: TableName::new("orders"),
            columns: vec![],
            rows: vec![vec![Expr::placeholder(0)], vec![Expr::placeholder(1)]],
        });
        let sub = Substitution::new("db")
            .table(&TableId::new("db", "orders"), &node())
            .columns(vec!["customer_id".into()])
            .append_column("id", vec![Expr::placeholder(2), Expr::placeholder(3)])
            .keep_rows(vec![1]);
        let Statement::Insert(physical) = insert.substitute(&sub) else {
            panic!("expected insert");
        };
        assert_eq!(physical.columns, vec!["customer_id".to_string(), "id".to_string()]);
        assert_eq!(physical.rows, vec![vec![Expr::placeholder(1), Expr::placeholder(3)]]);
    }
}
