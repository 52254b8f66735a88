//! Per-data-node statement rewriting and the compiled statement set

use crate::RouteError;
use indexmap::IndexSet;
use shardline_ast::{self as ast, render, RenderMode, Statement, Substitution};
use shardline_ir::{DataNode, IndexCondition, LogicalTable, ModifyOp, TableId, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Secondary-index bookkeeping shared by every physical variant of one
/// UPDATE/DELETE.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMaintenance {
    pub table: TableId,
    pub op: ModifyOp,
    pub primary_key: Vec<String>,
    /// New values of assigned columns; non-constant assignments map to NULL.
    pub changed_columns: BTreeMap<String, Value>,
    /// Keys pinned by the WHERE clause, when it covers the primary key.
    pub known_keys: Option<Vec<Vec<Value>>>,
}

/// SELECT of the affected primary keys, run before the write on the same connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PreRead {
    pub sql: String,
    pub params: Vec<Value>,
}

/// One physical statement. Equality and hashing use only the rendered SQL and
/// the data node, so identical physical work collapses in a [`SqlSet`].
#[derive(Debug, Clone)]
pub struct CompiledStatement {
    pub node: DataNode,
    pub sql: String,
    pub params: Vec<Value>,
    pub statement: Arc<Statement>,
    pub maintenance: Option<Arc<IndexMaintenance>>,
    pub pre_read: Option<PreRead>,
    logical_params: Arc<[Value]>,
}

impl CompiledStatement {
    pub fn target(&self) -> &str {
        &self.node.target
    }

    /// SQL with parameters inlined as literals.
    pub fn inline_sql(&self) -> Result<String, RouteError> {
        Ok(render(&self.statement, RenderMode::Inline(&self.logical_params))?.sql)
    }

    pub fn is_query(&self) -> bool {
        self.statement.is_query()
    }
}

impl PartialEq for CompiledStatement {
    fn eq(&self, other: &Self) -> bool {
        self.sql == other.sql && self.node == other.node
    }
}

impl Eq for CompiledStatement {}

impl Hash for CompiledStatement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sql.hash(state);
        self.node.hash(state);
    }
}

/// Insertion-ordered, deduplicated physical statements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlSet {
    statements: IndexSet<CompiledStatement>,
}

impl SqlSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a statement; a duplicate (same SQL, same node) keeps the first.
    pub fn insert(&mut self, statement: CompiledStatement) -> bool {
        let (index, inserted) = self.statements.insert_full(statement);
        if !inserted {
            if let Some(existing) = self.statements.get_index(index) {
                tracing::debug!(target_node = %existing.node, sql = %existing.sql, "duplicate physical statement folded");
            }
        }
        inserted
    }

    pub fn extend(&mut self, other: SqlSet) {
        for statement in other.statements {
            self.insert(statement);
        }
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledStatement> {
        self.statements.iter()
    }

    /// Exactly one physical statement: can be forwarded as-is.
    pub fn is_proxy(&self) -> bool {
        self.statements.len() == 1
    }

    /// `(target, sql)` with parameters inlined, for the single-statement path.
    pub fn single_sql(&self) -> Result<Option<(String, String)>, RouteError> {
        if !self.is_proxy() {
            return Ok(None);
        }
        match self.statements.first() {
            Some(statement) => Ok(Some((statement.node.target.clone(), statement.inline_sql()?))),
            None => Ok(None),
        }
    }

    /// Distinct connection targets in first-appearance order.
    pub fn targets(&self) -> Vec<String> {
        let mut seen: IndexSet<&str> = IndexSet::new();
        for statement in &self.statements {
            seen.insert(statement.node.target.as_str());
        }
        seen.into_iter().map(str::to_string).collect()
    }

    /// One line per statement: `target:<t> <sql> <params>`.
    pub fn explain(&self) -> Vec<String> {
        self.statements
            .iter()
            .map(|s| format!("target:{} {} {:?}", s.node.target, s.sql, s.params))
            .collect()
    }
}

impl fmt::Display for SqlSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.explain() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a SqlSet {
    type Item = &'a CompiledStatement;
    type IntoIter = indexmap::set::Iter<'a, CompiledStatement>;

    fn into_iter(self) -> Self::IntoIter {
        self.statements.iter()
    }
}

/// Clones statements per data node and renders them.
pub struct StatementRewriter<'a> {
    default_schema: &'a str,
}

impl<'a> StatementRewriter<'a> {
    pub fn new(default_schema: &'a str) -> Self {
        Self { default_schema }
    }

    pub fn substitution(&self) -> Substitution {
        Substitution::new(self.default_schema)
    }

    /// Render one physical variant.
    pub fn compile_one(
        &self,
        statement: &Statement,
        node: &DataNode,
        substitution: &Substitution,
        params: &Arc<[Value]>,
    ) -> Result<CompiledStatement, RouteError> {
        let physical = statement.substitute(substitution);
        let rendered = render(&physical, RenderMode::Parameterized(params))?;
        Ok(CompiledStatement {
            node: node.clone(),
            sql: rendered.sql,
            params: rendered.params,
            statement: Arc::new(physical),
            maintenance: None,
            pre_read: None,
            logical_params: params.clone(),
        })
    }

    /// Rewrite `statement` for each node, replacing `table` by the node's physical table.
    pub fn rewrite(
        &self,
        statement: &Statement,
        table: &TableId,
        nodes: &[DataNode],
        params: &[Value],
    ) -> Result<SqlSet, RouteError> {
        let params: Arc<[Value]> = params.into();
        let mut set = SqlSet::new();
        for node in nodes {
            let substitution = self.substitution().table(table, node);
            set.insert(self.compile_one(statement, node, &substitution, &params)?);
        }
        Ok(set)
    }

    /// UPDATE/DELETE rewrite, attaching secondary-index maintenance when the
    /// statement can move index entries.
    pub fn rewrite_dml(
        &self,
        statement: &Statement,
        table: &LogicalTable,
        condition: &IndexCondition,
        nodes: &[DataNode],
        params: &[Value],
    ) -> Result<SqlSet, RouteError> {
        let maintenance = maintenance_for(statement, table, condition, params)?.map(Arc::new);
        let pre_read_stmt = match &maintenance {
            Some(m) if m.known_keys.is_none() => primary_key_select(statement, table),
            _ => None,
        };
        let logical: Arc<[Value]> = params.into();
        let mut set = SqlSet::new();
        for node in nodes {
            let substitution = self.substitution().table(&table.id(), node);
            let mut compiled = self.compile_one(statement, node, &substitution, &logical)?;
            if let Some(select) = &pre_read_stmt {
                let rendered = render(&select.substitute(&substitution), RenderMode::Parameterized(params))?;
                compiled.pre_read = Some(PreRead {
                    sql: rendered.sql,
                    params: rendered.params,
                });
            }
            compiled.maintenance = maintenance.clone();
            set.insert(compiled);
        }
        Ok(set)
    }
}

fn maintenance_for(
    statement: &Statement,
    table: &LogicalTable,
    condition: &IndexCondition,
    params: &[Value],
) -> Result<Option<IndexMaintenance>, RouteError> {
    let (op, changed) = match statement {
        Statement::Update(update) => {
            let touches = update
                .assignments
                .iter()
                .any(|a| table.is_sharding_key(&a.column) || table.is_indexed(&a.column));
            if !touches {
                return Ok(None);
            }
            let changed = update
                .assignments
                .iter()
                .map(|a| {
                    let value = match &a.value {
                        ast::Expr::Literal(v) => v.clone(),
                        ast::Expr::Placeholder(i) => params.get(*i).cloned().unwrap_or(Value::Null),
                        _ => Value::Null,
                    };
                    (a.column.to_ascii_lowercase(), value)
                })
                .collect();
            (ModifyOp::Update, changed)
        }
        Statement::Delete(_) if !table.indexes.is_empty() => (ModifyOp::Delete, BTreeMap::new()),
        _ => return Ok(None),
    };
    Ok(Some(IndexMaintenance {
        table: table.id(),
        op,
        primary_key: table.primary_key.clone(),
        changed_columns: changed,
        known_keys: condition.primary_key_rows(&table.primary_key, params),
    }))
}

/// `SELECT <pk> FROM <table> WHERE <same predicate>` for a DML statement.
pub fn primary_key_select(statement: &Statement, table: &LogicalTable) -> Option<Statement> {
    let (name, selection) = match statement {
        Statement::Update(update) => (&update.table, &update.selection),
        Statement::Delete(delete) => (&delete.table, &delete.selection),
        _ => return None,
    };
    if table.primary_key.is_empty() {
        return None;
    }
    Some(Statement::Select(ast::Select {
        projection: table
            .primary_key
            .iter()
            .map(|c| ast::SelectItem::expr(ast::Expr::ident(c)))
            .collect(),
        from: vec![ast::FromItem::table(name.clone(), None)],
        selection: selection.clone(),
        ..Default::default()
    }))
}
