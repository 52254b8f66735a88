//! Compilation entry point: statement in, routed plan or statement set out

use crate::cbo::{in_convention, Cbo};
use crate::decorrelate::decorrelate;
use crate::join_reorder::to_multi_join;
use crate::materialize::materialize;
use crate::routing::ScanRouter;
use crate::rules::{RuleProgram, DEFAULT_MATCH_LIMIT};
use crate::trace::{CompileTrace, Phase};
use crate::trim::trim_fields;
use crate::PlanError;
use serde::{Deserialize, Serialize};
use shardline_ast::{render, Binder, RenderMode, Statement};
use shardline_ir::{Catalog, LogicalTable, ModifyOp, PlanRef, RelNode, SequenceGenerator, TableId, TableType, Value};
use shardline_route::{
    DistributionResolver, InsertPlan, InsertRewriter, PredicateAnalyzer, ReadReplica, RouteError, ShardingInput,
    SqlSet, StatementRewriter,
};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOptions {
    /// Cap on rule applications in the rule-based phase.
    pub match_limit: usize,
    pub join_reorder: bool,
    pub field_trimming: bool,
    pub global_read: ReadReplica,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            match_limit: DEFAULT_MATCH_LIMIT,
            join_reorder: true,
            field_trimming: true,
            global_read: ReadReplica::First,
        }
    }
}

/// Whether an optimized plan may be stored under its statement fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Only placeholders vary; reusable for any bound values.
    Parameterized,
    /// No literals and no placeholders.
    Always,
    /// Literals are baked into the plan but erased from the fingerprint.
    Never,
}

impl CachePolicy {
    pub fn for_statement(statement: &Statement) -> Self {
        let width = statement.max_placeholder().map_or(0, |m| m + 1);
        let unbound = vec![Value::Null; width];
        match render(statement, RenderMode::Parameterized(&unbound)) {
            Ok(rendered) if rendered.sql == statement.fingerprint_sql() => match width {
                0 => CachePolicy::Always,
                _ => CachePolicy::Parameterized,
            },
            _ => CachePolicy::Never,
        }
    }

    pub fn cacheable(&self) -> bool {
        !matches!(self, CachePolicy::Never)
    }
}

/// Output of the relational pipeline, before or after routing.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub plan: PlanRef,
    pub cache_policy: CachePolicy,
    pub trace: CompileTrace,
}

#[derive(Debug, Clone)]
pub struct MutationPlan {
    pub table: TableId,
    pub table_type: TableType,
    pub op: ModifyOp,
    pub statements: SqlSet,
    /// Column layout when `op` is an insert.
    pub insert: Option<InsertPlan>,
    pub generated_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub enum CompiledPlan {
    Query(Optimized),
    Mutation(MutationPlan),
}

pub struct SqlCompiler<'a> {
    catalog: &'a dyn Catalog,
    default_schema: &'a str,
    options: OptimizerOptions,
    gsi_available: bool,
    sequence: Option<&'a dyn SequenceGenerator>,
}

impl<'a> SqlCompiler<'a> {
    pub fn new(catalog: &'a dyn Catalog, default_schema: &'a str) -> Self {
        Self {
            catalog,
            default_schema,
            options: OptimizerOptions::default(),
            gsi_available: false,
            sequence: None,
        }
    }

    pub fn with_options(mut self, options: OptimizerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_gsi(mut self, available: bool) -> Self {
        self.gsi_available = available;
        self
    }

    pub fn with_sequence(mut self, sequence: &'a dyn SequenceGenerator) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.options
    }

    pub fn bind(&self, statement: &Statement) -> Result<PlanRef, PlanError> {
        Ok(Binder::new(self.catalog, self.default_schema).bind(statement)?)
    }

    /// Run the relational pipeline up to data-node views. The result does not
    /// depend on parameter values, so it can be cached per fingerprint.
    pub fn optimize(&self, statement: &Statement) -> Result<Optimized, PlanError> {
        let logical = self.bind(statement)?;
        if matches!(logical.as_ref(), RelNode::TableModify { .. }) {
            return Err(PlanError::UnexpectedPlan {
                expected: "query",
                found: logical.name(),
            });
        }
        let mut trace = CompileTrace::new();

        let plan = decorrelate(&logical, &mut trace);
        let plan = RuleProgram::rbo(self.options.match_limit).run(&plan, Phase::Rbo, &mut trace);

        let reorder = self.options.join_reorder && plan.count_joins() > 1;
        let plan = if reorder {
            trace.record(Phase::JoinReorder, "JoinToMultiJoin", plan.count_joins().to_string());
            to_multi_join(&plan)
        } else {
            plan
        };

        let plan = if self.options.field_trimming && !in_convention(&plan) {
            let trimmed = trim_fields(&plan);
            if !Arc::ptr_eq(&trimmed, &plan) {
                trace.record(Phase::Trim, "FieldTrim", "");
            }
            trimmed
        } else {
            plan
        };

        let plan = Cbo::new(self.catalog)
            .with_gsi(self.gsi_available)
            .optimize(&plan, reorder, &mut trace)?;

        trace.dump();
        debug!(rules = trace.len(), root = plan.name(), "Optimized query");
        Ok(Optimized {
            plan,
            cache_policy: CachePolicy::for_statement(statement),
            trace,
        })
    }

    /// Bind views to data nodes for `params` and apply the materialization pass.
    pub fn route(&self, optimized: &Optimized, params: &[Value]) -> Result<Optimized, PlanError> {
        let mut trace = optimized.trace.clone();
        let routed = ScanRouter::new(self.catalog, self.default_schema, params)
            .with_global_read(self.options.global_read)
            .route(&optimized.plan, &mut trace)?;
        let plan = materialize(&routed, &mut trace);
        Ok(Optimized {
            plan,
            cache_policy: optimized.cache_policy,
            trace,
        })
    }

    pub fn compile(&self, statement: &Statement, params: &[Value]) -> Result<CompiledPlan, PlanError> {
        match statement {
            Statement::Select(_) => {
                let optimized = self.optimize(statement)?;
                Ok(CompiledPlan::Query(self.route(&optimized, params)?))
            }
            _ => Ok(CompiledPlan::Mutation(self.compile_mutation(statement, params)?)),
        }
    }

    /// Route INSERT/UPDATE/DELETE straight to per-node statements.
    pub fn compile_mutation(&self, statement: &Statement, params: &[Value]) -> Result<MutationPlan, PlanError> {
        let logical = self.bind(statement)?;
        let RelNode::TableModify { table: id, op, input, .. } = logical.as_ref() else {
            return Err(PlanError::UnexpectedPlan {
                expected: "TableModify",
                found: logical.name(),
            });
        };
        let table = self.table(id)?;
        let table_type = table.table_type();
        if table_type == TableType::Custom {
            return Err(PlanError::UnsupportedTableType {
                table: id.to_string(),
                table_type,
            });
        }

        let plan = match statement {
            Statement::Insert(_) => {
                let routing = InsertRewriter::new(self.default_schema, self.sequence).route(statement, &table, params)?;
                MutationPlan {
                    table: id.clone(),
                    table_type,
                    op: *op,
                    statements: routing.statements,
                    insert: Some(routing.plan),
                    generated_ids: routing.generated_ids,
                }
            }
            Statement::Update(_) | Statement::Delete(_) => {
                if let Statement::Update(update) = statement {
                    if let Some(a) = update.assignments.iter().find(|a| table.is_sharding_key(&a.column)) {
                        return Err(RouteError::ShardingKeyUpdate {
                            table: id.to_string(),
                            column: a.column.clone(),
                        }
                        .into());
                    }
                }
                let (alias, predicate) = match input.as_ref() {
                    RelNode::Filter { input, predicate } => (scan_alias(input), Some(predicate)),
                    other => (scan_alias(other), None),
                };
                let condition = PredicateAnalyzer::new(&table)
                    .with_qualifier(&alias)
                    .analyze(predicate);
                let resolution = DistributionResolver::resolve(
                    &table,
                    ShardingInput::Condition {
                        condition: &condition,
                        params,
                    },
                )?;
                if resolution.broadcast {
                    debug!(table = %id, nodes = resolution.nodes.len(), "Shard resolution unknown, broadcasting");
                }
                let statements = StatementRewriter::new(self.default_schema).rewrite_dml(
                    statement,
                    &table,
                    &condition,
                    &resolution.nodes,
                    params,
                )?;
                MutationPlan {
                    table: id.clone(),
                    table_type,
                    op: *op,
                    statements,
                    insert: None,
                    generated_ids: Vec::new(),
                }
            }
            Statement::Select(_) => {
                return Err(PlanError::UnexpectedPlan {
                    expected: "TableModify",
                    found: "Select",
                })
            }
        };
        debug!(table = %plan.table, statements = plan.statements.len(), "Compiled mutation");
        Ok(plan)
    }

    fn table(&self, id: &TableId) -> Result<Arc<LogicalTable>, PlanError> {
        self.catalog
            .get_table(&id.schema, &id.table)
            .ok_or_else(|| PlanError::UnknownTable(id.to_string()))
    }
}

fn scan_alias(node: &RelNode) -> String {
    match node {
        RelNode::TableScan { alias, .. } => alias.clone(),
        _ => String::new(),
    }
}
