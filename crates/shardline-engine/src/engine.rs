//! Statement entry point: compile, consult baselines, route, execute

use crate::baseline::{CachedPlan, MemoryPlanPersistor, PlanManager, PlanPersistor};
use crate::catalog::{InMemorySequence, StaticCatalog};
use crate::config::Config;
use crate::EngineError;
use serde::Serialize;
use shardline_ast::Statement;
use shardline_exec::{ExecutionReport, GsiService, Rows, ShardedDmlExecutor, TransactionSession, ViewExecutor};
use shardline_ir::Value;
use shardline_planner::{explain, CompiledPlan, SqlCompiler};
use shardline_registry::ShardingFunctionRegistry;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatementResult {
    Rows(Rows),
    Update(ExecutionReport),
}

pub struct Engine {
    config: Config,
    catalog: StaticCatalog,
    sequence: InMemorySequence,
    plans: Option<PlanManager>,
    gsi: Option<Arc<dyn GsiService + Send + Sync>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self, EngineError> {
        Self::with_registry(config, &ShardingFunctionRegistry::new())
    }

    /// Build with a registry that may carry extra sharding functions.
    pub fn with_registry(config: Config, registry: &ShardingFunctionRegistry) -> Result<Self, EngineError> {
        let catalog = StaticCatalog::from_topology(&config.topology, registry)?;
        let plans = config
            .plan_cache
            .enabled
            .then(|| PlanManager::new(Arc::new(MemoryPlanPersistor::new())));
        info!(
            tables = catalog.len(),
            default_schema = %config.topology.default_schema,
            plan_cache = plans.is_some(),
            "Engine ready"
        );
        Ok(Self {
            config,
            catalog,
            sequence: InMemorySequence::new(),
            plans,
            gsi: None,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        Self::new(Config::load(path)?)
    }

    /// Store baselines in `persistor` instead of memory. Enables the plan cache.
    pub fn with_plan_persistor(mut self, persistor: Arc<dyn PlanPersistor>) -> Self {
        self.plans = Some(PlanManager::new(persistor));
        self
    }

    /// Maintain global secondary indexes through `gsi`; also lets the
    /// optimizer probe index views.
    pub fn with_gsi(mut self, gsi: Arc<dyn GsiService + Send + Sync>) -> Self {
        self.gsi = Some(gsi);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &StaticCatalog {
        &self.catalog
    }

    pub fn sequence(&self) -> &InMemorySequence {
        &self.sequence
    }

    pub fn plan_manager(&self) -> Option<&PlanManager> {
        self.plans.as_ref()
    }

    fn compiler(&self) -> SqlCompiler<'_> {
        SqlCompiler::new(&self.catalog, &self.config.topology.default_schema)
            .with_options(self.config.optimizer.clone())
            .with_gsi(self.gsi.is_some())
            .with_sequence(&self.sequence)
    }

    /// Optimized, unrouted plan of a query, through the baseline cache when enabled.
    pub fn optimize(&self, statement: &Statement) -> Result<CachedPlan, EngineError> {
        let compiler = self.compiler();
        match &self.plans {
            Some(plans) => plans.get_or_compile(statement, || compiler.optimize(statement)),
            None => Ok(CachedPlan {
                optimized: compiler.optimize(statement)?,
                hit: false,
            }),
        }
    }

    pub fn compile(&self, statement: &Statement, params: &[Value]) -> Result<CompiledPlan, EngineError> {
        let compiler = self.compiler();
        match statement {
            Statement::Select(_) => {
                let cached = self.optimize(statement)?;
                Ok(CompiledPlan::Query(compiler.route(&cached.optimized, params)?))
            }
            _ => Ok(CompiledPlan::Mutation(compiler.compile_mutation(statement, params)?)),
        }
    }

    /// Physical plan tree of a query, or one line per statement of a mutation.
    pub fn explain(&self, statement: &Statement, params: &[Value]) -> Result<String, EngineError> {
        Ok(match self.compile(statement, params)? {
            CompiledPlan::Query(optimized) => explain(&optimized.plan),
            CompiledPlan::Mutation(mutation) => mutation.statements.explain().join("\n"),
        })
    }

    pub fn execute(
        &self,
        statement: &Statement,
        params: &[Value],
        session: &dyn TransactionSession,
    ) -> Result<StatementResult, EngineError> {
        match self.compile(statement, params)? {
            CompiledPlan::Query(routed) => {
                let rows = ViewExecutor::new(session).execute(&routed.plan)?;
                debug!(tx = session.transaction_id(), rows = rows.len(), "Query executed");
                Ok(StatementResult::Rows(rows))
            }
            CompiledPlan::Mutation(mutation) => {
                let executor = match &self.gsi {
                    Some(gsi) => ShardedDmlExecutor::new().with_gsi(gsi.as_ref()),
                    None => ShardedDmlExecutor::new(),
                };
                let mut report = executor.execute(mutation.table_type, &mutation.statements, session)?;
                if report.result.last_insert_id.is_none() {
                    report.result.last_insert_id = mutation.generated_ids.first().copied();
                }
                debug!(
                    tx = session.transaction_id(),
                    table = %mutation.table,
                    statements = mutation.statements.len(),
                    affected = report.result.affected_rows,
                    "Mutation executed"
                );
                Ok(StatementResult::Update(report))
            }
        }
    }
}
