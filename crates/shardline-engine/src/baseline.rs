//! Plan baselines: optimized plans stored under a statement fingerprint
//!
//! A baseline groups the plans recorded for one fingerprint. When a fix plan
//! is pinned it always wins; otherwise the first stored plan is reused.

use crate::EngineError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardline_ast::Statement;
use shardline_ir::PlanRef;
use shardline_planner::{CachePolicy, CompileTrace, Optimized, PlanError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("Unknown baseline: {0}")]
    UnknownBaseline(Uuid),

    #[error("Failed to encode plan: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub id: Uuid,
    pub fingerprint: String,
    pub sql: String,
    /// Plan ids in insertion order.
    pub plans: Vec<Uuid>,
    pub fix_plan: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Baseline {
    pub fn new(fingerprint: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.into(),
            sql: sql.into(),
            plans: Vec::new(),
            fix_plan: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselinePlan {
    pub id: Uuid,
    pub baseline_id: Uuid,
    pub sql: String,
    /// JSON encoding of the optimized plan.
    pub rel: String,
    pub created_at: DateTime<Utc>,
}

impl BaselinePlan {
    pub fn encode(baseline: &Baseline, plan: &PlanRef) -> Result<Self, BaselineError> {
        Ok(Self {
            id: Uuid::new_v4(),
            baseline_id: baseline.id,
            sql: baseline.sql.clone(),
            rel: serde_json::to_string(plan)?,
            created_at: Utc::now(),
        })
    }

    pub fn decode(&self) -> Result<PlanRef, BaselineError> {
        Ok(serde_json::from_str(&self.rel)?)
    }
}

/// Storage for baselines and their plans.
pub trait PlanPersistor: Send + Sync {
    fn load_by_fingerprint(&self, fingerprint: &str) -> Option<Baseline>;

    /// Insert `baseline` unless its fingerprint is already known; returns the
    /// stored baseline either way.
    fn save_baseline(&self, baseline: Baseline) -> Baseline;

    /// Attach `plan` to its baseline. A plan whose `rel` is already stored is
    /// not added again; the stored copy is returned. `fix` pins the plan.
    fn save_plan(&self, plan: BaselinePlan, fix: bool) -> Result<BaselinePlan, BaselineError>;

    fn get_plan(&self, id: Uuid) -> Option<BaselinePlan>;

    fn list_plans(&self, baseline_id: Uuid) -> Vec<BaselinePlan>;

    /// Remove a baseline together with its plans.
    fn delete_baseline(&self, id: Uuid) -> bool;

    fn delete_plan(&self, id: Uuid) -> bool;

    fn clear(&self);
}

#[derive(Debug, Default)]
struct Store {
    baselines: IndexMap<Uuid, Baseline>,
    by_fingerprint: HashMap<String, Uuid>,
    plans: IndexMap<Uuid, BaselinePlan>,
}

#[derive(Debug, Default)]
pub struct MemoryPlanPersistor {
    store: RwLock<Store>,
}

impl MemoryPlanPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline_count(&self) -> usize {
        self.store.read().baselines.len()
    }
}

impl PlanPersistor for MemoryPlanPersistor {
    fn load_by_fingerprint(&self, fingerprint: &str) -> Option<Baseline> {
        let store = self.store.read();
        let id = store.by_fingerprint.get(fingerprint)?;
        store.baselines.get(id).cloned()
    }

    fn save_baseline(&self, baseline: Baseline) -> Baseline {
        let mut store = self.store.write();
        if let Some(existing) = store.by_fingerprint.get(&baseline.fingerprint).and_then(|id| store.baselines.get(id)) {
            return existing.clone();
        }
        store.by_fingerprint.insert(baseline.fingerprint.clone(), baseline.id);
        store.baselines.insert(baseline.id, baseline.clone());
        baseline
    }

    fn save_plan(&self, plan: BaselinePlan, fix: bool) -> Result<BaselinePlan, BaselineError> {
        let mut store = self.store.write();
        let Store { baselines, plans, .. } = &mut *store;
        let baseline = baselines
            .get_mut(&plan.baseline_id)
            .ok_or(BaselineError::UnknownBaseline(plan.baseline_id))?;

        let stored = baseline
            .plans
            .iter()
            .filter_map(|id| plans.get(id))
            .find(|p| p.rel == plan.rel)
            .cloned();
        let stored = match stored {
            Some(existing) => existing,
            None => {
                baseline.plans.push(plan.id);
                plans.insert(plan.id, plan.clone());
                plan
            }
        };
        if fix {
            baseline.fix_plan = Some(stored.id);
        }
        Ok(stored)
    }

    fn get_plan(&self, id: Uuid) -> Option<BaselinePlan> {
        self.store.read().plans.get(&id).cloned()
    }

    fn list_plans(&self, baseline_id: Uuid) -> Vec<BaselinePlan> {
        let store = self.store.read();
        store
            .baselines
            .get(&baseline_id)
            .map(|b| b.plans.iter().filter_map(|id| store.plans.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    fn delete_baseline(&self, id: Uuid) -> bool {
        let mut store = self.store.write();
        let Some(baseline) = store.baselines.shift_remove(&id) else {
            return false;
        };
        store.by_fingerprint.remove(&baseline.fingerprint);
        for plan in &baseline.plans {
            store.plans.shift_remove(plan);
        }
        true
    }

    fn delete_plan(&self, id: Uuid) -> bool {
        let mut store = self.store.write();
        let Some(plan) = store.plans.shift_remove(&id) else {
            return false;
        };
        if let Some(baseline) = store.baselines.get_mut(&plan.baseline_id) {
            baseline.plans.retain(|p| *p != id);
            if baseline.fix_plan == Some(id) {
                baseline.fix_plan = None;
            }
        }
        true
    }

    fn clear(&self) {
        let mut store = self.store.write();
        store.baselines.clear();
        store.by_fingerprint.clear();
        store.plans.clear();
    }
}

/// Outcome of a baseline lookup.
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub optimized: Optimized,
    /// The plan came from a stored baseline.
    pub hit: bool,
}

#[derive(Clone)]
pub struct PlanManager {
    persistor: Arc<dyn PlanPersistor>,
}

impl PlanManager {
    pub fn new(persistor: Arc<dyn PlanPersistor>) -> Self {
        Self { persistor }
    }

    pub fn persistor(&self) -> &Arc<dyn PlanPersistor> {
        &self.persistor
    }

    /// Stored plan for `statement`, or the result of `compile`, persisted when
    /// its cache policy allows.
    pub fn get_or_compile<F>(&self, statement: &Statement, compile: F) -> Result<CachedPlan, EngineError>
    where
        F: FnOnce() -> Result<Optimized, PlanError>,
    {
        let fingerprint = statement.fingerprint();
        let policy = CachePolicy::for_statement(statement);
        // Literal statements share a fingerprint with their parameterized form
        if !policy.cacheable() {
            debug!(fingerprint = %fingerprint, policy = ?policy, "Plan not cacheable");
            return Ok(CachedPlan {
                optimized: compile()?,
                hit: false,
            });
        }
        if let Some(plan) = self.lookup(&fingerprint)? {
            debug!(fingerprint = %fingerprint, "Plan baseline hit");
            return Ok(CachedPlan {
                optimized: Optimized {
                    plan,
                    cache_policy: policy,
                    trace: CompileTrace::new(),
                },
                hit: true,
            });
        }

        let optimized = compile()?;
        if optimized.cache_policy.cacheable() {
            let baseline = self
                .persistor
                .save_baseline(Baseline::new(fingerprint.clone(), statement.fingerprint_sql()));
            let plan = BaselinePlan::encode(&baseline, &optimized.plan)?;
            let stored = self.persistor.save_plan(plan, false)?;
            debug!(fingerprint = %fingerprint, plan = %stored.id, "Stored plan baseline");
        } else {
            debug!(fingerprint = %fingerprint, policy = ?optimized.cache_policy, "Plan not cacheable");
        }
        Ok(CachedPlan { optimized, hit: false })
    }

    fn lookup(&self, fingerprint: &str) -> Result<Option<PlanRef>, BaselineError> {
        let Some(baseline) = self.persistor.load_by_fingerprint(fingerprint) else {
            return Ok(None);
        };
        let chosen = baseline
            .fix_plan
            .and_then(|id| self.persistor.get_plan(id))
            .or_else(|| baseline.plans.first().and_then(|id| self.persistor.get_plan(*id)));
        chosen.map(|p| p.decode()).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_ir::{RelNode, Schema};

    fn plan(target: &str) -> PlanRef {
        Arc::new(RelNode::RoutedScan {
            target: target.to_string(),
            sql: "SELECT 1".to_string(),
            params: vec![],
            schema: Schema::empty(),
        })
    }

    #[test]
    fn test_save_baseline_is_insert_if_absent() {
        let persistor = MemoryPlanPersistor::new();
        let first = persistor.save_baseline(Baseline::new("fp", "SELECT ?"));
        let second = persistor.save_baseline(Baseline::new("fp", "SELECT ?"));
        assert_eq!(first.id, second.id);
        assert_eq!(persistor.baseline_count(), 1);
    }

    #[test]
    fn test_duplicate_plan_not_stored_twice() {
        let persistor = MemoryPlanPersistor::new();
        let baseline = persistor.save_baseline(Baseline::new("fp", "SELECT ?"));
        let a = persistor.save_plan(BaselinePlan::encode(&baseline, &plan("N1")).unwrap(), false).unwrap();
        let b = persistor.save_plan(BaselinePlan::encode(&baseline, &plan("N1")).unwrap(), false).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(persistor.list_plans(baseline.id).len(), 1);
    }

    #[test]
    fn test_fix_plan_wins_and_delete_cascades() {
        let persistor = Arc::new(MemoryPlanPersistor::new());
        let baseline = persistor.save_baseline(Baseline::new("fp", "SELECT ?"));
        persistor.save_plan(BaselinePlan::encode(&baseline, &plan("N1")).unwrap(), false).unwrap();
        let fixed = persistor.save_plan(BaselinePlan::encode(&baseline, &plan("N2")).unwrap(), true).unwrap();

        let manager = PlanManager::new(persistor.clone());
        let chosen = manager.lookup("fp").unwrap().unwrap();
        assert_eq!(chosen, plan("N2"));

        assert!(persistor.delete_plan(fixed.id));
        assert_eq!(manager.lookup("fp").unwrap().unwrap(), plan("N1"));

        assert!(persistor.delete_baseline(baseline.id));
        assert!(persistor.load_by_fingerprint("fp").is_none());
        assert!(persistor.list_plans(baseline.id).is_empty());
        assert!(!persistor.delete_baseline(baseline.id));
    }

    #[test]
    fn test_plan_for_unknown_baseline_rejected() {
        let persistor = MemoryPlanPersistor::new();
        let orphan = Baseline::new("fp", "SELECT 1");
        let err = persistor
            .save_plan(BaselinePlan::encode(&orphan, &plan("N1")).unwrap(), false)
            .unwrap_err();
        assert!(matches!(err, BaselineError::UnknownBaseline(id) if id == orphan.id));
    }
}
