//! Structured record of the rewrites applied during one compilation

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Decorrelate,
    Rbo,
    JoinReorder,
    Trim,
    Cbo,
    Routing,
    Materialize,
    Mutation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Decorrelate => "decorrelate",
            Phase::Rbo => "rbo",
            Phase::JoinReorder => "join_reorder",
            Phase::Trim => "trim",
            Phase::Cbo => "cbo",
            Phase::Routing => "routing",
            Phase::Materialize => "materialize",
            Phase::Mutation => "mutation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub phase: Phase,
    pub rule: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompileTrace {
    events: Vec<TraceEvent>,
}

impl CompileTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, phase: Phase, rule: &str, detail: impl Into<String>) {
        self.events.push(TraceEvent {
            phase,
            rule: rule.to_string(),
            detail: detail.into(),
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Did `rule` fire at least once?
    pub fn fired(&self, rule: &str) -> bool {
        self.events.iter().any(|e| e.rule == rule)
    }

    /// Rules fired during `phase`, in order.
    pub fn rules(&self, phase: Phase) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.phase == phase)
            .map(|e| e.rule.as_str())
            .collect()
    }

    pub fn extend(&mut self, other: CompileTrace) {
        self.events.extend(other.events);
    }

    /// Emit every event at debug level.
    pub fn dump(&self) {
        for event in &self.events {
            tracing::debug!(phase = %event.phase, rule = %event.rule, detail = %event.detail, "compile step");
        }
    }
}
