//! Planning module for Stackform.
//!
//! This module turns declarations and the State Record into an ordered,
//! staged plan and executes it:
//! - Dependency graph construction and cycle detection
//! - Refresh and attribute-level diffing
//! - Step generation, ordering and staging
//! - Execution with retries and per-step persistence

mod diff;
mod engine;
mod executor;
mod graph;
mod plan;

pub use diff::{
    AttributeChange, ChangeKind, DiffEngine, DiffResult, Observed, PlannedValue, ResourceChange,
};
pub use engine::Planner;
pub use executor::{ActionResult, ActionStatus, ExecutionResult, PlanExecutor};
pub use graph::DependencyGraph;
pub use plan::{ActionType, Plan, PlanMode, PlannedAction};
