//! Planner entry point.
//!
//! Builds the dependency graph, rejects cycles before any provider call,
//! refreshes recorded resources, diffs and turns the diff into a plan.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::declaration::{DeclarationHasher, Declarations};
use crate::error::Result;
use crate::provider::{Provider, RetryPolicy};
use crate::state::StateRecord;

use super::diff::{DiffEngine, Observed};
use super::graph::DependencyGraph;
use super::plan::{Plan, PlanMode};

/// Produces plans.
pub struct Planner {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
    refresh: bool,
    mode: PlanMode,
}

impl Planner {
    /// Creates a planner that refreshes and plans an apply.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            refresh: true,
            mode: PlanMode::Apply,
        }
    }

    /// Sets the retry policy for refresh reads.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables refreshing recorded resources.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sets the planning mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: PlanMode) -> Self {
        self.mode = mode;
        self
    }

    /// Computes a plan.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the declarations form a cycle (no
    /// provider call is made), or a provider error if a refresh read fails.
    #[instrument(skip_all, fields(mode = ?self.mode))]
    pub async fn plan(&self, declarations: &Declarations, state: &StateRecord) -> Result<Plan> {
        let graph = match self.mode {
            PlanMode::Apply => DependencyGraph::for_plan(declarations, state)?,
            PlanMode::Destroy => DependencyGraph::from_state(state),
        };
        let order = graph.topological_order()?;
        debug!("Dependency order: {}", order.join(", "));

        let observed = if self.refresh && self.mode == PlanMode::Apply {
            self.refresh(state, &order).await?
        } else {
            Observed::new()
        };

        let diff = DiffEngine::new().compute_diff(declarations, state, &observed, &order, self.mode);
        let hash = DeclarationHasher::new().hash_declarations(declarations);
        let plan = Plan::build(diff, declarations, self.mode, &hash)?;

        info!(
            "Planned {} actions in {} stages",
            plan.action_count(),
            plan.stages.len()
        );
        Ok(plan)
    }

    /// Reads every recorded resource, in dependency order.
    async fn refresh(&self, state: &StateRecord, order: &[String]) -> Result<Observed> {
        let mut observed = Observed::new();

        for address in order {
            let Some(record) = state.get(address) else {
                continue;
            };
            let what = format!("refresh {address}");
            let attributes = self
                .retry
                .run(&what, || self.provider.read(&record.kind, &record.id))
                .await?;
            if attributes.is_none() {
                info!("{address} no longer exists at the provider");
            }
            observed.insert(address.clone(), attributes);
        }

        debug!("Refreshed {} resources", observed.len());
        Ok(observed)
    }
}
