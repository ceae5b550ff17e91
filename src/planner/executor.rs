//! Plan executor.
//!
//! Runs plan steps against the provider, resolving each step's attributes
//! against the State Record as it stands when the step is issued, and
//! persisting the record after every successful step. A failed step stops
//! the run; there is no rollback. With parallelism above one, steps run
//! stage by stage with a bounded number of concurrent provider calls.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::declaration::{AttributeRef, Expr, Output, Resolved};
use crate::error::{ApplyError, ProviderError, Result, StackformError};
use crate::provider::{Attributes, Provider, ProviderResource, RetryPolicy};
use crate::state::{HistoryEntry, HistoryOperation, OutputValue, ResourceRecord, StateRecord, StateStore};

use super::plan::{ActionType, Plan, PlanMode, PlannedAction};

/// Executor for plans.
pub struct PlanExecutor<'a> {
    provider: Arc<dyn Provider>,
    store: &'a dyn StateStore,
    retry: RetryPolicy,
    parallelism: usize,
    cancel: Arc<AtomicBool>,
    lock_id: Option<String>,
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    /// The step completed and was recorded.
    Succeeded,
    /// The step failed.
    Failed,
    /// The step was never issued.
    NotAttempted,
}

/// Result of executing a single step.
#[derive(Debug, Clone)]
pub struct ActionResult {
    /// Index in the plan.
    pub index: usize,
    /// Resource address.
    pub address: String,
    /// Step type.
    pub action_type: ActionType,
    /// Human-readable step description.
    pub description: String,
    /// Outcome.
    pub status: ActionStatus,
    /// Error message (if failed).
    pub error: Option<String>,
}

/// Result of executing the entire plan.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Per-step results, in plan order.
    pub results: Vec<ActionResult>,
    /// Number of successful steps.
    pub succeeded: usize,
    /// Number of failed steps.
    pub failed: usize,
    /// Number of steps never issued.
    pub not_attempted: usize,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Why the run stopped early, if it did.
    pub failure: Option<ApplyError>,
    /// The State Record as last saved.
    pub state: StateRecord,
}

/// A provider call with its inputs resolved.
#[derive(Debug)]
enum StepCall {
    Create {
        kind: String,
        config: Attributes,
    },
    Update {
        kind: String,
        id: String,
        config: Attributes,
        request: Attributes,
    },
    Delete {
        kind: String,
        ids: Vec<String>,
    },
    Skip,
}

#[derive(Debug)]
enum StepOutcome {
    Created {
        resource: ProviderResource,
        config: Attributes,
    },
    Updated {
        attributes: Attributes,
        config: Attributes,
    },
    Deleted(Vec<String>),
    Skipped,
}

/// Bookkeeping shared by the sequential and staged runners.
struct Tracker {
    results: Vec<ActionResult>,
    failure: Option<ApplyError>,
    cancelled: bool,
}

impl Tracker {
    fn new(plan: &Plan) -> Self {
        let results = plan
            .actions
            .iter()
            .enumerate()
            .map(|(index, action)| ActionResult {
                index,
                address: action.address.clone(),
                action_type: action.action_type,
                description: action.description(),
                status: ActionStatus::NotAttempted,
                error: None,
            })
            .collect();
        Self {
            results,
            failure: None,
            cancelled: false,
        }
    }

    const fn stopped(&self) -> bool {
        self.failure.is_some() || self.cancelled
    }

    fn succeed(&mut self, index: usize) {
        self.results[index].status = ActionStatus::Succeeded;
    }

    fn fail(&mut self, index: usize, error: ApplyError) {
        error!("{}: {error}", self.results[index].description);
        self.results[index].status = ActionStatus::Failed;
        self.results[index].error = Some(error.to_string());
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn count(&self, status: ActionStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

impl<'a> PlanExecutor<'a> {
    /// Creates a sequential executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: &'a dyn StateStore) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
            parallelism: 1,
            cancel: Arc::new(AtomicBool::new(false)),
            lock_id: None,
        }
    }

    /// Sets the retry policy for provider calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum number of concurrent provider calls.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Shares a cancel flag; once set, no further step is issued.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Saves only while the given state lock is still held.
    #[must_use]
    pub fn with_lock(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = Some(lock_id.into());
        self
    }

    async fn persist(&self, state: &StateRecord) -> Result<()> {
        match &self.lock_id {
            Some(lock_id) => self.store.save_locked(state, lock_id).await,
            None => self.store.save(state).await,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Executes a plan.
    ///
    /// Step failures and cancellation are reported in the result, not as
    /// errors; the record then reflects exactly the steps that succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the State Record cannot be saved.
    pub async fn execute(&self, plan: &Plan, mut state: StateRecord) -> Result<ExecutionResult> {
        let mut tracker = Tracker::new(plan);

        if plan.is_empty() {
            return self.finish_unchanged(plan, state, tracker).await;
        }

        info!(
            "Executing plan with {} actions (parallelism {})",
            plan.actions.len(),
            self.parallelism
        );

        if self.parallelism > 1 {
            self.run_staged(plan, &mut state, &mut tracker).await?;
        } else {
            self.run_sequential(plan, &mut state, &mut tracker).await?;
        }

        if tracker.failure.is_none() && tracker.cancelled {
            tracker.failure = Some(ApplyError::Cancelled {
                completed: tracker.count(ActionStatus::Succeeded),
                total: plan.actions.len(),
            });
        }

        if tracker.failure.is_none() {
            match plan.mode {
                PlanMode::Apply => match evaluate_outputs(&plan.outputs, &state) {
                    Ok(outputs) => {
                        state.outputs = outputs;
                        state.declaration_hash.clone_from(&plan.declaration_hash);
                    }
                    Err(e) => tracker.failure = Some(e),
                },
                PlanMode::Destroy => {
                    state.outputs.clear();
                    state.declaration_hash.clear();
                }
            }
        }

        let operation = match plan.mode {
            PlanMode::Apply => HistoryOperation::Apply,
            PlanMode::Destroy => HistoryOperation::Destroy,
        };
        let mut addresses: Vec<String> = plan.actions.iter().map(|a| a.address.clone()).collect();
        addresses.dedup();
        let entry = match &tracker.failure {
            None => HistoryEntry::new(operation, &plan.declaration_hash, addresses),
            Some(e) => {
                HistoryEntry::failed(operation, &plan.declaration_hash, addresses, &e.to_string())
            }
        };
        state.add_history(entry);
        state.touch();
        self.persist(&state).await?;

        Ok(Self::summarize(tracker, state))
    }

    /// Records outputs and the fingerprint for a plan with nothing to do.
    async fn finish_unchanged(
        &self,
        plan: &Plan,
        mut state: StateRecord,
        mut tracker: Tracker,
    ) -> Result<ExecutionResult> {
        let (outputs, hash) = match plan.mode {
            PlanMode::Apply => match evaluate_outputs(&plan.outputs, &state) {
                Ok(outputs) => (outputs, plan.declaration_hash.clone()),
                Err(e) => {
                    tracker.failure = Some(e);
                    return Ok(Self::summarize(tracker, state));
                }
            },
            PlanMode::Destroy => (BTreeMap::new(), String::new()),
        };

        if outputs != state.outputs || hash != state.declaration_hash {
            debug!("Recording outputs for an unchanged plan");
            state.outputs = outputs;
            state.declaration_hash = hash;
            state.touch();
            self.persist(&state).await?;
        }
        Ok(Self::summarize(tracker, state))
    }

    async fn run_sequential(
        &self,
        plan: &Plan,
        state: &mut StateRecord,
        tracker: &mut Tracker,
    ) -> Result<()> {
        for (index, action) in plan.actions.iter().enumerate() {
            if self.is_cancelled() {
                warn!("Cancelled before {}", action.description());
                tracker.cancelled = true;
                break;
            }

            let call = match prepare(action, state) {
                Ok(call) => call,
                Err(e) => {
                    tracker.fail(index, e);
                    break;
                }
            };

            info!("{action}");
            match run_call(self.provider.as_ref(), &self.retry, &action.address, call).await {
                Ok(outcome) => {
                    commit(state, action, outcome);
                    state.touch();
                    self.persist(state).await?;
                    tracker.succeed(index);
                }
                Err(e) => {
                    tracker.fail(index, action_failed(action, &e));
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run_staged(
        &self,
        plan: &Plan,
        state: &mut StateRecord,
        tracker: &mut Tracker,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let halt = Arc::new(AtomicBool::new(false));
        let mut save_error = None;

        for (number, stage) in plan.stages.iter().enumerate() {
            if tracker.stopped() || save_error.is_some() {
                break;
            }
            if self.is_cancelled() {
                warn!("Cancelled before stage {}", number + 1);
                tracker.cancelled = true;
                break;
            }
            debug!("Stage {}: {} actions", number + 1, stage.len());

            let mut tasks = JoinSet::new();
            for &index in stage {
                let action = &plan.actions[index];
                let call = match prepare(action, state) {
                    Ok(call) => call,
                    Err(e) => {
                        tracker.fail(index, e);
                        halt.store(true, Ordering::SeqCst);
                        break;
                    }
                };

                let provider = Arc::clone(&self.provider);
                let semaphore = Arc::clone(&semaphore);
                let halt = Arc::clone(&halt);
                let cancel = Arc::clone(&self.cancel);
                let retry = self.retry.clone();
                let address = action.address.clone();
                let description = action.to_string();

                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (index, None);
                    };
                    if halt.load(Ordering::SeqCst) || cancel.load(Ordering::SeqCst) {
                        return (index, None);
                    }
                    info!("{description}");
                    let outcome = run_call(provider.as_ref(), &retry, &address, call).await;
                    if outcome.is_err() {
                        halt.store(true, Ordering::SeqCst);
                    }
                    (index, Some(outcome))
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (index, outcome) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        halt.store(true, Ordering::SeqCst);
                        save_error.get_or_insert(StackformError::internal(format!(
                            "Apply task failed: {e}"
                        )));
                        continue;
                    }
                };
                let action = &plan.actions[index];
                match outcome {
                    None => {}
                    Some(Ok(outcome)) => {
                        commit(state, action, outcome);
                        state.touch();
                        match self.persist(state).await {
                            Ok(()) => tracker.succeed(index),
                            Err(e) => {
                                halt.store(true, Ordering::SeqCst);
                                save_error.get_or_insert(e);
                            }
                        }
                    }
                    Some(Err(e)) => tracker.fail(index, action_failed(action, &e)),
                }
            }

            if self.is_cancelled() && !tracker.stopped() {
                let pending = tracker
                    .results
                    .iter()
                    .any(|r| r.status == ActionStatus::NotAttempted);
                tracker.cancelled = pending;
            }
        }

        save_error.map_or(Ok(()), Err)
    }

    fn summarize(tracker: Tracker, state: StateRecord) -> ExecutionResult {
        ExecutionResult {
            succeeded: tracker.count(ActionStatus::Succeeded),
            failed: tracker.count(ActionStatus::Failed),
            not_attempted: tracker.count(ActionStatus::NotAttempted),
            cancelled: tracker.cancelled,
            failure: tracker.failure,
            results: tracker.results,
            state,
        }
    }
}

fn action_failed(action: &PlannedAction, error: &StackformError) -> ApplyError {
    ApplyError::ActionFailed {
        address: action.address.clone(),
        action: action.action_type.to_string(),
        message: error.to_string(),
    }
}

/// Resolves attribute references against the live record.
fn state_lookup(state: &StateRecord) -> impl Fn(&AttributeRef) -> Option<Resolved> + '_ {
    move |reference: &AttributeRef| {
        state.get(&reference.address()).map(|record| {
            Resolved::Known(record.attribute(&reference.attribute).cloned().unwrap_or(Value::Null))
        })
    }
}

fn evaluate(address: &str, expr: &Expr, state: &StateRecord) -> std::result::Result<Value, ApplyError> {
    match expr.evaluate(&state_lookup(state)) {
        Ok(Resolved::Known(value)) => Ok(value),
        Ok(Resolved::Unknown) => Err(ApplyError::UnresolvedReference {
            address: address.to_string(),
            reference: String::from("(unknown value)"),
        }),
        Err(reference) => Err(ApplyError::UnresolvedReference {
            address: address.to_string(),
            reference: reference.to_string(),
        }),
    }
}

fn prepare(action: &PlannedAction, state: &StateRecord) -> std::result::Result<StepCall, ApplyError> {
    let kind = action.kind.clone();
    let config = || -> std::result::Result<Attributes, ApplyError> {
        action
            .attributes
            .iter()
            .map(|(name, expr)| Ok((name.clone(), evaluate(&action.address, expr, state)?)))
            .collect()
    };

    match action.action_type {
        ActionType::Create => Ok(StepCall::Create {
            kind,
            config: config()?,
        }),
        ActionType::Update => {
            let Some(record) = state.get(&action.address) else {
                return Err(ApplyError::ActionFailed {
                    address: action.address.clone(),
                    action: action.action_type.to_string(),
                    message: String::from("no recorded instance to update"),
                });
            };
            let config = config()?;
            let mut request = config.clone();
            for name in &action.removed {
                request.insert(name.clone(), Value::Null);
            }
            Ok(StepCall::Update {
                kind,
                id: record.id.clone(),
                config,
                request,
            })
        }
        ActionType::Delete => {
            let ids = match state.get(&action.address) {
                None => Vec::new(),
                Some(record) if action.deposed => record.deposed.clone(),
                Some(record) => vec![record.id.clone()],
            };
            if ids.is_empty() {
                Ok(StepCall::Skip)
            } else {
                Ok(StepCall::Delete { kind, ids })
            }
        }
    }
}

async fn run_call(
    provider: &dyn Provider,
    retry: &RetryPolicy,
    address: &str,
    call: StepCall,
) -> Result<StepOutcome> {
    match call {
        StepCall::Create { kind, config } => {
            let resource = retry
                .run(&format!("create {address}"), || provider.create(&kind, &config))
                .await?;
            debug!("Created {address} as {}", resource.id);
            Ok(StepOutcome::Created { resource, config })
        }
        StepCall::Update {
            kind,
            id,
            config,
            request,
        } => {
            let attributes = retry
                .run(&format!("update {address}"), || provider.update(&kind, &id, &request))
                .await?;
            Ok(StepOutcome::Updated { attributes, config })
        }
        StepCall::Delete { kind, ids } => {
            for id in &ids {
                match retry
                    .run(&format!("delete {address}"), || provider.delete(&kind, id))
                    .await
                {
                    Ok(()) => debug!("Deleted {address} ({id})"),
                    Err(StackformError::Provider(ProviderError::NotFound { .. })) => {
                        debug!("{address} ({id}) was already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(StepOutcome::Deleted(ids))
        }
        StepCall::Skip => Ok(StepOutcome::Skipped),
    }
}

fn commit(state: &mut StateRecord, action: &PlannedAction, outcome: StepOutcome) {
    match outcome {
        StepOutcome::Created { resource, config } => {
            let mut deposed = Vec::new();
            if let Some(prior) = state.get(&action.address) {
                deposed.extend(prior.deposed.iter().cloned());
                if action.create_before_destroy {
                    deposed.push(prior.id.clone());
                }
            }
            let mut record = ResourceRecord::new(&action.kind, &action.name, &resource.id);
            record.config = config;
            record.attributes = resource.attributes;
            record.dependencies.clone_from(&action.resource_dependencies);
            record.deposed = deposed;
            state.set_resource(record);
        }
        StepOutcome::Updated { attributes, config } => {
            if let Some(record) = state.get_mut(&action.address) {
                record.config = config;
                record.attributes = attributes;
                record.dependencies.clone_from(&action.resource_dependencies);
                record.updated_at = Utc::now();
            }
        }
        StepOutcome::Deleted(ids) if action.deposed => {
            if let Some(record) = state.get_mut(&action.address) {
                record.deposed.retain(|id| !ids.contains(id));
            }
        }
        StepOutcome::Deleted(_) => {
            state.remove_resource(&action.address);
        }
        StepOutcome::Skipped => {}
    }
}

fn evaluate_outputs(
    outputs: &[Output],
    state: &StateRecord,
) -> std::result::Result<BTreeMap<String, OutputValue>, ApplyError> {
    outputs
        .iter()
        .map(|output| {
            let value = evaluate(&format!("output.{}", output.name), &output.value, state)?;
            Ok((
                output.name.clone(),
                OutputValue {
                    value,
                    sensitive: output.sensitive,
                    description: output.description.clone(),
                },
            ))
        })
        .collect()
}

impl ExecutionResult {
    /// Returns true if every step succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::NotAttempted => "not attempted",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Execution Summary:")?;
        writeln!(f, "  Succeeded:     {}", self.succeeded)?;
        writeln!(f, "  Failed:        {}", self.failed)?;
        writeln!(f, "  Not attempted: {}", self.not_attempted)?;

        if let Some(failure) = &self.failure {
            writeln!(f, "\nStopped: {failure}")?;
            for result in self.results.iter().filter(|r| r.status != ActionStatus::Succeeded) {
                write!(f, "  - {} ({})", result.description, result.status)?;
                if let Some(error) = &result.error {
                    write!(f, ": {error}")?;
                }
                writeln!(f)?;
            }
        }

        Ok(())
    }
}
