//! Plan types and construction.
//!
//! This module turns a diff into executable steps. A replacement becomes a
//! delete followed by a create, or with `create_before_destroy` a create
//! followed by deletion of the deposed instance. Steps are ordered so that
//! applies follow their dependencies and deletes follow every step that
//! still needs the resource, then grouped into stages of mutually
//! independent steps.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::declaration::{Declarations, Expr, Output};
use crate::error::{PlanError, Result};

use super::diff::{ChangeKind, DiffResult, PlannedValue, ResourceChange};
use super::graph::kahn_order;

/// What the plan is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Converge recorded state onto the declarations.
    #[default]
    Apply,
    /// Tear down every recorded resource.
    Destroy,
}

/// An executable plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Planning mode.
    pub mode: PlanMode,
    /// Fingerprint of the declarations this plan is based on.
    pub declaration_hash: String,
    /// Per-resource changes in dependency order.
    pub changes: Vec<ResourceChange>,
    /// Steps in execution order.
    pub actions: Vec<PlannedAction>,
    /// Action indices grouped into stages that may run concurrently.
    pub stages: Vec<Vec<usize>>,
    /// Outputs to evaluate after apply.
    #[serde(skip)]
    pub outputs: Vec<Output>,
}

/// A single planned step.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Resource address.
    pub address: String,
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Reason for this action.
    pub reason: String,
    /// Delete targets the deposed instances rather than the current one.
    pub deposed: bool,
    /// Create keeps the current instance as deposed until it is deleted.
    pub create_before_destroy: bool,
    /// Desired attributes for create and update.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Expr>,
    /// Attributes to clear on update.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    /// Resources this resource depends on after the step.
    pub resource_dependencies: BTreeSet<String>,
    /// Action indices that must complete first.
    pub dependencies: Vec<usize>,
}

/// Types of steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new instance.
    Create,
    /// Update an instance in place.
    Update,
    /// Delete an instance.
    Delete,
}

/// Step indices generated for one resource.
#[derive(Debug, Default, Clone, Copy)]
struct ResourceSteps {
    apply: Option<usize>,
    delete: Option<usize>,
    delete_deposed: Option<usize>,
}

impl ResourceSteps {
    fn deletes(self) -> impl Iterator<Item = usize> {
        self.delete_deposed.into_iter().chain(self.delete)
    }
}

#[derive(Debug, Default)]
struct StepGraph {
    actions: Vec<PlannedAction>,
    edges: Vec<BTreeSet<usize>>,
}

impl StepGraph {
    fn push(&mut self, action: PlannedAction) -> usize {
        self.actions.push(action);
        self.edges.push(BTreeSet::new());
        self.actions.len() - 1
    }

    /// Records that `step` runs after `on`.
    fn after(&mut self, step: usize, on: usize) {
        if step != on {
            self.edges[step].insert(on);
        }
    }
}

impl Plan {
    /// Builds a plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns an error if the steps cannot be ordered.
    pub fn build(
        diff: DiffResult,
        declarations: &Declarations,
        mode: PlanMode,
        declaration_hash: &str,
    ) -> Result<Self> {
        let mut graph = StepGraph::default();
        let mut steps: HashMap<String, ResourceSteps> = HashMap::new();

        for change in &diff.changes {
            let resource_steps = Self::generate_steps(&mut graph, change, declarations);
            steps.insert(change.address.clone(), resource_steps);
        }

        for change in &diff.changes {
            Self::link(&mut graph, change, &steps);
        }

        let order = kahn_order(&graph.edges).map_err(|blocked| {
            let addresses: BTreeSet<&str> = blocked
                .iter()
                .map(|&i| graph.actions[i].address.as_str())
                .collect();
            PlanError::DependencyResolutionFailed {
                message: format!(
                    "steps for {} cannot be ordered",
                    addresses.into_iter().collect::<Vec<_>>().join(", ")
                ),
            }
        })?;

        let (actions, stages) = Self::arrange(graph, &order);

        Ok(Self {
            created_at: Utc::now(),
            mode,
            declaration_hash: declaration_hash.to_string(),
            changes: diff.changes,
            actions,
            stages,
            outputs: match mode {
                PlanMode::Apply => declarations.outputs.clone(),
                PlanMode::Destroy => Vec::new(),
            },
        })
    }

    fn generate_steps(
        graph: &mut StepGraph,
        change: &ResourceChange,
        declarations: &Declarations,
    ) -> ResourceSteps {
        let mut steps = ResourceSteps::default();
        let has_deposed = !change.deposed.is_empty();
        let desired = declarations.get(&change.address);

        let apply = |action_type: ActionType| {
            let mut action = PlannedAction::for_change(change, action_type);
            if let Some(resource) = desired {
                action.attributes = resource.attributes.clone();
            }
            action.resource_dependencies = change.dependencies.clone();
            action
        };
        let delete = |deposed_only: bool| {
            let mut action = PlannedAction::for_change(change, ActionType::Delete);
            action.deposed = deposed_only;
            if deposed_only {
                action.reason = String::from("deposed by an earlier replacement");
            }
            action
        };

        match change.change {
            ChangeKind::Create => {
                if has_deposed {
                    steps.delete_deposed = Some(graph.push(delete(true)));
                }
                steps.apply = Some(graph.push(apply(ActionType::Create)));
            }
            ChangeKind::Update => {
                if has_deposed {
                    steps.delete_deposed = Some(graph.push(delete(true)));
                }
                let mut action = apply(ActionType::Update);
                action.removed = change
                    .attributes
                    .iter()
                    .filter(|a| a.new == PlannedValue::Removed)
                    .map(|a| a.name.clone())
                    .collect();
                steps.apply = Some(graph.push(action));
            }
            ChangeKind::NoOp => {
                if has_deposed {
                    steps.delete_deposed = Some(graph.push(delete(true)));
                }
            }
            ChangeKind::Destroy => {
                if has_deposed {
                    steps.delete_deposed = Some(graph.push(delete(true)));
                }
                steps.delete = Some(graph.push(delete(false)));
            }
            ChangeKind::Replace if change.create_before_destroy => {
                let mut create = apply(ActionType::Create);
                create.create_before_destroy = true;
                let c = graph.push(create);
                let mut cleanup = delete(true);
                cleanup.reason = change.reason.clone();
                let d = graph.push(cleanup);
                graph.after(d, c);
                steps.apply = Some(c);
                steps.delete_deposed = Some(d);
            }
            ChangeKind::Replace => {
                if has_deposed {
                    steps.delete_deposed = Some(graph.push(delete(true)));
                }
                let d = graph.push(delete(false));
                let c = graph.push(apply(ActionType::Create));
                graph.after(c, d);
                steps.delete = Some(d);
                steps.apply = Some(c);
            }
        }

        if let (Some(deposed), Some(main)) = (steps.delete_deposed, steps.delete) {
            graph.after(main, deposed);
        }
        steps
    }

    /// Adds ordering edges between the steps of different resources.
    fn link(graph: &mut StepGraph, change: &ResourceChange, steps: &HashMap<String, ResourceSteps>) {
        let Some(&own) = steps.get(&change.address) else {
            return;
        };

        // Applies follow the applies of what they depend on.
        if let Some(apply) = own.apply {
            for dep in &change.dependencies {
                if let Some(on) = steps.get(dep).and_then(|s| s.apply) {
                    graph.after(apply, on);
                }
            }
        }

        // A resource is deleted only after whatever recorded it as a dependency.
        for dep in &change.recorded_dependencies {
            if let Some(&target) = steps.get(dep) {
                for delete in target.deletes() {
                    for before in own.deletes() {
                        graph.after(delete, before);
                    }
                }
            }
        }

        let Some(apply) = own.apply else {
            return;
        };

        // A surviving dependent stops referencing a dependency before it goes.
        for dep in change.recorded_dependencies.difference(&change.dependencies) {
            if let Some(&target) = steps.get(dep) {
                for delete in target.deletes() {
                    graph.after(delete, apply);
                }
            }
        }

        // Deposed instances go once every dependent points at the new one.
        for dep in change.dependencies.union(&change.recorded_dependencies) {
            if let Some(&target) = steps.get(dep)
                && target.delete.is_none()
                && let Some(deposed) = target.delete_deposed
            {
                graph.after(deposed, apply);
            }
        }
    }

    /// Reorders the steps and computes stages as longest-path levels.
    fn arrange(graph: StepGraph, order: &[usize]) -> (Vec<PlannedAction>, Vec<Vec<usize>>) {
        let mut position = vec![0; order.len()];
        for (new, &old) in order.iter().enumerate() {
            position[old] = new;
        }

        let StepGraph { actions, edges } = graph;
        let mut slots: Vec<Option<PlannedAction>> = actions.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(order.len());
        let mut levels: Vec<usize> = Vec::with_capacity(order.len());

        for &old in order {
            let Some(mut action) = slots[old].take() else {
                continue;
            };
            let mut dependencies: Vec<usize> = edges[old].iter().map(|&d| position[d]).collect();
            dependencies.sort_unstable();
            let level = dependencies
                .iter()
                .map(|&d| levels[d] + 1)
                .max()
                .unwrap_or(0);
            levels.push(level);
            action.dependencies = dependencies;
            ordered.push(action);
        }

        let depth = levels.iter().max().map_or(0, |&l| l + 1);
        let mut stages = vec![Vec::new(); depth];
        for (index, &level) in levels.iter().enumerate() {
            stages[level].push(index);
        }

        (ordered, stages)
    }

    /// Returns true if the plan has nothing to execute.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of resource changes of the given kind.
    #[must_use]
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.change == kind).count()
    }

    /// Returns the changes that do something.
    pub fn pending_changes(&self) -> impl Iterator<Item = &ResourceChange> {
        self.changes.iter().filter(|c| c.change != ChangeKind::NoOp)
    }

    /// Returns the stage an action belongs to.
    #[must_use]
    pub fn stage_of(&self, action: usize) -> Option<usize> {
        self.stages.iter().position(|s| s.contains(&action))
    }

    /// Returns the index of the first step of the given type on an address.
    #[must_use]
    pub fn position(&self, action_type: ActionType, address: &str) -> Option<usize> {
        self.actions
            .iter()
            .position(|a| a.action_type == action_type && a.address == address)
    }
}

impl PlannedAction {
    fn for_change(change: &ResourceChange, action_type: ActionType) -> Self {
        Self {
            action_type,
            address: change.address.clone(),
            kind: change.kind.clone(),
            name: change.name.clone(),
            reason: change.reason.clone(),
            deposed: false,
            create_before_destroy: false,
            attributes: BTreeMap::new(),
            removed: Vec::new(),
            resource_dependencies: BTreeSet::new(),
            dependencies: Vec::new(),
        }
    }

    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.action_type, self.deposed) {
            (ActionType::Create, _) => format!("Create {}", self.address),
            (ActionType::Update, _) => format!("Update {}", self.address),
            (ActionType::Delete, false) => format!("Delete {}", self.address),
            (ActionType::Delete, true) => format!("Delete deposed {}", self.address),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "No changes. Infrastructure matches the declarations.");
        }

        writeln!(
            f,
            "Plan: {} to create, {} to update, {} to replace, {} to destroy.",
            self.count(ChangeKind::Create),
            self.count(ChangeKind::Update),
            self.count(ChangeKind::Replace),
            self.count(ChangeKind::Destroy),
        )?;
        for (stage, indices) in self.stages.iter().enumerate() {
            writeln!(f, "  Stage {}:", stage + 1)?;
            for &i in indices {
                writeln!(f, "    {i}. {}", self.actions[i])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{DeclarationLoader, Source};
    use crate::planner::{DependencyGraph, DiffEngine, Observed};
    use crate::state::{ResourceRecord, StateRecord};
    use serde_json::json;

    const SITE: &str = r"
resources:
  - kind: bucket
    name: site
    attributes:
      bucket_name: site
      acl: private
  - kind: bucket_policy
    name: site
    attributes:
      bucket: ${bucket.site.id}
      policy: allow-cdn
  - kind: distribution
    name: cdn
    attributes:
      origin_domain: ${bucket.site.domain_name}
";

    fn load(content: &str) -> Declarations {
        DeclarationLoader::new()
            .load_sources(&[Source {
                name: String::from("site.yaml"),
                content: content.to_string(),
            }])
            .expect("load")
    }

    fn plan(declarations: &Declarations, state: &StateRecord, mode: PlanMode) -> Plan {
        let graph = match mode {
            PlanMode::Apply => DependencyGraph::for_plan(declarations, state).expect("graph"),
            PlanMode::Destroy => DependencyGraph::from_state(state),
        };
        let order = graph.topological_order().expect("order");
        let diff = DiffEngine::new().compute_diff(declarations, state, &Observed::new(), &order, mode);
        Plan::build(diff, declarations, mode, "hash").expect("plan")
    }

    fn record(kind: &str, name: &str, id: &str, config: serde_json::Value, deps: &[&str]) -> ResourceRecord {
        let mut r = ResourceRecord::new(kind, name, id);
        r.config = config.as_object().cloned().unwrap_or_default();
        r.attributes = r.config.clone();
        r.attributes.insert(String::from("id"), json!(id));
        r.attributes
            .insert(String::from("domain_name"), json!(format!("{id}.example")));
        r.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        r
    }

    fn applied_state() -> StateRecord {
        let mut state = StateRecord::new("site", "dev");
        state.set_resource(record(
            "bucket",
            "site",
            "b-1",
            json!({"bucket_name": "site", "acl": "private"}),
            &[],
        ));
        state.set_resource(record(
            "bucket_policy",
            "site",
            "p-1",
            json!({"bucket": "b-1", "policy": "allow-cdn"}),
            &["bucket.site"],
        ));
        state.set_resource(record(
            "distribution",
            "cdn",
            "d-1",
            json!({"origin_domain": "b-1.example"}),
            &["bucket.site"],
        ));
        state
    }

    fn steps(plan: &Plan) -> Vec<String> {
        plan.actions.iter().map(PlannedAction::description).collect()
    }

    #[test]
    fn test_bucket_first_then_policy_and_distribution_together() {
        let plan = plan(&load(SITE), &StateRecord::new("site", "dev"), PlanMode::Apply);

        assert_eq!(
            steps(&plan),
            vec![
                "Create bucket.site",
                "Create bucket_policy.site",
                "Create distribution.cdn"
            ]
        );
        assert_eq!(plan.stages, vec![vec![0], vec![1, 2]]);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].dependencies, vec![0]);
    }

    #[test]
    fn test_destroy_runs_dependents_first() {
        let plan = plan(&load(SITE), &applied_state(), PlanMode::Destroy);

        assert_eq!(
            steps(&plan),
            vec![
                "Delete bucket_policy.site",
                "Delete distribution.cdn",
                "Delete bucket.site"
            ]
        );
        assert_eq!(plan.stages, vec![vec![0, 1], vec![2]]);
        assert!(plan.outputs.is_empty());
    }

    #[test]
    fn test_no_changes_is_empty() {
        let plan = plan(&load(SITE), &applied_state(), PlanMode::Apply);
        assert!(plan.is_empty());
        assert!(plan.stages.is_empty());
        assert_eq!(plan.count(ChangeKind::NoOp), 3);
        assert_eq!(
            plan.to_string(),
            "No changes. Infrastructure matches the declarations."
        );
    }

    #[test]
    fn test_destroy_first_replace_tears_down_dependents() {
        let declarations = load(&SITE.replace("bucket_name: site", "bucket_name: site-v2"));
        let plan = plan(&declarations, &applied_state(), PlanMode::Apply);

        let delete_bucket = plan.position(ActionType::Delete, "bucket.site").expect("delete");
        let create_bucket = plan.position(ActionType::Create, "bucket.site").expect("create");
        let delete_policy = plan
            .position(ActionType::Delete, "bucket_policy.site")
            .expect("delete policy");
        let create_policy = plan
            .position(ActionType::Create, "bucket_policy.site")
            .expect("create policy");
        let delete_cdn = plan
            .position(ActionType::Delete, "distribution.cdn")
            .expect("delete cdn");

        assert!(delete_policy < delete_bucket);
        assert!(delete_cdn < delete_bucket);
        assert!(delete_bucket < create_bucket);
        assert!(create_bucket < create_policy);
        assert_eq!(plan.count(ChangeKind::Replace), 3);
    }

    #[test]
    fn test_create_before_destroy_deletes_deposed_last() {
        let declarations = load(
            &SITE
                .replace(
                    "      acl: private\n",
                    "      acl: private\n    lifecycle:\n      create_before_destroy: true\n",
                )
                .replace("bucket_name: site", "bucket_name: site-v2"),
        );
        let plan = plan(&declarations, &applied_state(), PlanMode::Apply);

        let create_bucket = plan.position(ActionType::Create, "bucket.site").expect("create");
        let delete_old = plan.position(ActionType::Delete, "bucket.site").expect("delete");
        let update_cdn = plan
            .position(ActionType::Update, "distribution.cdn")
            .expect("update cdn");
        let create_policy = plan
            .position(ActionType::Create, "bucket_policy.site")
            .expect("create policy");

        assert!(plan.actions[create_bucket].create_before_destroy);
        assert!(plan.actions[delete_old].deposed);
        assert!(create_bucket < update_cdn);
        assert!(update_cdn < delete_old);
        assert!(create_policy < delete_old);
        assert_eq!(plan.stage_of(delete_old), Some(plan.stages.len() - 1));
    }

    #[test]
    fn test_removed_dependent_is_deleted_before_dependency() {
        let declarations = load("resources: []\n");
        let plan = plan(&declarations, &applied_state(), PlanMode::Apply);
        assert_eq!(steps(&plan).last().map(String::as_str), Some("Delete bucket.site"));
        assert_eq!(plan.count(ChangeKind::Destroy), 3);
    }

    #[test]
    fn test_removed_attribute_is_cleared_on_update() {
        let declarations = load(&SITE.replace("      acl: private\n", ""));
        let plan = plan(&declarations, &applied_state(), PlanMode::Apply);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].action_type, ActionType::Update);
        assert_eq!(plan.actions[0].removed, vec!["acl"]);
    }
}
