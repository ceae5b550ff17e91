//! Diff engine for comparing desired vs recorded state.
//!
//! This module computes, per resource, whether it must be created,
//! updated in place, replaced, destroyed or left alone, down to the
//! attribute level. Resources are visited in dependency order so that
//! references to resources planned earlier resolve to their planned value,
//! or to *unknown* when that value only exists after apply.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use crate::declaration::{AttributeRef, Declarations, Resolved, Resource};
use crate::provider::{schema_for, Attributes};
use crate::state::{ResourceRecord, StateRecord};

use super::plan::PlanMode;

/// Freshly read provider attributes by address. `None` means the resource
/// is gone; a missing key means it was not refreshed.
pub type Observed = BTreeMap<String, Option<Attributes>>;

/// Engine for computing diffs between desired and recorded state.
#[derive(Debug, Default)]
pub struct DiffEngine;

/// Kind of change for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Not recorded; will be created.
    Create,
    /// Updatable attributes differ; changed in place.
    Update,
    /// A force-new attribute differs; a new instance is needed.
    Replace,
    /// Recorded but no longer desired.
    Destroy,
    /// Nothing to do.
    NoOp,
}

/// The planned value of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum PlannedValue {
    /// Known now.
    Known(Value),
    /// Known after apply.
    Unknown,
    /// No longer configured.
    Removed,
}

/// Attribute-level difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Current value, if any.
    pub old: Option<Value>,
    /// Planned value.
    pub new: PlannedValue,
    /// Whether this change alone requires a new instance.
    pub forces_replacement: bool,
}

/// Planned change for one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceChange {
    /// Resource address.
    pub address: String,
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Kind of change.
    pub change: ChangeKind,
    /// Why the change is needed.
    pub reason: String,
    /// Attribute-level differences.
    pub attributes: Vec<AttributeChange>,
    /// Replace by creating the new instance first.
    pub create_before_destroy: bool,
    /// Replacement forced by a replaced dependency.
    pub cascaded: bool,
    /// Provider id of the current instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_id: Option<String>,
    /// Ids of replaced instances still awaiting deletion.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// Declared dependencies.
    pub dependencies: BTreeSet<String>,
    /// Dependencies recorded when last applied.
    pub recorded_dependencies: BTreeSet<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffResult {
    /// Changes in dependency order.
    pub changes: Vec<ResourceChange>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to destroy.
    pub destroys: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

/// What a later resource sees when it references an earlier one.
struct Planned<'a> {
    kind: &'a str,
    change: ChangeKind,
    destroy_first: bool,
    values: BTreeMap<String, Resolved>,
    current: Attributes,
}

impl Planned<'_> {
    fn resolve(&self, attribute: &str) -> Resolved {
        if let Some(value) = self.values.get(attribute) {
            return value.clone();
        }
        let volatile = schema_for(self.kind).is_some_and(|s| s.may_change_on_update(attribute));
        match self.change {
            ChangeKind::Create | ChangeKind::Replace => Resolved::Unknown,
            ChangeKind::Update if volatile => Resolved::Unknown,
            _ => Resolved::Known(self.current.get(attribute).cloned().unwrap_or(Value::Null)),
        }
    }
}

fn forces_replacement(kind: &str, attribute: &str) -> bool {
    schema_for(kind).is_none_or(|s| s.forces_replacement(attribute))
}

/// Configured values overlaid with provider-reported ones.
fn recorded_attributes(record: &ResourceRecord) -> Attributes {
    let mut current = record.config.clone();
    for (k, v) in &record.attributes {
        current.insert(k.clone(), v.clone());
    }
    current
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the diff.
    ///
    /// `order` is the dependency order over desired and recorded addresses.
    #[must_use]
    pub fn compute_diff(
        &self,
        declarations: &Declarations,
        state: &StateRecord,
        observed: &Observed,
        order: &[String],
        mode: PlanMode,
    ) -> DiffResult {
        let mut result = DiffResult::default();
        let mut planned: HashMap<&str, Planned<'_>> = HashMap::new();

        for address in order {
            let desired = match mode {
                PlanMode::Apply => declarations.get(address),
                PlanMode::Destroy => None,
            };
            let record = state.get(address);

            let change = match (desired, record) {
                (Some(resource), record) => {
                    let (change, entry) =
                        Self::diff_desired(resource, record, observed.get(address), &planned);
                    planned.insert(address.as_str(), entry);
                    change
                }
                (None, Some(record)) => Self::destroy(record, mode),
                (None, None) => continue,
            };

            debug!("{}: {:?} ({})", change.address, change.change, change.reason);
            match change.change {
                ChangeKind::Create => result.creates += 1,
                ChangeKind::Update => result.updates += 1,
                ChangeKind::Replace => result.replaces += 1,
                ChangeKind::Destroy => result.destroys += 1,
                ChangeKind::NoOp => result.unchanged += 1,
            }
            result.changes.push(change);
        }

        result
    }

    fn destroy(record: &ResourceRecord, mode: PlanMode) -> ResourceChange {
        let reason = match mode {
            PlanMode::Apply => "removed from declarations",
            PlanMode::Destroy => "destroy requested",
        };
        ResourceChange {
            address: record.address.clone(),
            kind: record.kind.clone(),
            name: record.name.clone(),
            change: ChangeKind::Destroy,
            reason: reason.to_string(),
            attributes: Vec::new(),
            create_before_destroy: false,
            cascaded: false,
            prior_id: Some(record.id.clone()),
            deposed: record.deposed.clone(),
            dependencies: BTreeSet::new(),
            recorded_dependencies: record.dependencies.clone(),
        }
    }

    fn diff_desired<'a>(
        resource: &'a Resource,
        record: Option<&ResourceRecord>,
        observed: Option<&Option<Attributes>>,
        planned: &HashMap<&str, Planned<'_>>,
    ) -> (ResourceChange, Planned<'a>) {
        let lookup = |r: &AttributeRef| {
            planned
                .get(r.address().as_str())
                .map(|p| p.resolve(&r.attribute))
        };
        let values: BTreeMap<String, Resolved> = resource
            .attributes
            .iter()
            .map(|(name, expr)| {
                (name.clone(), expr.evaluate(&lookup).unwrap_or(Resolved::Unknown))
            })
            .collect();

        let dependencies = resource.dependencies();
        let gone = matches!(observed, Some(None));
        let live = record.filter(|_| !gone);
        let current = match (observed, live) {
            (Some(Some(attrs)), _) => attrs.clone(),
            (_, Some(record)) => recorded_attributes(record),
            _ => Attributes::new(),
        };

        let mut change = ResourceChange {
            address: resource.address.clone(),
            kind: resource.kind.clone(),
            name: resource.name.clone(),
            change: ChangeKind::NoOp,
            reason: String::new(),
            attributes: Vec::new(),
            create_before_destroy: resource.lifecycle.create_before_destroy,
            cascaded: false,
            prior_id: record.map(|r| r.id.clone()),
            deposed: record.map(|r| r.deposed.clone()).unwrap_or_default(),
            dependencies: dependencies.clone(),
            recorded_dependencies: record.map(|r| r.dependencies.clone()).unwrap_or_default(),
        };

        match live {
            None => {
                change.change = ChangeKind::Create;
                change.reason = if record.is_some() {
                    String::from("no longer exists at the provider")
                } else {
                    String::from("not yet created")
                };
                change.prior_id = None;
                change.attributes = values
                    .iter()
                    .map(|(name, value)| AttributeChange {
                        name: name.clone(),
                        old: None,
                        new: planned_value(value),
                        forces_replacement: false,
                    })
                    .collect();
            }
            Some(record) => {
                change.attributes = Self::attribute_changes(&resource.kind, &values, &current, record);

                let replaced_dependency = dependencies.iter().find(|dep| {
                    record.dependencies.contains(*dep)
                        && planned.get(dep.as_str()).is_some_and(|p| p.destroy_first)
                });

                if let Some(dep) = replaced_dependency {
                    change.change = ChangeKind::Replace;
                    change.cascaded = true;
                    change.create_before_destroy = false;
                    change.reason = format!("dependency {dep} is being replaced");
                } else if change.attributes.is_empty() {
                    change.change = ChangeKind::NoOp;
                    change.reason = String::from("up to date");
                } else if change.attributes.iter().any(|a| a.forces_replacement) {
                    change.change = ChangeKind::Replace;
                    change.reason = format!(
                        "{} forces replacement",
                        join_names(change.attributes.iter().filter(|a| a.forces_replacement))
                    );
                } else {
                    change.change = ChangeKind::Update;
                    change.reason = format!("{} changed", join_names(change.attributes.iter()));
                }
            }
        }

        if change.change != ChangeKind::Replace {
            change.create_before_destroy = false;
        }

        let entry = Planned {
            kind: &resource.kind,
            change: change.change,
            destroy_first: change.change == ChangeKind::Replace && !change.create_before_destroy,
            values,
            current,
        };
        (change, entry)
    }

    fn attribute_changes(
        kind: &str,
        values: &BTreeMap<String, Resolved>,
        current: &Attributes,
        record: &ResourceRecord,
    ) -> Vec<AttributeChange> {
        let mut changes = Vec::new();

        for (name, value) in values {
            let old = current.get(name).cloned();
            let differs = match value {
                Resolved::Unknown => true,
                Resolved::Known(v) => old.as_ref().unwrap_or(&Value::Null) != v,
            };
            if differs {
                changes.push(AttributeChange {
                    name: name.clone(),
                    old,
                    new: planned_value(value),
                    forces_replacement: forces_replacement(kind, name),
                });
            }
        }

        for name in record.config.keys() {
            if values.contains_key(name) {
                continue;
            }
            let old = current.get(name).cloned();
            if old.as_ref().is_some_and(|v| !v.is_null()) {
                changes.push(AttributeChange {
                    name: name.clone(),
                    old,
                    new: PlannedValue::Removed,
                    forces_replacement: forces_replacement(kind, name),
                });
            }
        }

        changes
    }
}

fn planned_value(value: &Resolved) -> PlannedValue {
    match value {
        Resolved::Known(v) => PlannedValue::Known(v.clone()),
        Resolved::Unknown => PlannedValue::Unknown,
    }
}

fn join_names<'a>(changes: impl Iterator<Item = &'a AttributeChange>) -> String {
    changes.map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
}

impl DiffResult {
    /// Returns true if any resource changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates + self.updates + self.replaces + self.destroys > 0
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => write!(f, "(known after apply)"),
            Self::Removed => write!(f, "(removed)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{DeclarationLoader, Source};
    use crate::planner::DependencyGraph;
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

    fn diff(declarations: &Declarations, state: &StateRecord, mode: PlanMode) -> DiffResult {
        let order = DependencyGraph::for_plan(declarations, state)
            .expect("graph")
            .topological_order()
            .expect("order");
        DiffEngine::new().compute_diff(declarations, state, &Observed::new(), &order, mode)
    }

    fn record(kind: &str, name: &str, id: &str, config: Value, deps: &[&str]) -> ResourceRecord {
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

    fn kinds(result: &DiffResult) -> Vec<(&str, ChangeKind)> {
        result
            .changes
            .iter()
            .map(|c| (c.address.as_str(), c.change))
            .collect()
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let result = diff(&load(SITE), &StateRecord::new("site", "dev"), PlanMode::Apply);
        assert_eq!(result.creates, 3);
        let policy = &result.changes[1];
        let bucket_attr = policy
            .attributes
            .iter()
            .find(|a| a.name == "bucket")
            .expect("bucket attribute");
        assert_eq!(bucket_attr.new, PlannedValue::Unknown);
    }

    #[test]
    fn test_applied_state_is_noop() {
        let result = diff(&load(SITE), &applied_state(), PlanMode::Apply);
        assert!(!result.has_changes(), "{:?}", kinds(&result));
        assert_eq!(result.unchanged, 3);
    }

    #[test]
    fn test_updatable_change_is_update() {
        let declarations = load(&SITE.replace("acl: private", "acl: public-read"));
        let result = diff(&declarations, &applied_state(), PlanMode::Apply);
        assert_eq!(
            kinds(&result),
            vec![
                ("bucket.site", ChangeKind::Update),
                ("bucket_policy.site", ChangeKind::NoOp),
                ("distribution.cdn", ChangeKind::NoOp),
            ]
        );
    }

    #[test]
    fn test_force_new_cascades_to_dependents() {
        let declarations = load(&SITE.replace("bucket_name: site", "bucket_name: site-v2"));
        let result = diff(&declarations, &applied_state(), PlanMode::Apply);
        assert_eq!(
            kinds(&result),
            vec![
                ("bucket.site", ChangeKind::Replace),
                ("bucket_policy.site", ChangeKind::Replace),
                ("distribution.cdn", ChangeKind::Replace),
            ]
        );
        assert!(result.changes[1].cascaded);
        assert!(result.changes[0].attributes[0].forces_replacement);
    }

    #[test]
    fn test_create_before_destroy_updates_dependents() {
        let declarations = load(&SITE.replace(
            "      acl: private\n",
            "      acl: private\n    lifecycle:\n      create_before_destroy: true\n",
        ).replace("bucket_name: site", "bucket_name: site-v2"));
        let result = diff(&declarations, &applied_state(), PlanMode::Apply);
        assert_eq!(result.changes[0].change, ChangeKind::Replace);
        assert!(result.changes[0].create_before_destroy);
        // bucket_policy.bucket is force-new, so it is replaced; the distribution only updates.
        assert_eq!(result.changes[1].change, ChangeKind::Replace);
        assert!(!result.changes[1].cascaded);
        assert_eq!(result.changes[2].change, ChangeKind::Update);
    }

    #[test]
    fn test_removed_resource_is_destroyed() {
        let declarations = load(
            "resources:\n  - kind: bucket\n    name: site\n    attributes:\n      bucket_name: site\n      acl: private\n",
        );
        let result = diff(&declarations, &applied_state(), PlanMode::Apply);
        assert_eq!(result.destroys, 2);
        assert_eq!(result.unchanged, 1);
    }

    #[test]
    fn test_destroy_mode_destroys_all() {
        let result = diff(&load(SITE), &applied_state(), PlanMode::Destroy);
        assert_eq!(result.destroys, 3);
        assert!(result.changes.iter().all(|c| c.change == ChangeKind::Destroy));
    }

    #[test]
    fn test_drift_and_disappearance() {
        let declarations = load(SITE);
        let state = applied_state();
        let order = DependencyGraph::for_plan(&declarations, &state)
            .expect("graph")
            .topological_order()
            .expect("order");

        let mut drifted = state.get("bucket.site").expect("bucket").attributes.clone();
        drifted.insert(String::from("acl"), json!("public-read"));
        let mut observed = Observed::new();
        observed.insert(String::from("bucket.site"), Some(drifted));
        observed.insert(String::from("distribution.cdn"), None);

        let result =
            DiffEngine::new().compute_diff(&declarations, &state, &observed, &order, PlanMode::Apply);
        assert_eq!(result.changes[0].change, ChangeKind::Update);
        assert_eq!(result.changes[0].attributes[0].old, Some(json!("public-read")));
        assert_eq!(result.changes[2].change, ChangeKind::Create);
        assert_eq!(result.changes[2].reason, "no longer exists at the provider");
    }

    #[test]
    fn test_removed_attribute_is_reported() {
        let declarations = load(&SITE.replace("      acl: private\n", ""));
        let result = diff(&declarations, &applied_state(), PlanMode::Apply);
        let bucket = &result.changes[0];
        assert_eq!(bucket.change, ChangeKind::Update);
        assert_eq!(bucket.attributes[0].name, "acl");
        assert_eq!(bucket.attributes[0].new, PlannedValue::Removed);
    }
}
