//! End-to-end plan and apply runs against the in-memory provider.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

use stackform::declaration::{DeclarationLoader, Declarations, Source};
use stackform::error::{ApplyError, PlanError, StackformError};
use stackform::planner::{
    ActionStatus, ActionType, ChangeKind, ExecutionResult, Plan, PlanExecutor, PlanMode, Planner,
};
use stackform::provider::{Fault, FaultKind, MemoryProvider, Operation, RetryPolicy};
use stackform::state::{LocalStateStore, StateRecord, StateStore};

const SITE: &str = r"
variables:
  bucket_name:
    type: string
    default: docs-assets
resources:
  - kind: bucket
    name: site
    attributes:
      bucket_name: ${var.bucket_name}
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
      default_root_object: index.html
outputs:
  url:
    value: https://${distribution.cdn.domain_name}
";

const CYCLE: &str = r"
resources:
  - kind: distribution
    name: a
    attributes:
      origin_domain: ${distribution.b.domain_name}
  - kind: distribution
    name: b
    attributes:
      origin_domain: ${distribution.a.domain_name}
";

fn load(content: &str) -> Declarations {
    DeclarationLoader::new()
        .load_sources(&[Source {
            name: String::from("site.yaml"),
            content: content.to_string(),
        }])
        .expect("load declarations")
}

struct Harness {
    _temp: TempDir,
    store: LocalStateStore,
    provider: Arc<MemoryProvider>,
}

impl Harness {
    fn new() -> Self {
        Self::with_provider(MemoryProvider::new())
    }

    fn with_provider(provider: MemoryProvider) -> Self {
        let temp = TempDir::new().expect("temp dir");
        let store = LocalStateStore::with_base_dir(temp.path().join(".stackform"));
        Self {
            _temp: temp,
            store,
            provider: Arc::new(provider),
        }
    }

    async fn state(&self) -> StateRecord {
        self.store
            .load()
            .await
            .expect("load state")
            .unwrap_or_else(|| StateRecord::new("docs", "dev"))
    }

    async fn plan(&self, declarations: &Declarations, mode: PlanMode) -> Plan {
        Planner::new(self.provider.clone())
            .with_retry(RetryPolicy::immediate(3))
            .with_mode(mode)
            .plan(declarations, &self.state().await)
            .await
            .expect("plan")
    }

    async fn execute(&self, plan: &Plan) -> ExecutionResult {
        PlanExecutor::new(self.provider.clone(), &self.store)
            .with_retry(RetryPolicy::immediate(3))
            .execute(plan, self.state().await)
            .await
            .expect("execute")
    }

    async fn apply(&self, content: &str) -> ExecutionResult {
        let plan = self.plan(&load(content), PlanMode::Apply).await;
        self.execute(&plan).await
    }
}

fn steps(plan: &Plan) -> Vec<(ActionType, String)> {
    plan.actions
        .iter()
        .map(|a| (a.action_type, a.address.clone()))
        .collect()
}

#[tokio::test]
async fn test_plan_order_is_deterministic() {
    let first = Harness::new().plan(&load(SITE), PlanMode::Apply).await;
    let second = Harness::new().plan(&load(SITE), PlanMode::Apply).await;

    assert_eq!(steps(&first), steps(&second));
    assert_eq!(first.stages, second.stages);
    assert_eq!(first.declaration_hash, second.declaration_hash);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_provider_call() {
    let harness = Harness::new();
    let mut state = StateRecord::new("docs", "dev");
    state.set_resource(stackform::state::ResourceRecord::new(
        "distribution",
        "a",
        "distribution-0001",
    ));

    let result = Planner::new(harness.provider.clone())
        .plan(&load(CYCLE), &state)
        .await;

    match result {
        Err(StackformError::Plan(PlanError::CyclicDependency { cycle })) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&String::from("distribution.a")));
            assert!(cycle.contains(&String::from("distribution.b")));
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
    assert!(harness.provider.calls().is_empty());
}

#[tokio::test]
async fn test_bucket_precedes_policy_and_distribution_which_share_a_stage() {
    let plan = Harness::new().plan(&load(SITE), PlanMode::Apply).await;

    let bucket = plan.position(ActionType::Create, "bucket.site").expect("bucket");
    let policy = plan
        .position(ActionType::Create, "bucket_policy.site")
        .expect("policy");
    let cdn = plan
        .position(ActionType::Create, "distribution.cdn")
        .expect("cdn");

    assert!(bucket < policy && bucket < cdn);
    assert_eq!(plan.stage_of(bucket), Some(0));
    assert_eq!(plan.stage_of(policy), Some(1));
    assert_eq!(plan.stage_of(cdn), Some(1));
    assert_eq!(plan.stages.len(), 2);
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let harness = Harness::new();
    let first = harness.apply(SITE).await;
    assert!(first.is_success(), "{first}");
    assert_eq!(first.succeeded, 3);
    let mutations = harness.provider.mutation_count();

    let plan = harness.plan(&load(SITE), PlanMode::Apply).await;
    assert!(plan.is_empty(), "{plan}");
    assert_eq!(plan.count(ChangeKind::NoOp), 3);

    let second = harness.execute(&plan).await;
    assert!(second.is_success());
    assert!(second.results.is_empty());
    assert_eq!(harness.provider.mutation_count(), mutations);

    let state = harness.state().await;
    let cdn_domain = state
        .get("distribution.cdn")
        .and_then(|r| r.attribute("domain_name"))
        .and_then(|v| v.as_str())
        .expect("cdn domain");
    assert_eq!(state.outputs["url"].value, json!(format!("https://{cdn_domain}")));
}

#[tokio::test]
async fn test_failed_apply_resumes_with_remaining_work() {
    let harness = Harness::with_provider(MemoryProvider::new().with_fault(
        Fault::on(Operation::Create, FaultKind::Fatal)
            .for_kind("distribution")
            .times(1),
    ));

    let failed = harness.apply(SITE).await;
    assert!(!failed.is_success());
    assert!(matches!(
        failed.failure,
        Some(ApplyError::ActionFailed { ref address, .. }) if address == "distribution.cdn"
    ));

    let recorded: BTreeSet<String> = harness
        .state()
        .await
        .addresses()
        .into_iter()
        .map(String::from)
        .collect();
    assert!(recorded.contains("bucket.site"));
    assert!(!recorded.contains("distribution.cdn"));

    let resume = harness.plan(&load(SITE), PlanMode::Apply).await;
    let pending: BTreeSet<String> = resume.actions.iter().map(|a| a.address.clone()).collect();
    assert!(pending.contains("distribution.cdn"));
    assert!(pending.is_disjoint(&recorded));
    assert!(resume.actions.iter().all(|a| a.action_type == ActionType::Create));

    let resumed = harness.execute(&resume).await;
    assert!(resumed.is_success(), "{resumed}");
    assert_eq!(harness.provider.resource_count(), 3);
    assert!(harness.plan(&load(SITE), PlanMode::Apply).await.is_empty());
}

#[tokio::test]
async fn test_destroy_removes_dependents_first() {
    let harness = Harness::new();
    assert!(harness.apply(SITE).await.is_success());

    let plan = harness.plan(&Declarations::default(), PlanMode::Destroy).await;
    let bucket = plan.position(ActionType::Delete, "bucket.site").expect("bucket");
    let policy = plan
        .position(ActionType::Delete, "bucket_policy.site")
        .expect("policy");
    let cdn = plan
        .position(ActionType::Delete, "distribution.cdn")
        .expect("cdn");
    assert!(policy < bucket);
    assert!(cdn < bucket);
    assert_eq!(plan.stage_of(bucket), Some(1));

    let result = harness.execute(&plan).await;
    assert!(result.is_success(), "{result}");
    assert_eq!(harness.provider.resource_count(), 0);

    let state = harness.state().await;
    assert!(state.is_empty());
    assert!(state.outputs.is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_step() {
    let harness = Harness::with_provider(MemoryProvider::new().with_fault(
        Fault::on(Operation::Create, FaultKind::Transient).for_kind("bucket"),
    ));

    let result = harness.apply(SITE).await;

    assert_eq!(harness.provider.call_count(Operation::Create), 3);
    assert_eq!(result.failed, 1);
    assert_eq!(result.not_attempted, 2);
    assert_eq!(result.results[0].status, ActionStatus::Failed);
    match &result.failure {
        Some(ApplyError::ActionFailed { address, message, .. }) => {
            assert_eq!(address, "bucket.site");
            assert!(message.contains("Gave up after 3 attempts"), "{message}");
        }
        other => panic!("expected a failed action, got {other:?}"),
    }
    assert!(harness.state().await.is_empty());
}

#[tokio::test]
async fn test_drift_is_planned_as_an_update() {
    let harness = Harness::new();
    assert!(harness.apply(SITE).await.is_success());

    let bucket_id = harness.state().await.get("bucket.site").expect("bucket").id.clone();
    assert!(harness
        .provider
        .set_attribute(&bucket_id, "acl", json!("public-read")));

    let plan = harness.plan(&load(SITE), PlanMode::Apply).await;
    assert_eq!(steps(&plan), vec![(ActionType::Update, String::from("bucket.site"))]);

    assert!(harness.execute(&plan).await.is_success());
    let live = harness.provider.get(&bucket_id).expect("bucket still exists");
    assert_eq!(live["acl"], json!("private"));
}

#[tokio::test]
async fn test_replacing_a_bucket_repoints_dependents() {
    let harness = Harness::new();
    assert!(harness.apply(SITE).await.is_success());
    let old_id = harness.state().await.get("bucket.site").expect("bucket").id.clone();

    let renamed = SITE.replace("default: docs-assets", "default: docs-assets-v2");
    let plan = harness.plan(&load(&renamed), PlanMode::Apply).await;
    let bucket = plan
        .changes
        .iter()
        .find(|c| c.address == "bucket.site")
        .expect("bucket change");
    assert_eq!(bucket.change, ChangeKind::Replace);
    assert!(
        plan.position(ActionType::Delete, "bucket.site")
            < plan.position(ActionType::Create, "bucket.site")
    );

    let result = harness.execute(&plan).await;
    assert!(result.is_success(), "{result}");

    let state = harness.state().await;
    let new_bucket = state.get("bucket.site").expect("bucket");
    assert_ne!(new_bucket.id, old_id);
    assert_eq!(harness.provider.ids_of_kind("bucket"), vec![new_bucket.id.clone()]);
    assert_eq!(
        state.get("bucket_policy.site").expect("policy").config["bucket"],
        json!(new_bucket.id)
    );
    assert_eq!(
        state.get("distribution.cdn").expect("cdn").config["origin_domain"],
        new_bucket.attributes["domain_name"]
    );
    assert!(harness.plan(&load(&renamed), PlanMode::Apply).await.is_empty());
}
