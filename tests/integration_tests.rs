//! End-to-end tests driving the public `WorkflowEngine` API across several
//! runs: a happy path to GA, a budget-triggered pause, a gate-blocked pause
//! with resume, and quota handling for both unregistered and registered
//! tenants.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use phaseforge::budget::BudgetGuard;
use phaseforge::coordinator::ParallelismMode;
use phaseforge::dispatcher::{DispatchRequest, DispatchResponse, Dispatcher, Doer};
use phaseforge::engine::{PhaseManifest, PhaseManifestProvider, WorkflowEngine};
use phaseforge::errors::DispatchError;
use phaseforge::events::ChannelEventSink;
use phaseforge::gatekeeper::{Gatekeeper, Rubric};
use phaseforge::ledger::{LedgerStore, RunLedger};
use phaseforge::metrics::Recorder;
use phaseforge::model::{
    Artifact, ArtifactProvenance, Budget, Run, RunState, RuntimeClass, TaskSpec, TaskType, TenantQuota, TenantTier,
    ToolManifest,
};
use phaseforge::quota::{QuotaEnforcer, QuotaStore, Resource};
use phaseforge::registry::{CallableManifest, Registry};

struct EchoDoer {
    cost_usd: f64,
}

#[async_trait]
impl Doer for EchoDoer {
    async fn invoke(&self, _request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        Ok(DispatchResponse {
            ok: true,
            output: Some(serde_json::json!({"done": true})),
            artifacts: vec![Artifact::new(
                uuid::Uuid::new_v4().to_string(),
                "sha256:aaaa".into(),
                "generic",
                16,
                ArtifactProvenance {
                    producer: "tool.echo".into(),
                    when: Utc::now(),
                    input_artifact_ids: vec![],
                    tool_version: Some("1.0.0".into()),
                },
            )],
            duration_ms: 2,
            tokens: 50,
            tool_minutes: 0.01,
            cost_usd: self.cost_usd,
            retry_count: 0,
            error: None,
            execution_id: "exec-1".into(),
        })
    }
}

fn tool_manifest(name: &str) -> ToolManifest {
    ToolManifest {
        name: name.into(),
        version: "1.0.0".into(),
        input_schema: serde_json::json!({}),
        output_schema: serde_json::json!({}),
        runtime: RuntimeClass::Native,
        timeout_ms: 60_000,
        resource_limits: HashMap::new(),
        egress_policy: "none".into(),
        tags: vec![],
        produces: vec!["generic".into()],
    }
}

/// One task per phase, always dispatched to `tool.echo`, with a rubric
/// that passes any non-empty evidence pack so these tests exercise
/// orchestration rather than guard scoring (covered at the unit level in
/// `gatekeeper`).
struct EveryPhaseOneTask {
    cost_usd: f64,
}

impl PhaseManifestProvider for EveryPhaseOneTask {
    fn manifest_for(&self, _run: &Run, phase: RunState) -> PhaseManifest {
        let task = TaskSpec::new(
            format!("{phase:?}-task"),
            format!("{phase:?}"),
            TaskType::Tool,
            "tool.echo".into(),
            serde_json::json!({}),
            Budget::new(self.cost_usd.max(0.01), 10_000, 0),
            vec![],
            Utc::now(),
        );
        PhaseManifest {
            phase: format!("{phase:?}"),
            parallelism: ParallelismMode::Sequential,
            tasks: vec![task],
            rubric: Rubric { weights: vec![], pass_threshold: 0.0, margin_error: 0.0 },
            partial_success_min_fraction: 0.75,
            max_gate_retries: 0,
            sem_allowlisted_tools: vec![],
        }
    }
}

fn build_engine(manifests: Box<dyn PhaseManifestProvider>, cost_usd: f64) -> WorkflowEngine {
    let mut registry = Registry::new();
    registry.register(CallableManifest::Tool(tool_manifest("tool.echo")), Arc::new(EchoDoer { cost_usd }));

    WorkflowEngine::new(
        registry,
        Dispatcher::new(),
        Gatekeeper::new(vec![]),
        QuotaEnforcer::new(QuotaStore::open_in_memory().unwrap(), 5_000),
        RunLedger::new(LedgerStore::open_in_memory().unwrap()),
        Recorder::new(),
        Arc::new(ChannelEventSink::new().0),
        manifests,
    )
}

#[tokio::test]
async fn run_reaches_ga_and_accumulates_cost() {
    let engine = build_engine(Box::new(EveryPhaseOneTask { cost_usd: 0.001 }), 0.001);
    let mut run = engine
        .create_run("tenant-acme".into(), "user-1".into(), "idea-1".into(), Budget::new(10.0, 1_000_000, 3))
        .unwrap();

    engine.execute(&mut run).await.unwrap();

    assert_eq!(run.state, RunState::Ga);
    assert!(run.cumulative_cost_usd > 0.0);
}

#[tokio::test]
async fn budget_pause_stops_the_run_before_ga_and_resume_continues() {
    // Ten cents per phase against a twenty-cent ceiling crosses the 95%
    // pause threshold after the second phase's task runs.
    let engine = build_engine(Box::new(EveryPhaseOneTask { cost_usd: 0.10 }), 0.10);
    let mut run = engine
        .create_run("tenant-acme".into(), "user-1".into(), "idea-1".into(), Budget::new(0.20, 1_000_000, 3))
        .unwrap();

    engine.execute(&mut run).await.unwrap();

    assert_eq!(run.state, RunState::Paused);
    assert!(run.paused_from.is_some());

    // The embedder raises the run's ceiling out of band, then resumes.
    engine.resume(&mut run).unwrap();
    assert!(!run.state.is_paused());
}

#[tokio::test]
async fn gate_block_pauses_into_the_same_phase_for_retry() {
    struct StrictGate;
    impl PhaseManifestProvider for StrictGate {
        fn manifest_for(&self, _run: &Run, phase: RunState) -> PhaseManifest {
            let task = TaskSpec::new(
                format!("{phase:?}-task"),
                format!("{phase:?}"),
                TaskType::Tool,
                "tool.echo".into(),
                serde_json::json!({}),
                Budget::new(0.01, 10_000, 0),
                vec![],
                Utc::now(),
            );
            PhaseManifest {
                phase: format!("{phase:?}"),
                parallelism: ParallelismMode::Sequential,
                tasks: vec![task],
                rubric: Rubric::default(), // pass_threshold 70, no guards configured -> always fails
                partial_success_min_fraction: 0.75,
                max_gate_retries: 0,
                sem_allowlisted_tools: vec![],
            }
        }
    }

    let engine = build_engine(Box::new(StrictGate), 0.001);
    let mut run = engine
        .create_run("tenant-acme".into(), "user-1".into(), "idea-1".into(), Budget::new(10.0, 1_000_000, 3))
        .unwrap();

    engine.execute(&mut run).await.unwrap();

    assert_eq!(run.state, RunState::Paused);
    assert_eq!(run.paused_from, Some(RunState::Intake));

    engine.resume(&mut run).unwrap();
    assert_eq!(run.state, RunState::Intake);
}

#[tokio::test]
async fn quota_admission_does_not_block_an_unregistered_tenant() {
    // No tenant is ever upserted into the quota store; enforce_quota
    // reports UnknownTenant, which the coordinator treats as unmetered.
    let engine = build_engine(Box::new(EveryPhaseOneTask { cost_usd: 0.001 }), 0.001);
    let mut run = engine
        .create_run("tenant-never-registered".into(), "user-1".into(), "idea-1".into(), Budget::new(10.0, 1_000_000, 3))
        .unwrap();

    engine.execute(&mut run).await.unwrap();
    assert_eq!(run.state, RunState::Ga);
}

#[tokio::test]
async fn quota_enforcer_rejects_usage_over_a_registered_tenants_ceiling() {
    let store = QuotaStore::open_in_memory().unwrap();
    store.upsert_quota("tenant-free", &TenantQuota::default_for_tier(TenantTier::Free)).unwrap();
    let enforcer = QuotaEnforcer::new(store, 5_000);

    let result = enforcer.enforce_quota("tenant-free", Resource::Cpu, 100.0, None, None, Utc::now());

    assert!(result.is_err());
}

#[tokio::test]
async fn budget_guard_pauses_and_preempts_p3_at_ninety_five_percent() {
    let guard = BudgetGuard::new("run-1".into(), "tenant-acme".into(), Budget::new(1.0, 100_000, 3));
    guard.record_spend(0.60, 0).await;
    let event = guard.record_spend(0.40, 0).await;
    assert!(guard.is_paused().await);
    assert!(event.is_some());
}
