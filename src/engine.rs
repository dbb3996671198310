//! Workflow Engine: owns the Run state machine and drives a run phase by
//! phase through the Phase Coordinator, pausing on budget or gate pressure
//! and transitioning to GA on completion.
//!
//! `RunState` doubles as this module's Phase type — it already carries
//! `PHASE_ORDER` and the terminal/pause predicates a separate `Phase` enum
//! would just duplicate.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::budget::BudgetGuard;
use crate::coordinator::PhaseCoordinator;
pub use crate::coordinator::{ParallelismMode, PhaseManifest};
use crate::dispatcher::Dispatcher;
use crate::errors::{CoreError, FatalError};
use crate::events::{EventSink, PhaseEvent};
use crate::gatekeeper::Gatekeeper;
use crate::ledger::RunLedger;
use crate::metrics::Recorder;
use crate::model::{Budget, GateDecision, LedgerEntryType, Provenance, Run, RunState};
use crate::quota::QuotaEnforcer;
use crate::registry::Registry;

/// Backoff applied between phase retries, sharing the same `min(base *
/// 2^n, max)` shape as `RetryPolicy::backoff_delay_ms`.
pub fn phase_backoff_delay_ms(retry_count: u32) -> u64 {
    crate::model::RetryPolicy::default().backoff_delay_ms(retry_count)
}

/// Whether `from -> to` is one of the run's legal transitions: the fixed
/// `Created -> Intake -> ... -> Ga` chain, a
/// pause from any non-terminal phase, a resume from `Paused` back into any
/// phase, and a fail/cancel from any non-terminal state.
pub fn legal_transition(from: RunState, to: RunState) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == RunState::Failed || to == RunState::Cancelled {
        return true;
    }
    if from == RunState::Paused {
        return RunState::PHASE_ORDER.contains(&to);
    }
    if from == RunState::Created {
        return to == RunState::Intake;
    }
    if to == RunState::Paused {
        return true;
    }
    let positions = (
        RunState::PHASE_ORDER.iter().position(|p| *p == from),
        RunState::PHASE_ORDER.iter().position(|p| *p == to),
    );
    matches!(positions, (Some(fi), Some(ti)) if ti == fi + 1)
}

/// Supplies the task list, parallelism mode and rubric for one phase of
/// one run. The engine is domain-agnostic; what each phase actually does
/// is the embedder's responsibility.
pub trait PhaseManifestProvider: Send + Sync {
    fn manifest_for(&self, run: &Run, phase: RunState) -> PhaseManifest;
}

/// Drives runs through the phase chain. Holds no per-run state beyond a
/// lazily-populated table of `BudgetGuard`s (one per active run) — all
/// other subsystems are shared across every run the embedder manages.
pub struct WorkflowEngine {
    registry: Registry,
    dispatcher: Dispatcher,
    gatekeeper: Gatekeeper,
    quota: QuotaEnforcer,
    ledger: RunLedger,
    recorder: Recorder,
    events: Arc<dyn EventSink>,
    manifests: Box<dyn PhaseManifestProvider>,
    budget_guards: DashMap<String, Arc<BudgetGuard>>,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Registry,
        dispatcher: Dispatcher,
        gatekeeper: Gatekeeper,
        quota: QuotaEnforcer,
        ledger: RunLedger,
        recorder: Recorder,
        events: Arc<dyn EventSink>,
        manifests: Box<dyn PhaseManifestProvider>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            gatekeeper,
            quota,
            ledger,
            recorder,
            events,
            manifests,
            budget_guards: DashMap::new(),
        }
    }

    fn budget_guard_for(&self, run: &Run) -> Arc<BudgetGuard> {
        self.budget_guards
            .entry(run.run_id.clone())
            .or_insert_with(|| Arc::new(BudgetGuard::new(run.run_id.clone(), run.tenant_id.clone(), run.budget)))
            .clone()
    }

    /// `createRun(tenantId, userId, ideaSpecId, budget) -> Run`, emits
    /// `run.created`.
    pub fn create_run(
        &self,
        tenant_id: String,
        user_id: String,
        idea_spec_id: String,
        budget: Budget,
    ) -> Result<Run, CoreError> {
        if !budget.is_well_formed() {
            return Err(CoreError::Fatal(FatalError::InvariantViolation(
                "run budget must have strictly positive ceilings".to_string(),
            )));
        }

        let run_id = format!("run-{}", Uuid::new_v4());
        let run = Run::new(run_id.clone(), tenant_id.clone(), user_id, idea_spec_id, budget, Utc::now());

        self.budget_guards
            .insert(run_id.clone(), Arc::new(BudgetGuard::new(run_id.clone(), tenant_id, budget)));

        self.ledger
            .append(&run_id, LedgerEntryType::Decision, serde_json::json!({"event": "run_created"}), Provenance::default())?;

        info!(run_id = %run_id, "run created");
        self.events.emit(PhaseEvent::RunCreated { run_id: run_id.clone() });

        Ok(run)
    }

    /// Validates and applies one state transition, persisting it to the
    /// ledger.
    pub fn transition_to(&self, run: &mut Run, to: RunState, paused_from: Option<RunState>) -> Result<(), CoreError> {
        if !legal_transition(run.state, to) {
            return Err(CoreError::Fatal(FatalError::IllegalTransition {
                from: format!("{:?}", run.state),
                to: format!("{:?}", to),
            }));
        }

        self.ledger.append(
            &run.run_id,
            LedgerEntryType::Decision,
            serde_json::json!({"transition": {"from": format!("{:?}", run.state), "to": format!("{:?}", to)}}),
            Provenance::default(),
        )?;

        run.state = to;
        run.paused_from = paused_from;
        run.updated_at = Utc::now();
        Ok(())
    }

    /// Pauses the run, recording the phase it should resume into. Callers
    /// decide `resume_target`: a gate-block pause resumes into the *same*
    /// phase so it can be retried once the embedder intervenes; a
    /// budget-pause (which only fires after that phase's gate already
    /// passed) resumes into the *next* phase.
    pub fn pause(&self, run: &mut Run, resume_target: RunState, reason: Option<String>) -> Result<(), CoreError> {
        self.transition_to(run, RunState::Paused, Some(resume_target))?;
        self.events.emit(PhaseEvent::RunPaused { run_id: run.run_id.clone(), reason, by: None });
        Ok(())
    }

    /// `resumeRun(runId)`: transitions back into `paused_from` and clears
    /// it.
    pub fn resume(&self, run: &mut Run) -> Result<(), CoreError> {
        let target = run.paused_from.ok_or_else(|| {
            CoreError::Fatal(FatalError::InvariantViolation("resume called on a run that was never paused".to_string()))
        })?;
        self.transition_to(run, target, None)?;
        run.retry_counter = 0;
        self.events.emit(PhaseEvent::RunResumed { run_id: run.run_id.clone(), by: None });
        Ok(())
    }

    pub fn fail_run(&self, run: &mut Run, reason: impl Into<String>) -> Result<(), CoreError> {
        let reason = reason.into();
        self.transition_to(run, RunState::Failed, None)?;
        warn!(run_id = %run.run_id, reason = %reason, "run failed");
        self.events.emit(PhaseEvent::RunFailed { run_id: run.run_id.clone(), reason: Some(reason) });
        Ok(())
    }

    /// Drives `run` forward from its current phase through to GA, or until
    /// it pauses. A phase whose gate fails is retried in place — waiting
    /// `phase_backoff_delay_ms(run.retry_counter)` between attempts — until
    /// `run.retry_counter` reaches `run.budget.max_retries`, at which point
    /// the run pauses back into that same phase. The caller must have
    /// already advanced a freshly-created run past `Created` (the first
    /// call does this automatically) and must call `resume` before
    /// re-entering a paused run.
    pub async fn execute(&self, run: &mut Run) -> Result<(), CoreError> {
        if run.state == RunState::Created {
            self.transition_to(run, RunState::Intake, None)?;
        }
        if run.state.is_paused() {
            return Err(CoreError::Fatal(FatalError::InvariantViolation(
                "execute called on a paused run; call resume first".to_string(),
            )));
        }

        let phases = RunState::PHASE_ORDER;
        let executable = &phases[..phases.len() - 1]; // GA is a terminal transition target, not an executable phase
        let start = executable
            .iter()
            .position(|p| *p == run.state)
            .ok_or_else(|| CoreError::Fatal(FatalError::InvariantViolation(format!("run is not at an executable phase: {:?}", run.state))))?;

        for (offset, &phase) in executable.iter().enumerate().skip(start) {
            if run.state != phase {
                self.transition_to(run, phase, None)?;
                run.retry_counter = 0;
            }

            let manifest = self.manifests.manifest_for(run, phase);
            let guard = self.budget_guard_for(run);

            let outcome = loop {
                let coordinator = PhaseCoordinator::new(
                    &self.registry,
                    &self.dispatcher,
                    &self.gatekeeper,
                    guard.as_ref(),
                    &self.quota,
                    &self.ledger,
                    &self.recorder,
                    self.events.as_ref(),
                );

                let outcome = coordinator.execute_phase(run, &manifest).await?;
                run.cumulative_cost_usd += outcome.cost_usd;

                if outcome.gate_result.decision == GateDecision::Fail && run.retry_counter < run.budget.max_retries {
                    let delay_ms = phase_backoff_delay_ms(run.retry_counter);
                    run.retry_counter += 1;
                    warn!(
                        run_id = %run.run_id,
                        phase = ?phase,
                        retry_counter = run.retry_counter,
                        delay_ms,
                        "phase gate failed, retrying with backoff"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    continue;
                }

                break outcome;
            };

            match outcome.gate_result.decision {
                GateDecision::Pass => {
                    run.retry_counter = 0;
                }
                GateDecision::Fail | GateDecision::Escalate => {
                    self.pause(run, phase, Some(format!("phase {phase:?} gate blocked advancement")))?;
                    return Ok(());
                }
            }

            if guard.is_paused().await {
                let next_phase = executable.get(offset + 1).copied().unwrap_or(RunState::Ga);
                self.pause(run, next_phase, Some("run budget pause threshold crossed".to_string()))?;
                return Ok(());
            }
        }

        self.transition_to(run, RunState::Ga, None)?;
        info!(run_id = %run.run_id, "run completed");
        self.events.emit(PhaseEvent::RunCompleted { run_id: run.run_id.clone() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatchRequest, DispatchResponse, Doer};
    use crate::errors::DispatchError;
    use crate::gatekeeper::Rubric;
    use crate::ledger::LedgerStore;
    use crate::model::{Artifact, ArtifactProvenance, RuntimeClass, TaskSpec, TaskType, ToolManifest};
    use crate::quota::QuotaStore;
    use crate::registry::CallableManifest;
    use async_trait::async_trait;
    use std::collections::HashMap;

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
                    "artifact-1".into(),
                    "sha256:aaaa".into(),
                    "generic",
                    1,
                    ArtifactProvenance {
                        producer: "tool.echo".into(),
                        when: Utc::now(),
                        input_artifact_ids: vec![],
                        tool_version: Some("1.0.0".into()),
                    },
                )],
                duration_ms: 1,
                tokens: 10,
                tool_minutes: 0.0,
                cost_usd: self.cost_usd,
                retry_count: 0,
                error: None,
                execution_id: "exec-1".into(),
            })
        }
    }

    struct NoOpPhases;

    impl PhaseManifestProvider for NoOpPhases {
        fn manifest_for(&self, _run: &Run, phase: RunState) -> PhaseManifest {
            PhaseManifest {
                phase: format!("{phase:?}"),
                parallelism: ParallelismMode::Sequential,
                tasks: vec![],
                rubric: Rubric { weights: vec![], pass_threshold: 0.0, margin_error: 0.0 },
                partial_success_min_fraction: 0.75,
                max_gate_retries: 0,
                sem_allowlisted_tools: vec![],
            }
        }
    }

    struct OneEchoTaskPerPhase {
        cost_usd: f64,
        pass_threshold: f64,
    }

    impl PhaseManifestProvider for OneEchoTaskPerPhase {
        fn manifest_for(&self, _run: &Run, phase: RunState) -> PhaseManifest {
            let task = TaskSpec::new(
                format!("{phase:?}-task"),
                format!("{phase:?}"),
                TaskType::Tool,
                "tool.echo".into(),
                serde_json::json!({}),
                Budget::new(self.cost_usd.max(0.01), 1_000, 0),
                vec![],
                Utc::now(),
            );
            PhaseManifest {
                phase: format!("{phase:?}"),
                parallelism: ParallelismMode::Sequential,
                tasks: vec![task],
                rubric: Rubric { weights: vec![], pass_threshold: self.pass_threshold, margin_error: 0.0 },
                partial_success_min_fraction: 0.75,
                max_gate_retries: 0,
                sem_allowlisted_tools: vec![],
            }
        }
    }

    fn engine(manifests: Box<dyn PhaseManifestProvider>, cost_usd: f64) -> WorkflowEngine {
        let mut registry = Registry::new();
        registry.register(
            CallableManifest::Tool(ToolManifest {
                name: "tool.echo".into(),
                version: "1.0.0".into(),
                input_schema: serde_json::json!({}),
                output_schema: serde_json::json!({}),
                runtime: RuntimeClass::Native,
                timeout_ms: 60_000,
                resource_limits: HashMap::new(),
                egress_policy: "none".into(),
                tags: vec![],
                produces: vec!["generic".into()],
            }),
            Arc::new(EchoDoer { cost_usd }),
        );
        WorkflowEngine::new(
            registry,
            Dispatcher::new(),
            Gatekeeper::new(vec![]),
            QuotaEnforcer::new(QuotaStore::open_in_memory().unwrap(), 5_000),
            RunLedger::new(LedgerStore::open_in_memory().unwrap()),
            Recorder::new(),
            Arc::new(crate::events::ChannelEventSink::new().0),
            manifests,
        )
    }

    #[test]
    fn legal_transition_follows_phase_order_chain() {
        assert!(legal_transition(RunState::Created, RunState::Intake));
        assert!(!legal_transition(RunState::Intake, RunState::Critique));
        assert!(legal_transition(RunState::Beta, RunState::Ga));
        assert!(legal_transition(RunState::Intake, RunState::Failed));
        assert!(legal_transition(RunState::Paused, RunState::Arch));
        assert!(!legal_transition(RunState::Ga, RunState::Failed));
    }

    #[test]
    fn phase_backoff_matches_task_backoff_shape() {
        assert_eq!(phase_backoff_delay_ms(0), 1_000);
        assert_eq!(phase_backoff_delay_ms(1), 2_000);
    }

    #[tokio::test]
    async fn create_run_rejects_malformed_budget() {
        let engine = engine(Box::new(NoOpPhases), 0.0);
        let result = engine.create_run("tenant-1".into(), "user-1".into(), "idea-1".into(), Budget::new(0.0, 100, 3));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn full_run_with_empty_phases_reaches_ga() {
        let engine = engine(Box::new(NoOpPhases), 0.0);
        let mut run = engine
            .create_run("tenant-1".into(), "user-1".into(), "idea-1".into(), Budget::new(10.0, 100_000, 3))
            .unwrap();
        engine.execute(&mut run).await.unwrap();
        assert_eq!(run.state, RunState::Ga);
    }

    #[tokio::test]
    async fn gate_failure_pauses_into_the_same_phase() {
        let engine = engine(Box::new(OneEchoTaskPerPhase { cost_usd: 0.001, pass_threshold: 70.0 }), 0.001);
        let mut run = engine
            .create_run("tenant-1".into(), "user-1".into(), "idea-1".into(), Budget::new(10.0, 100_000, 0))
            .unwrap();
        engine.execute(&mut run).await.unwrap();
        assert_eq!(run.state, RunState::Paused);
        assert_eq!(run.paused_from, Some(RunState::Intake));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_failure_retries_in_place_before_pausing() {
        let engine = engine(Box::new(OneEchoTaskPerPhase { cost_usd: 0.001, pass_threshold: 70.0 }), 0.001);
        let mut run = engine
            .create_run("tenant-1".into(), "user-1".into(), "idea-1".into(), Budget::new(10.0, 100_000, 2))
            .unwrap();
        engine.execute(&mut run).await.unwrap();
        assert_eq!(run.state, RunState::Paused);
        assert_eq!(run.paused_from, Some(RunState::Intake));
        // two retries were spent before the pause, plus the cost of each attempt.
        assert_eq!(run.retry_counter, 2);
        assert!((run.cumulative_cost_usd - 0.003).abs() < 1e-9);
    }

    #[tokio::test]
    async fn budget_pause_resumes_into_the_next_phase() {
        // pass_threshold 0.0: empty evidence packs auto-pass so the only
        // thing that can block progress is the budget guard.
        let engine = engine(Box::new(OneEchoTaskPerPhase { cost_usd: 0.02, pass_threshold: 0.0 }), 0.02);
        let mut run = engine
            .create_run("tenant-1".into(), "user-1".into(), "idea-1".into(), Budget::new(0.02, 100_000, 3))
            .unwrap();
        engine.execute(&mut run).await.unwrap();
        assert_eq!(run.state, RunState::Paused);
        assert_eq!(run.paused_from, Some(RunState::Ideation));
    }

    #[tokio::test]
    async fn resume_transitions_back_into_paused_from_and_clears_it() {
        let engine = engine(Box::new(OneEchoTaskPerPhase { cost_usd: 0.001, pass_threshold: 70.0 }), 0.001);
        let mut run = engine
            .create_run("tenant-1".into(), "user-1".into(), "idea-1".into(), Budget::new(10.0, 100_000, 0))
            .unwrap();
        engine.execute(&mut run).await.unwrap();
        assert_eq!(run.state, RunState::Paused);

        engine.resume(&mut run).unwrap();
        assert_eq!(run.state, RunState::Intake);
        assert_eq!(run.paused_from, None);
    }

    #[tokio::test]
    async fn fail_run_transitions_to_failed_and_emits_event() {
        let engine = engine(Box::new(NoOpPhases), 0.0);
        let mut run = engine
            .create_run("tenant-1".into(), "user-1".into(), "idea-1".into(), Budget::new(10.0, 100_000, 3))
            .unwrap();
        engine.fail_run(&mut run, "operator cancelled the run").unwrap();
        assert_eq!(run.state, RunState::Failed);
    }
}
