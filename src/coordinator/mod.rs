//! Phase Coordinator: builds the task graph for one phase, dispatches
//! tasks wave by wave through the Priority Scheduler, Quota Enforcer and
//! Budget Guard, escalates repeated failures to SEM, and submits the
//! resulting evidence to the Gatekeeper.
//!
//! Persistence ownership within this module: `PhaseCoordinator` owns no
//! state of its own — it borrows the Run Ledger, Recorder, Quota Enforcer,
//! Budget Guard, Dispatcher, Registry and Gatekeeper for the lifetime of one
//! `execute_phase` call.

mod dag;

pub use dag::{build_task_graph, TaskGraph, TaskIndex};

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::budget::{BudgetAction, BudgetEvent, BudgetGuard};
use crate::dispatcher::Dispatcher;
use crate::errors::{CoreError, DispatchError, FatalError, PolicyError, QuotaError};
use crate::events::{EventSink, FailureReason, PhaseBudgets, PhaseEvent, Progress, UsageSnapshot};
use crate::gatekeeper::{Gatekeeper, Rubric};
use crate::ledger::RunLedger;
use crate::metrics::{Recorder, StepRecord};
use crate::model::{
    Artifact, ArtifactProvenance, EvidencePack, GateDecision, GateResult, LedgerEntryType, Provenance,
    Run, SemInterventionRecord, SemTrigger, TaskSpec, UsageMetrics,
};
use crate::quota::{QuotaEnforcer, Resource};
use crate::registry::Registry;
use crate::scheduler::{select_preemption_candidates, PreemptionReason};
use crate::sem::{BlockedStepContext, SemPlanner};

/// How a phase's tasks are executed relative to one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelismMode {
    /// One task at a time, in dependency order.
    Sequential,
    /// Independent tasks run concurrently; a partial-success threshold
    /// applies instead of requiring every task to succeed.
    Parallel,
    /// Like `parallel`, but the phase is explicitly modeled as fan-out
    /// groups that each produce one artifact (e.g. the Arch phase's
    /// per-component design docs).
    Partial,
    /// Re-applies the same dependency-DAG machinery per story/unit of work
    /// (e.g. StoryLoop's code -> review -> tests chain for each story).
    Iterative,
}

/// Declares the work for one phase: its task list, parallelism mode and
/// gating rubric. Phase-specific business logic (which agents run in
/// `intake`, what `prd`'s rubric weighs) is supplied by the embedder.
#[derive(Debug, Clone)]
pub struct PhaseManifest {
    pub phase: String,
    pub parallelism: ParallelismMode,
    pub tasks: Vec<TaskSpec>,
    pub rubric: Rubric,
    /// Default `ceil(0.75 * n)`, never below `n - 1`.
    pub partial_success_min_fraction: f64,
    /// Bounds the gate auto-fix retry loop.
    pub max_gate_retries: u32,
    /// Tools SEM may substitute in when a task's doer repeatedly fails.
    pub sem_allowlisted_tools: Vec<String>,
}

impl PhaseManifest {
    pub fn min_required_successes(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let frac_based = (self.partial_success_min_fraction * n as f64).ceil() as usize;
        frac_based.max(n.saturating_sub(1)).min(n)
    }
}

/// What `execute_phase` produces: the artifacts built, which tasks
/// succeeded/failed, any SEM interventions, and the gate's verdict.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub gate_result: GateResult,
    pub artifacts: Vec<Artifact>,
    pub succeeded_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
    pub sem_interventions: Vec<SemInterventionRecord>,
    pub cost_usd: f64,
    pub tokens: u64,
    pub tool_minutes: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
struct TaskRunOutcome {
    task_id: String,
    succeeded: bool,
    artifacts: Vec<Artifact>,
    cost_usd: f64,
    tokens: u64,
    tool_minutes: f64,
    sem_intervention: Option<SemInterventionRecord>,
}

impl TaskRunOutcome {
    fn failed(task_id: String) -> Self {
        Self {
            task_id,
            succeeded: false,
            artifacts: Vec::new(),
            cost_usd: 0.0,
            tokens: 0,
            tool_minutes: 0.0,
            sem_intervention: None,
        }
    }
}

/// Wires the Scheduler, Quota Enforcer, Budget Guard, Dispatcher and
/// Gatekeeper together for one phase's task DAG.
pub struct PhaseCoordinator<'a> {
    registry: &'a Registry,
    dispatcher: &'a Dispatcher,
    gatekeeper: &'a Gatekeeper,
    budget_guard: &'a BudgetGuard,
    quota: &'a QuotaEnforcer,
    ledger: &'a RunLedger,
    recorder: &'a Recorder,
    events: &'a dyn EventSink,
}

impl<'a> PhaseCoordinator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: &'a Registry,
        dispatcher: &'a Dispatcher,
        gatekeeper: &'a Gatekeeper,
        budget_guard: &'a BudgetGuard,
        quota: &'a QuotaEnforcer,
        ledger: &'a RunLedger,
        recorder: &'a Recorder,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            gatekeeper,
            budget_guard,
            quota,
            ledger,
            recorder,
            events,
        }
    }

    /// Runs one phase end to end: builds the task DAG, dispatches wave by
    /// wave, escalates to SEM on repeated task failure, checks the
    /// partial-success threshold, then gates the result.
    pub async fn execute_phase(&self, run: &Run, manifest: &PhaseManifest) -> Result<PhaseOutcome, CoreError> {
        let graph = build_task_graph(manifest.tasks.clone())?;
        let total = graph.len();
        let started_at = std::time::Instant::now();

        self.events.emit(PhaseEvent::PhaseStarted {
            run_id: run.run_id.clone(),
            phase: manifest.phase.clone(),
            budgets: PhaseBudgets {
                tokens: run.budget.max_tokens,
                tools_minutes: run.budget.max_tool_minutes,
                wallclock_minutes: run.budget.max_wallclock_minutes,
            },
            agents: manifest.tasks.iter().map(|t| t.target.clone()).collect(),
            parallelism: format!("{:?}", manifest.parallelism).to_lowercase(),
        });

        let mut succeeded: HashSet<String> = HashSet::new();
        let mut failed: Vec<String> = Vec::new();
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut sem_interventions: Vec<SemInterventionRecord> = Vec::new();
        let mut total_cost = 0.0;
        let mut total_tokens = 0u64;
        let mut total_tool_minutes = 0.0;

        for wave in graph.waves() {
            for &idx in &wave {
                let task = graph.task(idx);
                if !task.dependencies_satisfied(&succeeded) {
                    return Err(CoreError::MissingInput(task.task_id.clone()));
                }
            }

            match manifest.parallelism {
                ParallelismMode::Sequential => {
                    for &idx in &wave {
                        let task = graph.task(idx).clone();
                        let outcome = self.run_one_task(run, manifest, &task).await?;
                        self.absorb(outcome, &mut succeeded, &mut failed, &mut artifacts, &mut sem_interventions, &mut total_cost, &mut total_tokens, &mut total_tool_minutes);
                    }
                }
                ParallelismMode::Parallel | ParallelismMode::Partial | ParallelismMode::Iterative => {
                    let mut futs = FuturesUnordered::new();
                    for &idx in &wave {
                        let task = graph.task(idx).clone();
                        futs.push(async move { self.run_one_task(run, manifest, &task).await });
                    }
                    while let Some(result) = futs.next().await {
                        let outcome = result?;
                        self.absorb(outcome, &mut succeeded, &mut failed, &mut artifacts, &mut sem_interventions, &mut total_cost, &mut total_tokens, &mut total_tool_minutes);
                    }
                }
            }

            self.events.emit(PhaseEvent::PhaseProgress {
                run_id: run.run_id.clone(),
                phase: manifest.phase.clone(),
                progress: Progress {
                    completed: succeeded.len() as u32,
                    total: total as u32,
                    percent: if total == 0 { 100.0 } else { (succeeded.len() as f64 / total as f64) * 100.0 },
                    current_task: None,
                },
                usage: UsageSnapshot {
                    tokens: total_tokens,
                    tools_minutes: total_tool_minutes,
                    wallclock_ms: started_at.elapsed().as_millis() as u64,
                    cost_usd: total_cost,
                },
            });
        }

        let min_required = match manifest.parallelism {
            ParallelismMode::Parallel | ParallelismMode::Partial => manifest.min_required_successes(total),
            ParallelismMode::Sequential | ParallelismMode::Iterative => total,
        };

        let mut gate_result = if succeeded.len() < min_required {
            below_threshold_gate_result(&manifest.phase, succeeded.len(), min_required)
        } else {
            self.evaluate_gate(run, manifest, &artifacts)
        };
        self.persist_and_announce_gate(run, manifest, &gate_result);

        let mut gate_retry = 0u32;
        while gate_result.decision == GateDecision::Fail
            && gate_retry < manifest.max_gate_retries
            && succeeded.len() >= min_required
        {
            gate_retry += 1;
            let retry_targets: Vec<TaskSpec> = manifest
                .tasks
                .iter()
                .filter(|t| failed.contains(&t.task_id))
                .cloned()
                .collect();
            for task in &retry_targets {
                let outcome = self.run_one_task(run, manifest, task).await?;
                if outcome.succeeded {
                    failed.retain(|id| id != &outcome.task_id);
                }
                self.absorb(outcome, &mut succeeded, &mut failed, &mut artifacts, &mut sem_interventions, &mut total_cost, &mut total_tokens, &mut total_tool_minutes);
            }
            gate_result = self.evaluate_gate(run, manifest, &artifacts);
            self.persist_and_announce_gate(run, manifest, &gate_result);
        }

        let duration_ms = started_at.elapsed().as_millis() as u64;
        self.events.emit(PhaseEvent::PhaseReady {
            run_id: run.run_id.clone(),
            phase: manifest.phase.clone(),
            artifacts: artifacts.iter().map(|a| a.artifact_id.clone()).collect(),
            usage: UsageSnapshot {
                tokens: total_tokens,
                tools_minutes: total_tool_minutes,
                wallclock_ms: duration_ms,
                cost_usd: total_cost,
            },
            kmap_refs: vec![],
        });

        Ok(PhaseOutcome {
            gate_result,
            artifacts,
            succeeded_task_ids: succeeded.into_iter().collect(),
            failed_task_ids: failed,
            sem_interventions,
            cost_usd: total_cost,
            tokens: total_tokens,
            tool_minutes: total_tool_minutes,
            duration_ms,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn absorb(
        &self,
        outcome: TaskRunOutcome,
        succeeded: &mut HashSet<String>,
        failed: &mut Vec<String>,
        artifacts: &mut Vec<Artifact>,
        sem_interventions: &mut Vec<SemInterventionRecord>,
        total_cost: &mut f64,
        total_tokens: &mut u64,
        total_tool_minutes: &mut f64,
    ) {
        if outcome.succeeded {
            succeeded.insert(outcome.task_id.clone());
        } else if !failed.contains(&outcome.task_id) {
            failed.push(outcome.task_id.clone());
        }
        artifacts.extend(outcome.artifacts);
        *total_cost += outcome.cost_usd;
        *total_tokens += outcome.tokens;
        *total_tool_minutes += outcome.tool_minutes;
        if let Some(record) = outcome.sem_intervention {
            sem_interventions.push(record);
        }
    }

    async fn run_one_task(&self, run: &Run, manifest: &PhaseManifest, task: &TaskSpec) -> Result<TaskRunOutcome, CoreError> {
        let registered = match self.registry.get(&task.target) {
            Some(r) => r,
            None => return Err(CoreError::Dispatch(DispatchError::UnknownTarget(task.target.clone()))),
        };
        let doer = registered.doer.clone();
        let version = registered.manifest.version().to_string();

        match self.quota.enforce_quota(
            &run.tenant_id,
            Resource::Cost,
            task.budget.max_cost_usd,
            Some(run.run_id.clone()),
            Some(task.task_id.clone()),
            Utc::now(),
        ) {
            Ok(_) => {}
            Err(QuotaError::UnknownTenant(_)) => {
                // No quota configured for this tenant: treat as unmetered.
            }
            Err(err @ QuotaError::Policy(PolicyError::Throttled(_)))
            | Err(err @ QuotaError::Policy(PolicyError::QuotaExceeded { .. })) => {
                warn!(task_id = %task.task_id, tenant_id = %run.tenant_id, error = %err, "quota admission refused");
                self.preempt_under_pressure(run, manifest, task, PreemptionReason::Quota, "cost", 1.0);
                return Ok(TaskRunOutcome::failed(task.task_id.clone()));
            }
            Err(err) => {
                warn!(task_id = %task.task_id, tenant_id = %run.tenant_id, error = %err, "quota admission refused");
                return Ok(TaskRunOutcome::failed(task.task_id.clone()));
            }
        }

        let mut attempt = 0u32;
        let mut consecutive_failures = 0u32;

        loop {
            let dispatched = self
                .dispatcher
                .dispatch(task, doer.clone(), &version, CancellationToken::new())
                .await;

            match dispatched {
                Ok(response) => {
                    if Dispatcher::validate_output_present(&task.target, &response).is_err() {
                        consecutive_failures += 1;
                    } else {
                        if let Some(event) =
                            self.budget_guard.record_spend(response.cost_usd, response.tokens).await
                        {
                            self.handle_budget_event(run, manifest, task, event);
                        }
                        self.persist_task_success(run, manifest, task, &version, &response);
                        return Ok(TaskRunOutcome {
                            task_id: task.task_id.clone(),
                            succeeded: true,
                            artifacts: response.artifacts,
                            cost_usd: response.cost_usd,
                            tokens: response.tokens,
                            tool_minutes: response.tool_minutes,
                            sem_intervention: None,
                        });
                    }
                }
                Err(DispatchError::Transient(_)) if attempt < task.retry_policy.max_retries => {
                    let delay = task.retry_policy.backoff_delay_ms(attempt);
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    continue;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    self.record_task_failure(run, manifest, task, &err.to_string());
                }
            }

            if consecutive_failures >= 3 {
                return self.invoke_sem(run, manifest, task, consecutive_failures).await;
            }
            attempt += 1;
            if attempt > task.retry_policy.max_retries {
                return Ok(TaskRunOutcome::failed(task.task_id.clone()));
            }
        }
    }

    async fn invoke_sem(
        &self,
        run: &Run,
        manifest: &PhaseManifest,
        task: &TaskSpec,
        consecutive_failures: u32,
    ) -> Result<TaskRunOutcome, CoreError> {
        let context = BlockedStepContext {
            run_id: run.run_id.clone(),
            phase: manifest.phase.clone(),
            task_id: task.task_id.clone(),
            trigger: SemTrigger::ToolFailure,
            trigger_details: format!("{consecutive_failures} consecutive dispatch failures"),
            required_artifacts: vec![task.artifact_type_or_target().to_string()],
            inputs: task.input.clone(),
            remaining_budget_usd: (run.budget.max_cost_usd - run.cumulative_cost_usd).max(0.01),
            allowlisted_tools: manifest.sem_allowlisted_tools.clone(),
        };

        let planner = SemPlanner::new(self.registry, self.dispatcher, self.gatekeeper);
        let outcome = planner.intervene(&context, "1.0.0", &manifest.rubric).await?;

        let _ = self.ledger.append(
            &run.run_id,
            LedgerEntryType::Decision,
            serde_json::json!({"sem_intervention": &outcome.record, "hints": &outcome.hints}),
            Provenance {
                who: "sem".to_string(),
                when: Some(Utc::now()),
                tool_version: None,
                inputs: vec![task.task_id.clone()],
            },
        );

        Ok(TaskRunOutcome {
            task_id: task.task_id.clone(),
            succeeded: !outcome.handed_back,
            artifacts: outcome.artifacts,
            cost_usd: 0.0,
            tokens: 0,
            tool_minutes: 0.0,
            sem_intervention: Some(outcome.record),
        })
    }

    fn persist_task_success(
        &self,
        run: &Run,
        manifest: &PhaseManifest,
        task: &TaskSpec,
        version: &str,
        response: &crate::dispatcher::DispatchResponse,
    ) {
        let _ = self.ledger.append(
            &run.run_id,
            LedgerEntryType::Cost,
            serde_json::json!({
                "task_id": task.task_id,
                "cost_usd": response.cost_usd,
                "tokens": response.tokens,
                "tool_minutes": response.tool_minutes,
            }),
            Provenance {
                who: task.target.clone(),
                when: Some(Utc::now()),
                tool_version: Some(version.to_string()),
                inputs: task.dependencies.clone(),
            },
        );
        for artifact in &response.artifacts {
            let _ = self.ledger.append(
                &run.run_id,
                LedgerEntryType::Artifact,
                serde_json::to_value(artifact).unwrap_or_default(),
                Provenance {
                    who: task.target.clone(),
                    when: Some(Utc::now()),
                    tool_version: Some(version.to_string()),
                    inputs: vec![task.task_id.clone()],
                },
            );
        }
        self.recorder.record(StepRecord {
            run_id: run.run_id.clone(),
            phase: manifest.phase.clone(),
            step: task.task_id.clone(),
            actor: task.target.clone(),
            inputs: Some(task.input.clone()),
            outputs: response.output.clone(),
            cost_usd: response.cost_usd,
            latency_ms: response.duration_ms,
            status: "succeeded".to_string(),
            metadata: serde_json::json!({}),
        });
    }

    fn record_task_failure(&self, run: &Run, manifest: &PhaseManifest, task: &TaskSpec, error: &str) {
        self.recorder.record(StepRecord {
            run_id: run.run_id.clone(),
            phase: manifest.phase.clone(),
            step: task.task_id.clone(),
            actor: task.target.clone(),
            inputs: Some(task.input.clone()),
            outputs: None,
            cost_usd: 0.0,
            latency_ms: 0,
            status: "failed".to_string(),
            metadata: serde_json::json!({"error": error}),
        });
    }

    /// Persists a fired `BudgetEvent` and, on a pause-level event, preempts
    /// the phase's remaining P3/P2 tasks.
    fn handle_budget_event(&self, run: &Run, manifest: &PhaseManifest, task: &TaskSpec, event: BudgetEvent) {
        if let Err(err) = self.quota.store().record_budget_event(&run.run_id, &event) {
            warn!(run_id = %run.run_id, error = %err, "failed to persist budget event");
        }
        if matches!(event.action, BudgetAction::PreemptP3AndFreeze) {
            self.preempt_under_pressure(run, manifest, task, PreemptionReason::Budget, "cost", event.threshold);
        }
    }

    /// Selects and persists preemption candidates from this phase's
    /// remaining tasks (everything but the task that triggered the
    /// pressure).
    fn preempt_under_pressure(
        &self,
        run: &Run,
        manifest: &PhaseManifest,
        triggering_task: &TaskSpec,
        reason: PreemptionReason,
        resource_type: &str,
        threshold: f64,
    ) {
        let candidates: Vec<TaskSpec> = manifest
            .tasks
            .iter()
            .filter(|t| t.task_id != triggering_task.task_id)
            .cloned()
            .collect();
        let records = select_preemption_candidates(&candidates, reason, resource_type, threshold);
        for record in &records {
            if let Err(err) = self.quota.store().record_preemption(&run.run_id, record) {
                warn!(run_id = %run.run_id, task_id = %record.task_id, error = %err, "failed to persist preemption record");
            }
        }
        if !records.is_empty() {
            warn!(run_id = %run.run_id, phase = %manifest.phase, count = records.len(), "preempted tasks under resource pressure");
        }
    }

    fn evaluate_gate(&self, run: &Run, manifest: &PhaseManifest, artifacts: &[Artifact]) -> GateResult {
        let pack = EvidencePack {
            artifact_ids: artifacts.iter().map(|a| a.artifact_id.clone()).collect(),
            guard_reports: vec![],
            qav_summary: None,
            kmap_refs: vec![],
            metrics: UsageMetrics {
                duration_ms: 0,
                tokens: 0,
                tool_minutes: 0.0,
                cost_usd: 0.0,
            },
            provenance: ArtifactProvenance {
                producer: "phase-coordinator".to_string(),
                when: Utc::now(),
                input_artifact_ids: vec![],
                tool_version: None,
            },
        };
        let mut result = self.gatekeeper.evaluate(&pack, &manifest.rubric);
        result.phase = manifest.phase.clone();
        let _ = run;
        result
    }

    fn persist_and_announce_gate(&self, run: &Run, manifest: &PhaseManifest, result: &GateResult) {
        let _ = self.ledger.append(
            &run.run_id,
            LedgerEntryType::Gate,
            serde_json::to_value(result).unwrap_or_default(),
            Provenance::default(),
        );
        let _ = self.ledger.append(
            &run.run_id,
            LedgerEntryType::Decision,
            serde_json::json!({"decision": result.decision}),
            Provenance::default(),
        );
        for report in &result.guard_reports {
            let _ = self.ledger.record_deliberation_score(&crate::model::DeliberationScore {
                run_id: run.run_id.clone(),
                phase: manifest.phase.clone(),
                guard: report.guard_type.clone(),
                score: report.score,
                at: report.timestamp,
            });
        }

        match result.decision {
            GateDecision::Pass => self.events.emit(PhaseEvent::PhaseGatePassed {
                run_id: run.run_id.clone(),
                phase: manifest.phase.clone(),
                gate_score: result.overall_score / 100.0,
                pass_threshold: manifest.rubric.pass_threshold / 100.0,
                guard_reports: result.guard_reports.clone(),
                qav_summary: None,
                next_phase: None,
            }),
            GateDecision::Fail => self.events.emit(PhaseEvent::PhaseGateFailed {
                run_id: run.run_id.clone(),
                phase: manifest.phase.clone(),
                gate_score: result.overall_score / 100.0,
                guard_reports: result.guard_reports.clone(),
                failure_reasons: result
                    .reasons
                    .iter()
                    .map(|r| FailureReason {
                        category: "guard".to_string(),
                        description: r.clone(),
                        severity: "high".to_string(),
                        suggestion: None,
                    })
                    .collect(),
                attempt: 0,
                max_attempts: manifest.max_gate_retries,
                auto_fix_strategy: result.auto_fix_strategy,
            }),
            GateDecision::Escalate => {}
        }
    }
}

fn below_threshold_gate_result(phase: &str, succeeded: usize, required: usize) -> GateResult {
    GateResult {
        phase: phase.to_string(),
        pass: false,
        overall_score: 0.0,
        decision: GateDecision::Fail,
        reasons: vec![format!(
            "only {succeeded} of {required} required tasks succeeded (partial-success threshold not met)"
        )],
        recommendations: vec![],
        required_actions: vec![],
        auto_fix_strategy: Some(crate::model::AutoFixStrategy::AddMissingAgents),
        guard_reports: vec![],
    }
}

impl std::convert::From<CoreError> for FatalError {
    fn from(err: CoreError) -> Self {
        FatalError::InvariantViolation(err.to_string())
    }
}
