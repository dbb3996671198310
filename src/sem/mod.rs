//! Self-Execution Mode: the orchestrator's fallback executor, engaged
//! when an assigned doer stalls or repeatedly fails.

mod planner;

pub use planner::{compose_micro_plan, MicroPlanStep};

use chrono::Utc;

use crate::dispatcher::{DispatchRequest, DispatchResponse, Dispatcher};
use crate::errors::{CoreError, DispatchError};
use crate::gatekeeper::{Gatekeeper, Rubric};
use crate::model::{
    Artifact, ArtifactProvenance, EvidencePack, GateDecision, SemInterventionRecord, SemStatus, SemTrigger,
    UsageMetrics,
};
use crate::registry::Registry;

/// Frozen context for the blocked step SEM is taking over.
#[derive(Debug, Clone)]
pub struct BlockedStepContext {
    pub run_id: String,
    pub phase: String,
    pub task_id: String,
    pub trigger: SemTrigger,
    pub trigger_details: String,
    pub required_artifacts: Vec<String>,
    pub inputs: serde_json::Value,
    pub remaining_budget_usd: f64,
    pub allowlisted_tools: Vec<String>,
}

/// Outcome of one SEM intervention.
pub struct SemOutcome {
    pub record: SemInterventionRecord,
    pub artifacts: Vec<Artifact>,
    pub handed_back: bool,
    pub hints: Vec<String>,
}

/// Deterministic micro-planner and executor — a tagged-variant heuristic
/// standing in for an orchestrator-driven agent, not an LLM actor.
pub struct SemPlanner<'a> {
    registry: &'a Registry,
    dispatcher: &'a Dispatcher,
    gatekeeper: &'a Gatekeeper,
}

impl<'a> SemPlanner<'a> {
    pub fn new(registry: &'a Registry, dispatcher: &'a Dispatcher, gatekeeper: &'a Gatekeeper) -> Self {
        Self { registry, dispatcher, gatekeeper }
    }

    /// Runs the full lifecycle: claim, micro-plan, execute, validate &
    /// hand-back. Never bypasses the Gatekeeper.
    pub async fn intervene(
        &self,
        context: &BlockedStepContext,
        target_version: &str,
        rubric: &Rubric,
    ) -> Result<SemOutcome, CoreError> {
        let claimed_at = Utc::now();
        let intervention_id = format!("sem-{}-{}", context.run_id, context.task_id);

        let plan = compose_micro_plan(&context.required_artifacts, &context.allowlisted_tools, self.registry)?;

        let mut artifacts = Vec::new();
        let mut tools_used = Vec::new();
        let mut hints = Vec::new();

        for step in &plan {
            let doer = self
                .registry
                .get(&step.target)
                .ok_or_else(|| CoreError::Dispatch(DispatchError::UnknownTarget(step.target.clone())))?
                .doer
                .clone();

            let response: DispatchResponse = match self
                .dispatcher
                .dispatch(
                    &step_as_task(context, step),
                    doer,
                    target_version,
                    tokio_util::sync::CancellationToken::new(),
                )
                .await
            {
                Ok(r) => r,
                Err(err) => {
                    hints.push(format!("tool {} failed: {err}", step.target));
                    continue;
                }
            };

            tools_used.push(step.target.clone());

            for artifact in response.artifacts {
                artifacts.push(artifact);
            }
        }

        let pack = EvidencePack {
            artifact_ids: artifacts.iter().map(|a| a.artifact_id.clone()).collect(),
            guard_reports: vec![],
            qav_summary: None,
            kmap_refs: vec![],
            metrics: UsageMetrics::default(),
            provenance: ArtifactProvenance {
                producer: "sem".to_string(),
                when: Utc::now(),
                input_artifact_ids: vec![],
                tool_version: None,
            },
        };

        let gate_result = self.gatekeeper.evaluate(&pack, rubric);
        let handed_back = gate_result.decision != GateDecision::Pass;
        if handed_back {
            hints.extend(gate_result.reasons.clone());
        }

        let record = SemInterventionRecord {
            intervention_id,
            run_id: context.run_id.clone(),
            phase: context.phase.clone(),
            trigger: context.trigger,
            original_doer: context.task_id.clone(),
            context_snapshot: serde_json::json!({ "trigger_details": context.trigger_details }),
            micro_plan: serde_json::to_value(&plan).unwrap_or(serde_json::Value::Null),
            claimed_at,
            completed_at: Some(Utc::now()),
            status: if handed_back { SemStatus::Failed } else { SemStatus::Completed },
            tools_used,
            gate_score: Some(gate_result.overall_score),
        };

        Ok(SemOutcome { record, artifacts, handed_back, hints })
    }
}

fn step_as_task(context: &BlockedStepContext, step: &MicroPlanStep) -> crate::model::TaskSpec {
    crate::model::TaskSpec::new(
        format!("{}-sem-{}", context.task_id, step.required_artifact),
        context.phase.clone(),
        crate::model::TaskType::Tool,
        step.target.clone(),
        context.inputs.clone(),
        crate::model::Budget::new(context.remaining_budget_usd.max(0.01), 1_000_000, 0),
        vec![],
        Utc::now(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Doer;
    use crate::model::{Artifact, ArtifactProvenance, RuntimeClass, ToolManifest};
    use crate::registry::CallableManifest;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct SastDoer;

    #[async_trait]
    impl Doer for SastDoer {
        async fn invoke(&self, _request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
            Ok(DispatchResponse {
                ok: true,
                output: Some(serde_json::json!({"findings": []})),
                artifacts: vec![Artifact::new(
                    "art-sast-1".into(),
                    "sha256:abc".into(),
                    "sast-report",
                    10,
                    ArtifactProvenance {
                        producer: "tool.code.staticPack".into(),
                        when: Utc::now(),
                        input_artifact_ids: vec![],
                        tool_version: Some("1.0.0".into()),
                    },
                )],
                duration_ms: 50,
                tokens: 0,
                tool_minutes: 0.2,
                cost_usd: 0.01,
                retry_count: 0,
                error: None,
                execution_id: "exec-sem-1".into(),
            })
        }
    }

    fn tool_manifest(name: &str, produces: &[&str]) -> ToolManifest {
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
            produces: produces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn sem_intervention_dispatches_allowlisted_producer_for_each_artifact() {
        let mut registry = Registry::new();
        registry.register(
            CallableManifest::Tool(tool_manifest("tool.code.staticPack", &["sast-report"])),
            Arc::new(SastDoer),
        );
        let dispatcher = Dispatcher::new();
        let gatekeeper = Gatekeeper::new(vec![]);
        let planner = SemPlanner::new(&registry, &dispatcher, &gatekeeper);

        let context = BlockedStepContext {
            run_id: "run-1".into(),
            phase: "security".into(),
            task_id: "task-sast".into(),
            trigger: SemTrigger::SchemaFailure,
            trigger_details: "3 consecutive schema failures".into(),
            required_artifacts: vec!["sast-report".into()],
            inputs: serde_json::json!({}),
            remaining_budget_usd: 1.0,
            allowlisted_tools: vec!["tool.code.staticPack".into()],
        };

        let outcome = planner.intervene(&context, "1.0.0", &Rubric::default()).await.unwrap();
        assert_eq!(outcome.record.tools_used, vec!["tool.code.staticPack".to_string()]);
        assert_eq!(outcome.artifacts.len(), 1);
        // No guards configured => overall_score is 0, so handed_back is true;
        // the caller's rubric/guard set determines pass/fail in production.
        assert!(outcome.record.gate_score.is_some());
    }
}
