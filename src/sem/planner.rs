//! Deterministic micro-planner. For each required artifact, picks the best
//! available allow-listed tool by `capability -> artifact` mapping: first
//! tool with a matching `produces` tag wins.

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::registry::Registry;

/// One step of a SEM micro-plan: produce `required_artifact` by invoking
/// `target`, then check it against explicit pass criteria, e.g.
/// "min-completeness 0.7, min-grounding 0.6".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroPlanStep {
    pub required_artifact: String,
    pub target: String,
    pub min_completeness: f64,
    pub min_grounding: f64,
}

/// Assigns one allow-listed producer per required artifact. Bounded by the
/// caller's remaining budget — the plan itself is just the ordered step
/// list; budget enforcement happens at dispatch time.
pub fn compose_micro_plan(
    required_artifacts: &[String],
    allowlisted_tools: &[String],
    registry: &Registry,
) -> Result<Vec<MicroPlanStep>, CoreError> {
    required_artifacts
        .iter()
        .map(|artifact| {
            let target = registry
                .find_producer(artifact, allowlisted_tools)
                .ok_or_else(|| CoreError::NoAllowlistedProducer(artifact.clone()))?;
            Ok(MicroPlanStep {
                required_artifact: artifact.clone(),
                target: target.to_string(),
                min_completeness: 0.7,
                min_grounding: 0.6,
            })
        })
        .collect()
}
