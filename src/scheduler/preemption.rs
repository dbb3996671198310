//! Preemption candidate selection and ordering.

use serde::{Deserialize, Serialize};

use crate::model::{PriorityClass, TaskSpec};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionReason {
    Cost,
    Cpu,
    Memory,
    Budget,
    Quota,
}

/// One `preemption_history` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreemptionRecord {
    pub task_id: String,
    pub reason: PreemptionReason,
    pub resource_type: String,
    pub threshold: f64,
    pub priority: PriorityClass,
    pub checkpoint_id: Option<String>,
}

/// Select preemption candidates from `running` tasks: P3 before P2, within
/// a class newest first (older tasks have more sunk cost). P0/P1 are never
/// candidates.
pub fn select_preemption_candidates<'a>(
    running: &'a [TaskSpec],
    reason: PreemptionReason,
    resource_type: &str,
    threshold: f64,
) -> Vec<PreemptionRecord> {
    let mut candidates: Vec<&'a TaskSpec> = running
        .iter()
        .filter(|t| {
            !t.preempted && matches!(t.priority_class, PriorityClass::P3 | PriorityClass::P2)
        })
        .collect();

    candidates.sort_by(|a, b| {
        // P3 before P2 => lower weight first.
        a.priority_class
            .weight()
            .cmp(&b.priority_class.weight())
            // within a class, newest (latest enqueued_at) first.
            .then(b.enqueued_at.cmp(&a.enqueued_at))
    });

    candidates
        .into_iter()
        .map(|t| PreemptionRecord {
            task_id: t.task_id.clone(),
            reason,
            resource_type: resource_type.to_string(),
            threshold,
            priority: t.priority_class,
            checkpoint_id: None,
        })
        .collect()
}
