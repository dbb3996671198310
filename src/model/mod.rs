//! Domain types shared across every subsystem: runs, phases, tasks,
//! artifacts, evidence packs, gate results, tenant quotas and SEM records.
//!
//! Everything here is a plain serde-derived struct or enum; the subsystem
//! modules (`engine`, `coordinator`, `gatekeeper`, …) own the behavior that
//! operates on these shapes.

mod artifact;
mod evidence;
mod manifest;
mod run;
mod task;
mod tenant;

pub use artifact::{Artifact, ArtifactProvenance};
pub use evidence::{EvidencePack, GuardReport, Severity, UsageMetrics};
pub use manifest::{AgentManifest, RuntimeClass, ToolManifest};
pub use run::{Budget, Run, RunState};
pub use task::{PriorityClass, RetryPolicy, TaskSpec, TaskState, TaskType};
pub use tenant::{TenantQuota, TenantTier, UsageRecord};

use serde::{Deserialize, Serialize};

/// Outcome of one gate evaluation, returned by the Gatekeeper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateResult {
    pub phase: String,
    pub pass: bool,
    /// Renormalized weighted score, always in `[0, 100]`.
    pub overall_score: f64,
    pub decision: GateDecision,
    pub reasons: Vec<String>,
    pub recommendations: Vec<String>,
    pub required_actions: Vec<String>,
    pub auto_fix_strategy: Option<AutoFixStrategy>,
    /// Per-guard reports backing `overall_score`, carried through so
    /// callers can persist one `deliberation_scores` row per guard.
    pub guard_reports: Vec<GuardReport>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Pass,
    Fail,
    Escalate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AutoFixStrategy {
    RerunQav,
    AddMissingAgents,
    RerunSecurity,
    StricterValidation,
    ReduceScope,
    ManualIntervention,
}

/// One immutable row in the Run Ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Monotonic per `run_id`; enforced by a `UNIQUE(run_id, sequence)` constraint.
    pub sequence: i64,
    pub entry_type: LedgerEntryType,
    pub data: serde_json::Value,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Task,
    Gate,
    Decision,
    Artifact,
    Cost,
    Signature,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Provenance {
    pub who: String,
    pub when: Option<chrono::DateTime<chrono::Utc>>,
    pub tool_version: Option<String>,
    pub inputs: Vec<String>,
}

/// One Self-Execution Mode intervention record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemInterventionRecord {
    pub intervention_id: String,
    pub run_id: String,
    pub phase: String,
    pub trigger: SemTrigger,
    pub original_doer: String,
    pub context_snapshot: serde_json::Value,
    pub micro_plan: serde_json::Value,
    pub claimed_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: SemStatus,
    pub tools_used: Vec<String>,
    pub gate_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SemTrigger {
    HeartbeatTimeout,
    Stalled,
    SchemaFailure,
    ToolFailure,
    GateDeadlock,
    Underperformance,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SemStatus {
    Active,
    Completed,
    Failed,
}

/// Lightweight per-guard score row appended alongside each `GateResult` so
/// dashboards can chart guard trends over time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationScore {
    pub run_id: String,
    pub phase: String,
    pub guard: String,
    pub score: f64,
    pub at: chrono::DateTime<chrono::Utc>,
}
