use serde::{Deserialize, Serialize};

/// Output of one Gatekeeper guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardReport {
    pub guard_type: String,
    pub pass: bool,
    /// Always in `[0, 1]`.
    pub score: f64,
    pub reasons: Vec<String>,
    pub severity: Severity,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageMetrics {
    pub duration_ms: u64,
    pub tokens: u64,
    pub tool_minutes: f64,
    pub cost_usd: f64,
}

/// The aggregated input a Gatekeeper evaluates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePack {
    pub artifact_ids: Vec<String>,
    pub guard_reports: Vec<GuardReport>,
    pub qav_summary: Option<serde_json::Value>,
    pub kmap_refs: Vec<String>,
    pub metrics: UsageMetrics,
    pub provenance: super::artifact::ArtifactProvenance,
}

impl EvidencePack {
    /// `guardReports` is non-empty and every score is in range — the
    /// invariant the Gatekeeper relies on before scoring.
    pub fn is_well_formed(&self) -> bool {
        !self.guard_reports.is_empty()
            && self
                .guard_reports
                .iter()
                .all(|g| (0.0..=1.0).contains(&g.score))
    }
}
