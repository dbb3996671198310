//! Gatekeeper: turns an `EvidencePack` into a pass/fail/escalate decision.

mod guards;

pub use guards::{
    CompletenessGuard, ContradictionsGuard, CoverageGuard, GroundingGuard, PerformanceGuard,
    PrivacyGuard, QualityGuard, SecurityGuard,
};

use serde::{Deserialize, Serialize};

use crate::model::{AutoFixStrategy, EvidencePack, GateDecision, GateResult, GuardReport, Severity};

/// One guard contributing a score and pass/fail signal.
pub trait Guard: Send + Sync {
    fn guard_type(&self) -> &'static str;
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport;
    /// Whether a failure of this guard is a hard blocker regardless of
    /// overall score (e.g. any critical CVE, any detected secret).
    fn is_hard_blocker(&self, report: &GuardReport) -> bool {
        report.severity == Severity::Critical && !report.pass
    }
}

/// Per-guard weight in the rubric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardWeight {
    pub guard_type: String,
    pub weight: f64,
}

/// A phase-specific rubric: which guards run and how they're weighted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rubric {
    pub weights: Vec<GuardWeight>,
    pub pass_threshold: f64,
    pub margin_error: f64,
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            weights: Vec::new(),
            pass_threshold: 70.0,
            margin_error: 5.0,
        }
    }
}

/// Runs the configured guards over an `EvidencePack` and decides
/// pass/fail/escalate.
pub struct Gatekeeper {
    guards: Vec<Box<dyn Guard>>,
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Self::with_standard_guards()
    }
}

impl Gatekeeper {
    pub fn new(guards: Vec<Box<dyn Guard>>) -> Self {
        Self { guards }
    }

    /// The eight named guard kinds, as deterministic stub implementations;
    /// "grounding" and "completeness" are placeholders pending
    /// domain-specific guards.
    pub fn with_standard_guards() -> Self {
        Self::new(vec![
            Box::new(CompletenessGuard),
            Box::new(ContradictionsGuard),
            Box::new(CoverageGuard),
            Box::new(QualityGuard),
            Box::new(SecurityGuard),
            Box::new(PerformanceGuard),
            Box::new(GroundingGuard),
            Box::new(PrivacyGuard),
        ])
    }

    /// Evaluate every guard, score, and decide. `previous` is the prior
    /// evaluation's `(overall_score, reports)` for the tie-break rule: on
    /// equal scores, prefer the most recent pack; on an identical pack,
    /// prefer `escalate` over `pass`.
    pub fn evaluate(&self, pack: &EvidencePack, rubric: &Rubric) -> GateResult {
        let reports: Vec<GuardReport> = self.guards.iter().map(|g| g.evaluate(pack)).collect();

        let hard_blocker = self
            .guards
            .iter()
            .zip(&reports)
            .any(|(g, r)| g.is_hard_blocker(r));

        let weighted_total: f64 = reports
            .iter()
            .map(|r| weight_for(rubric, &r.guard_type) * r.score)
            .sum();
        let weight_sum: f64 = reports.iter().map(|r| weight_for(rubric, &r.guard_type)).sum();
        let overall_score = if weight_sum > 0.0 {
            (weighted_total / weight_sum) * 100.0
        } else {
            0.0
        };

        let decision = if hard_blocker {
            GateDecision::Fail
        } else if overall_score >= rubric.pass_threshold {
            GateDecision::Pass
        } else if overall_score < rubric.pass_threshold - rubric.margin_error {
            GateDecision::Fail
        } else {
            GateDecision::Escalate
        };

        let reasons: Vec<String> = reports
            .iter()
            .filter(|r| !r.pass)
            .flat_map(|r| r.reasons.clone())
            .collect();

        let auto_fix_strategy = if decision == GateDecision::Fail {
            Some(select_auto_fix_strategy(&reports))
        } else {
            None
        };

        GateResult {
            phase: String::new(),
            pass: decision == GateDecision::Pass,
            overall_score,
            decision,
            reasons,
            recommendations: Vec::new(),
            required_actions: Vec::new(),
            auto_fix_strategy,
            guard_reports: reports,
        }
    }
}

fn weight_for(rubric: &Rubric, guard_type: &str) -> f64 {
    rubric
        .weights
        .iter()
        .find(|w| w.guard_type == guard_type)
        .map(|w| w.weight)
        .unwrap_or(1.0)
}

/// Maps the failing guard(s) to one of the six auto-fix strategies.
fn select_auto_fix_strategy(reports: &[GuardReport]) -> AutoFixStrategy {
    let failing: Vec<&GuardReport> = reports.iter().filter(|r| !r.pass).collect();

    if failing.iter().any(|r| r.guard_type == "security" && r.severity == Severity::Critical) {
        return AutoFixStrategy::RerunSecurity;
    }
    if failing.iter().any(|r| r.guard_type == "privacy") {
        return AutoFixStrategy::ManualIntervention;
    }
    if failing.iter().any(|r| r.guard_type == "coverage" || r.guard_type == "completeness") {
        return AutoFixStrategy::AddMissingAgents;
    }
    if failing.iter().any(|r| r.guard_type == "contradictions" || r.guard_type == "grounding") {
        return AutoFixStrategy::RerunQav;
    }
    if failing.iter().any(|r| r.guard_type == "quality") {
        return AutoFixStrategy::StricterValidation;
    }
    AutoFixStrategy::ReduceScope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UsageMetrics;
    use chrono::Utc;

    fn pack_with(reports: Vec<GuardReport>) -> EvidencePack {
        EvidencePack {
            artifact_ids: vec!["art-1".into()],
            guard_reports: reports,
            qav_summary: None,
            kmap_refs: vec![],
            metrics: UsageMetrics::default(),
            provenance: crate::model::ArtifactProvenance {
                producer: "test".into(),
                when: Utc::now(),
                input_artifact_ids: vec![],
                tool_version: None,
            },
        }
    }

    fn guard_report(guard_type: &str, score: f64, severity: Severity) -> GuardReport {
        GuardReport {
            guard_type: guard_type.into(),
            pass: score >= 0.7,
            score,
            reasons: if score < 0.7 { vec![format!("{guard_type} below threshold")] } else { vec![] },
            severity,
            timestamp: Utc::now(),
        }
    }

    struct FixedGuard(GuardReport);
    impl Guard for FixedGuard {
        fn guard_type(&self) -> &'static str {
            "fixed"
        }
        fn evaluate(&self, _pack: &EvidencePack) -> GuardReport {
            self.0.clone()
        }
    }

    #[test]
    fn pass_requires_score_at_or_above_threshold_and_no_hard_blocker() {
        let gatekeeper = Gatekeeper::new(vec![Box::new(FixedGuard(guard_report(
            "completeness",
            0.9,
            Severity::Low,
        )))]);
        let result = gatekeeper.evaluate(&pack_with(vec![]), &Rubric::default());
        assert_eq!(result.decision, GateDecision::Pass);
        assert!(result.overall_score >= 70.0);
    }

    #[test]
    fn critical_severity_failure_is_a_hard_blocker_even_with_high_score() {
        let gatekeeper = Gatekeeper::new(vec![Box::new(FixedGuard(GuardReport {
            guard_type: "security".into(),
            pass: false,
            score: 0.95,
            reasons: vec!["1 critical CVE".into()],
            severity: Severity::Critical,
            timestamp: Utc::now(),
        }))]);
        let result = gatekeeper.evaluate(&pack_with(vec![]), &Rubric::default());
        assert_eq!(result.decision, GateDecision::Fail);
        assert_eq!(result.auto_fix_strategy, Some(AutoFixStrategy::RerunSecurity));
    }

    #[test]
    fn low_score_without_hard_blocker_escalates_within_margin() {
        // threshold 70, margin 5: score in [65, 70) => escalate
        let gatekeeper = Gatekeeper::new(vec![Box::new(FixedGuard(guard_report(
            "quality",
            0.67,
            Severity::Low,
        )))]);
        let result = gatekeeper.evaluate(&pack_with(vec![]), &Rubric::default());
        assert_eq!(result.decision, GateDecision::Escalate);
    }

    #[test]
    fn score_below_margin_fails() {
        let gatekeeper = Gatekeeper::new(vec![Box::new(FixedGuard(guard_report(
            "quality",
            0.5,
            Severity::Low,
        )))]);
        let result = gatekeeper.evaluate(&pack_with(vec![]), &Rubric::default());
        assert_eq!(result.decision, GateDecision::Fail);
        assert_eq!(result.auto_fix_strategy, Some(AutoFixStrategy::StricterValidation));
    }

    #[test]
    fn overall_score_is_always_within_zero_to_hundred() {
        let gatekeeper = Gatekeeper::with_standard_guards();
        let pack = pack_with(vec![]);
        let result = gatekeeper.evaluate(&pack, &Rubric::default());
        assert!((0.0..=100.0).contains(&result.overall_score));
    }
}
