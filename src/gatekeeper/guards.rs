//! The eight named guard kinds, as deterministic stub implementations.
//! Real domain-specific analysis (SCA, accessibility, PII scanning, …) is
//! out of scope for the core; each stub here derives a score from whatever
//! signal is already present on the `EvidencePack` so the rubric is
//! exercisable end-to-end without a live analyzer.

use chrono::Utc;

use super::Guard;
use crate::model::{EvidencePack, GuardReport, Severity};

fn report(guard_type: &str, score: f64, reasons: Vec<String>, severity: Severity) -> GuardReport {
    GuardReport {
        guard_type: guard_type.to_string(),
        pass: score >= 0.7,
        score: score.clamp(0.0, 1.0),
        reasons,
        severity,
        timestamp: Utc::now(),
    }
}

/// Are all declared artifacts present?
pub struct CompletenessGuard;
impl Guard for CompletenessGuard {
    fn guard_type(&self) -> &'static str {
        "completeness"
    }
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport {
        let score = if pack.artifact_ids.is_empty() { 0.0 } else { 1.0 };
        let reasons = if pack.artifact_ids.is_empty() {
            vec!["no artifacts produced".to_string()]
        } else {
            vec![]
        };
        report("completeness", score, reasons, Severity::Medium)
    }
}

/// Do any guard reports contradict each other (one passes, one with the
/// same severity critically fails)?
pub struct ContradictionsGuard;
impl Guard for ContradictionsGuard {
    fn guard_type(&self) -> &'static str {
        "contradictions"
    }
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport {
        let critical_and_passing = pack
            .guard_reports
            .iter()
            .filter(|r| r.severity == Severity::Critical)
            .any(|r| r.pass);
        let critical_and_failing = pack
            .guard_reports
            .iter()
            .any(|r| r.severity == Severity::Critical && !r.pass);
        let contradiction = critical_and_passing && critical_and_failing;
        let score = if contradiction { 0.0 } else { 1.0 };
        let reasons = if contradiction {
            vec!["conflicting critical-severity guard reports".to_string()]
        } else {
            vec![]
        };
        report("contradictions", score, reasons, Severity::Medium)
    }
}

/// Fraction of `kmapRefs` present vs. expected (stubbed as "any present").
pub struct CoverageGuard;
impl Guard for CoverageGuard {
    fn guard_type(&self) -> &'static str {
        "coverage"
    }
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport {
        let score = if pack.kmap_refs.is_empty() { 0.6 } else { 0.9 };
        report("coverage", score, vec![], Severity::Low)
    }
}

/// Placeholder pending domain-specific guards; derives a deterministic
/// score from `qavSummary` presence rather than randomized sampling.
pub struct QualityGuard;
impl Guard for QualityGuard {
    fn guard_type(&self) -> &'static str {
        "quality"
    }
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport {
        let score = pack
            .qav_summary
            .as_ref()
            .and_then(|s| s.get("score"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.8);
        report("quality", score, vec![], Severity::Low)
    }
}

/// Critical/high CVE count. Critical findings are hard blockers.
pub struct SecurityGuard;
impl Guard for SecurityGuard {
    fn guard_type(&self) -> &'static str {
        "security"
    }
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport {
        let cve_count = pack
            .qav_summary
            .as_ref()
            .and_then(|s| s.get("critical_cve_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if cve_count > 0 {
            return report(
                "security",
                0.0,
                vec![format!("{cve_count} critical CVE(s) detected")],
                Severity::Critical,
            );
        }
        report("security", 1.0, vec![], Severity::Low)
    }
    fn is_hard_blocker(&self, report: &GuardReport) -> bool {
        !report.pass && report.severity == Severity::Critical
    }
}

/// Wall-clock/duration efficiency relative to the pack's recorded metrics.
pub struct PerformanceGuard;
impl Guard for PerformanceGuard {
    fn guard_type(&self) -> &'static str {
        "performance"
    }
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport {
        let score = if pack.metrics.duration_ms == 0 {
            0.8
        } else if pack.metrics.duration_ms < 60_000 {
            1.0
        } else {
            0.6
        };
        report("performance", score, vec![], Severity::Low)
    }
}

/// Citation coverage and staleness. Placeholder pending domain-specific
/// guards.
pub struct GroundingGuard;
impl Guard for GroundingGuard {
    fn guard_type(&self) -> &'static str {
        "grounding"
    }
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport {
        let score = if pack.kmap_refs.len() >= 1 { 0.85 } else { 0.5 };
        let reasons = if score < 0.7 {
            vec!["no citations found".to_string()]
        } else {
            vec![]
        };
        report("grounding", score, reasons, Severity::Medium)
    }
}

/// PII redaction and DSAR readiness. A detected secret is a hard blocker.
pub struct PrivacyGuard;
impl Guard for PrivacyGuard {
    fn guard_type(&self) -> &'static str {
        "privacy"
    }
    fn evaluate(&self, pack: &EvidencePack) -> GuardReport {
        let secret_detected = pack
            .qav_summary
            .as_ref()
            .and_then(|s| s.get("secret_detected"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if secret_detected {
            return report("privacy", 0.0, vec!["secret detected in output".to_string()], Severity::Critical);
        }
        report("privacy", 1.0, vec![], Severity::Low)
    }
    fn is_hard_blocker(&self, report: &GuardReport) -> bool {
        !report.pass && report.severity == Severity::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UsageMetrics;

    fn empty_pack() -> EvidencePack {
        EvidencePack {
            artifact_ids: vec![],
            guard_reports: vec![],
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

    #[test]
    fn completeness_fails_with_no_artifacts() {
        let report = CompletenessGuard.evaluate(&empty_pack());
        assert!(!report.pass);
    }

    #[test]
    fn security_guard_flags_critical_cve_as_hard_blocker() {
        let mut pack = empty_pack();
        pack.qav_summary = Some(serde_json::json!({"critical_cve_count": 1}));
        let guard = SecurityGuard;
        let report = guard.evaluate(&pack);
        assert!(guard.is_hard_blocker(&report));
        assert_eq!(report.severity, Severity::Critical);
    }

    #[test]
    fn security_guard_passes_with_no_cves() {
        let report = SecurityGuard.evaluate(&empty_pack());
        assert!(report.pass);
    }

    #[test]
    fn privacy_guard_flags_detected_secret() {
        let mut pack = empty_pack();
        pack.qav_summary = Some(serde_json::json!({"secret_detected": true}));
        let guard = PrivacyGuard;
        let report = guard.evaluate(&pack);
        assert!(guard.is_hard_blocker(&report));
    }

    #[test]
    fn all_guard_scores_are_clamped_to_unit_interval() {
        let pack = empty_pack();
        let guards: Vec<Box<dyn Guard>> = vec![
            Box::new(CompletenessGuard),
            Box::new(ContradictionsGuard),
            Box::new(CoverageGuard),
            Box::new(QualityGuard),
            Box::new(SecurityGuard),
            Box::new(PerformanceGuard),
            Box::new(GroundingGuard),
            Box::new(PrivacyGuard),
        ];
        for guard in guards {
            let report = guard.evaluate(&pack);
            assert!((0.0..=1.0).contains(&report.score));
        }
    }
}
