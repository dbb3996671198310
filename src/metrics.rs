//! Metrics & Recorder. An injected dependency with an explicit
//! start/flush/stop lifecycle rather than module-level globals, so tests
//! and embedded deployments can run multiple engines per process.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One recorded step outcome, with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub phase: String,
    pub step: String,
    pub actor: String,
    pub inputs: Option<serde_json::Value>,
    pub outputs: Option<serde_json::Value>,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub status: String,
    pub metadata: serde_json::Value,
}

/// Aggregated per-phase metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub duration_ms: u64,
    pub gate_score: Option<f64>,
    pub agent_successes: u32,
    pub agent_failures: u32,
    pub tokens: u64,
    pub tool_minutes: f64,
    pub cost_usd: f64,
    pub test_pass_percent: Option<f64>,
    pub coverage_percent: Option<f64>,
    pub cve_count: Option<u32>,
}

impl PhaseMetrics {
    pub fn record_step(&mut self, record: &StepRecord) {
        self.cost_usd += record.cost_usd;
        self.duration_ms += record.latency_ms;
        if record.status == "succeeded" {
            self.agent_successes += 1;
        } else if record.status == "failed" {
            self.agent_failures += 1;
        }
    }
}

/// In-process recorder: keyed by `(run_id, phase)`, holding both the raw
/// step log and the rolled-up phase aggregate.
pub struct Recorder {
    steps: DashMap<(String, String), Vec<StepRecord>>,
    phase_metrics: DashMap<(String, String), PhaseMetrics>,
    started: std::sync::atomic::AtomicBool,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            steps: DashMap::new(),
            phase_metrics: DashMap::new(),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.started.store(true, std::sync::atomic::Ordering::SeqCst);
        info!("metrics recorder started");
    }

    pub fn record(&self, record: StepRecord) {
        let key = (record.run_id.clone(), record.phase.clone());
        self.phase_metrics
            .entry(key.clone())
            .or_default()
            .record_step(&record);
        self.steps.entry(key).or_default().push(record);
    }

    pub fn phase_metrics(&self, run_id: &str, phase: &str) -> Option<PhaseMetrics> {
        self.phase_metrics
            .get(&(run_id.to_string(), phase.to_string()))
            .map(|r| r.clone())
    }

    pub fn steps(&self, run_id: &str, phase: &str) -> Vec<StepRecord> {
        self.steps
            .get(&(run_id.to_string(), phase.to_string()))
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Flush is a no-op for the in-process recorder; a durable backend
    /// would drain buffered rows to storage here.
    pub fn flush(&self) {}

    pub fn stop(&self) {
        self.started.store(false, std::sync::atomic::Ordering::SeqCst);
        self.flush();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(std::sync::atomic::Ordering::SeqCst)
    }
}

pub type SharedRecorder = Arc<Recorder>;

#[cfg(test)]
mod tests {
    use super::*;

    fn step(run_id: &str, phase: &str, status: &str, cost: f64) -> StepRecord {
        StepRecord {
            run_id: run_id.into(),
            phase: phase.into(),
            step: "classify".into(),
            actor: "agent.classifier".into(),
            inputs: None,
            outputs: None,
            cost_usd: cost,
            latency_ms: 100,
            status: status.into(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn phase_metrics_aggregates_cost_and_outcomes() {
        let recorder = Recorder::new();
        recorder.record(step("run-1", "intake", "succeeded", 0.1));
        recorder.record(step("run-1", "intake", "failed", 0.2));
        let metrics = recorder.phase_metrics("run-1", "intake").unwrap();
        assert_eq!(metrics.agent_successes, 1);
        assert_eq!(metrics.agent_failures, 1);
        assert!((metrics.cost_usd - 0.3).abs() < 1e-9);
    }

    #[test]
    fn steps_are_scoped_per_run_and_phase() {
        let recorder = Recorder::new();
        recorder.record(step("run-1", "intake", "succeeded", 0.1));
        recorder.record(step("run-2", "intake", "succeeded", 0.1));
        assert_eq!(recorder.steps("run-1", "intake").len(), 1);
        assert_eq!(recorder.steps("run-2", "intake").len(), 1);
        assert!(recorder.steps("run-1", "arch").is_empty());
    }

    #[test]
    fn start_stop_toggles_started_flag() {
        let recorder = Recorder::new();
        assert!(!recorder.is_started());
        recorder.start();
        assert!(recorder.is_started());
        recorder.stop();
        assert!(!recorder.is_started());
    }
}
