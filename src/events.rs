//! Phase and run lifecycle events.
//!
//! Events are values, not callbacks: the engine emits into an `EventSink`;
//! transport — HTTP, queue, in-process — is decided by the embedder.
//! `ChannelEventSink` is the default in-process implementation, backed by
//! `tokio::sync::mpsc`, used by tests and the demo binary.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{AutoFixStrategy, GuardReport};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseBudgets {
    pub tokens: u64,
    pub tools_minutes: f64,
    pub wallclock_minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
    pub percent: f64,
    pub current_task: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageSnapshot {
    pub tokens: u64,
    pub tools_minutes: f64,
    pub wallclock_ms: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReason {
    pub category: String,
    pub description: String,
    pub severity: String,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseCompletionStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PhaseEvent {
    #[serde(rename = "run.created")]
    RunCreated { run_id: String },
    #[serde(rename = "phase.started")]
    PhaseStarted {
        run_id: String,
        phase: String,
        budgets: PhaseBudgets,
        agents: Vec<String>,
        parallelism: String,
    },
    #[serde(rename = "phase.progress")]
    PhaseProgress {
        run_id: String,
        phase: String,
        progress: Progress,
        usage: UsageSnapshot,
    },
    #[serde(rename = "phase.ready")]
    PhaseReady {
        run_id: String,
        phase: String,
        artifacts: Vec<String>,
        usage: UsageSnapshot,
        kmap_refs: Vec<String>,
    },
    #[serde(rename = "phase.gate.passed")]
    PhaseGatePassed {
        run_id: String,
        phase: String,
        gate_score: f64,
        pass_threshold: f64,
        guard_reports: Vec<GuardReport>,
        qav_summary: Option<serde_json::Value>,
        next_phase: Option<String>,
    },
    #[serde(rename = "phase.gate.failed")]
    PhaseGateFailed {
        run_id: String,
        phase: String,
        gate_score: f64,
        guard_reports: Vec<GuardReport>,
        failure_reasons: Vec<FailureReason>,
        attempt: u32,
        max_attempts: u32,
        auto_fix_strategy: Option<AutoFixStrategy>,
    },
    #[serde(rename = "phase.stalled")]
    PhaseStalled {
        run_id: String,
        phase: String,
        stall_duration_ms: u64,
        last_progress: Progress,
        suspected_cause: String,
        unsticker_action: String,
    },
    #[serde(rename = "phase.completed")]
    PhaseCompleted {
        run_id: String,
        phase: String,
        status: PhaseCompletionStatus,
        duration_ms: u64,
        usage: UsageSnapshot,
        artifacts: Vec<String>,
        gate_score: Option<f64>,
        attempts: u32,
        errors: Vec<String>,
        next_phase: Option<String>,
    },
    #[serde(rename = "run.paused")]
    RunPaused {
        run_id: String,
        reason: Option<String>,
        by: Option<String>,
    },
    #[serde(rename = "run.resumed")]
    RunResumed { run_id: String, by: Option<String> },
    #[serde(rename = "run.failed")]
    RunFailed {
        run_id: String,
        reason: Option<String>,
    },
    #[serde(rename = "run.completed")]
    RunCompleted { run_id: String },
}

/// Sink events are emitted into. The embedder decides the transport.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PhaseEvent);
}

/// Default in-process sink: emits onto an unbounded `mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<PhaseEvent>,
}

impl ChannelEventSink {
    /// Returns the sink and the receiver end the embedder drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PhaseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: PhaseEvent) {
        // A dropped receiver just means nobody is listening; emission must
        // never block or fail run execution.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_emitted_events() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.emit(PhaseEvent::RunCompleted {
            run_id: "run-1".into(),
        });
        let event = rx.recv().await.unwrap();
        match event {
            PhaseEvent::RunCompleted { run_id } => assert_eq!(run_id, "run-1"),
            _ => panic!("unexpected event"),
        }
    }

    #[test]
    fn channel_sink_emit_does_not_panic_after_receiver_dropped() {
        let (sink, rx) = ChannelEventSink::new();
        drop(rx);
        sink.emit(PhaseEvent::RunCompleted {
            run_id: "run-1".into(),
        });
    }
}
