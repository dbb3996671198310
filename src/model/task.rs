use serde::{Deserialize, Serialize};

use super::run::Budget;

/// Priority class and its numeric scheduling weight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriorityClass {
    /// First to be preempted.
    P3,
    /// Default priority.
    P2,
    /// Preempts P2/P3.
    P1,
    /// Critical, never preempted.
    P0,
}

impl PriorityClass {
    /// Higher sorts first in the ready queue.
    pub fn weight(&self) -> u32 {
        match self {
            PriorityClass::P0 => 1000,
            PriorityClass::P1 => 100,
            PriorityClass::P2 => 10,
            PriorityClass::P3 => 1,
        }
    }
}

impl Default for PriorityClass {
    fn default() -> Self {
        PriorityClass::P2
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Agent,
    Tool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Preempted,
    Succeeded,
    Failed,
    BlockedBySem,
}

/// Exponential backoff policy shared by tasks and phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retryCount, max)`.
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        let scaled = self.base_delay_ms.saturating_mul(1u64 << retry_count.min(32));
        scaled.min(self.max_delay_ms)
    }
}

/// One agent or tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub phase: String,
    pub task_type: TaskType,
    pub target: String,
    pub input: serde_json::Value,
    pub budget: Budget,
    pub dependencies: Vec<String>,
    pub idempotence_key: Option<String>,
    #[serde(default)]
    pub priority_class: PriorityClass,
    pub preempted: bool,
    pub preemption_count: u32,
    pub retry_policy: RetryPolicy,
    pub state: TaskState,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    /// The artifact tag this task is expected to produce, if any; used by
    /// SEM to find a substitute producer on the allow-list.
    /// Defaults to the task's own `target` name when unset.
    #[serde(default)]
    pub expected_artifact_type: Option<String>,
}

impl TaskSpec {
    pub fn new(
        task_id: String,
        phase: String,
        task_type: TaskType,
        target: String,
        input: serde_json::Value,
        budget: Budget,
        dependencies: Vec<String>,
        enqueued_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            task_id,
            phase,
            task_type,
            target,
            input,
            budget,
            dependencies,
            idempotence_key: None,
            priority_class: PriorityClass::default(),
            preempted: false,
            preemption_count: 0,
            retry_policy: RetryPolicy::default(),
            state: TaskState::Pending,
            enqueued_at,
            expected_artifact_type: None,
        }
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority_class = priority;
        self
    }

    pub fn with_idempotence_key(mut self, key: impl Into<String>) -> Self {
        self.idempotence_key = Some(key.into());
        self
    }

    pub fn with_expected_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.expected_artifact_type = Some(artifact_type.into());
        self
    }

    /// The artifact tag SEM should look for a substitute producer of,
    /// falling back to `target` when not explicitly declared.
    pub fn artifact_type_or_target(&self) -> &str {
        self.expected_artifact_type.as_deref().unwrap_or(&self.target)
    }

    /// Runs only once all dependency tasks are `Succeeded`.
    pub fn dependencies_satisfied(&self, succeeded: &std::collections::HashSet<String>) -> bool {
        self.dependencies.iter().all(|d| succeeded.contains(d))
    }
}
