//! Task Dispatcher. Invokes an agent or tool with a `TaskSpec`,
//! enforces the per-task budget/timeout, and produces artifacts. Owns the
//! content-addressed idempotence cache with single-flight concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{DispatchError, SchemaError, TransientError};
use crate::model::{Artifact, TaskSpec};

/// The contract passed to a `Doer::invoke` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: String,
    pub run_id: String,
    pub agent_id: Option<String>,
    pub phase: String,
    pub trace_id: Option<String>,
    pub input: serde_json::Value,
    pub budget_remaining_ms: u64,
}

impl DispatchRequest {
    pub fn from_task(task: &TaskSpec, run_id: &str, trace_id: Option<String>) -> Self {
        Self {
            task_id: task.task_id.clone(),
            run_id: run_id.to_string(),
            agent_id: Some(task.target.clone()),
            phase: task.phase.clone(),
            trace_id,
            input: task.input.clone(),
            budget_remaining_ms: (task.budget.max_wallclock_minutes * 60_000.0) as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub ok: bool,
    pub output: Option<serde_json::Value>,
    pub artifacts: Vec<Artifact>,
    pub duration_ms: u64,
    pub tokens: u64,
    pub tool_minutes: f64,
    pub cost_usd: f64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub execution_id: String,
}

/// An agent or tool callable, invoked by the dispatcher with an opaque
/// request/response contract.
#[async_trait]
pub trait Doer: Send + Sync {
    async fn invoke(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError>;
}

fn idempotence_hash(target: &str, version: &str, input: &serde_json::Value, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update(version.as_bytes());
    hasher.update(input.to_string().as_bytes());
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

enum CacheSlot {
    InFlight(Arc<Notify>),
    Done(DispatchResponse),
}

/// Content-addressed cache keyed by `hash(target, version, input, key)`;
/// at most one concurrent computation per key.
#[derive(Default)]
pub struct IdempotenceCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
}

impl IdempotenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cached response if one exists, otherwise registers this
    /// caller as the single in-flight computation and returns `None`. A
    /// caller that receives `None` must call `complete` when done.
    pub async fn acquire(
        &self,
        target: &str,
        version: &str,
        input: &serde_json::Value,
        key: &str,
    ) -> Option<DispatchResponse> {
        let hash = idempotence_hash(target, version, input, key);
        loop {
            let notify = {
                let mut slots = self.slots.lock().await;
                match slots.get(&hash) {
                    Some(CacheSlot::Done(resp)) => return Some(resp.clone()),
                    Some(CacheSlot::InFlight(notify)) => notify.clone(),
                    None => {
                        slots.insert(hash.clone(), CacheSlot::InFlight(Arc::new(Notify::new())));
                        return None;
                    }
                }
            };
            notify.notified().await;
        }
    }

    pub async fn complete(
        &self,
        target: &str,
        version: &str,
        input: &serde_json::Value,
        key: &str,
        response: DispatchResponse,
    ) {
        let hash = idempotence_hash(target, version, input, key);
        let mut slots = self.slots.lock().await;
        if let Some(CacheSlot::InFlight(notify)) = slots.remove(&hash) {
            notify.notify_waiters();
        }
        slots.insert(hash, CacheSlot::Done(response));
    }
}

impl Clone for DispatchResponse {
    fn clone(&self) -> Self {
        DispatchResponse {
            ok: self.ok,
            output: self.output.clone(),
            artifacts: self.artifacts.clone(),
            duration_ms: self.duration_ms,
            tokens: self.tokens,
            tool_minutes: self.tool_minutes,
            cost_usd: self.cost_usd,
            retry_count: self.retry_count,
            error: self.error.clone(),
            execution_id: self.execution_id.clone(),
        }
    }
}

/// Task Dispatcher: wraps a `Doer` invocation with timeout, cooperative
/// cancellation, and idempotence caching.
pub struct Dispatcher {
    cache: IdempotenceCache,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            cache: IdempotenceCache::new(),
        }
    }

    /// Dispatch one task through `doer`, honoring the task's wallclock
    /// budget and a cooperative cancellation token.
    pub async fn dispatch(
        &self,
        task: &TaskSpec,
        doer: Arc<dyn Doer>,
        target_version: &str,
        cancellation: CancellationToken,
    ) -> Result<DispatchResponse, DispatchError> {
        if let Some(key) = &task.idempotence_key {
            if let Some(cached) = self
                .cache
                .acquire(&task.target, target_version, &task.input, key)
                .await
            {
                info!(task_id = %task.task_id, "idempotence cache hit");
                return Ok(cached);
            }
        }

        let request = DispatchRequest::from_task(task, "unknown-run", None);
        let timeout = Duration::from_secs_f64(task.budget.max_wallclock_minutes * 60.0);

        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(DispatchError::Cancelled),
            res = tokio::time::timeout(timeout, doer.invoke(request)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(DispatchError::Transient(TransientError::Timeout(timeout.as_millis() as u64))),
            },
        };

        if let Ok(response) = &result {
            if let Some(key) = &task.idempotence_key {
                self.cache
                    .complete(&task.target, target_version, &task.input, key, response.clone())
                    .await;
            }
        }

        result
    }

    /// Validate a response's output against the target's declared output
    /// schema is the embedder's job (schemas are opaque JSON values here);
    /// this helper only distinguishes "present" from "absent" for
    /// `schemaFailure` classification.
    pub fn validate_output_present(
        target: &str,
        response: &DispatchResponse,
    ) -> Result<(), SchemaError> {
        if response.ok && response.output.is_none() {
            warn!(target, "dispatcher response ok=true with no output");
            return Err(SchemaError::InvalidOutput {
                target: target.to_string(),
                reason: "ok response carried no output".to_string(),
            });
        }
        Ok(())
    }
}
