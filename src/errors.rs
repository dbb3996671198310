//! Typed error hierarchy for the orchestrator core.
//!
//! Five top-level families mirror the error taxonomy of the design: transient
//! (retryable), policy (quota/budget refusals), schema (contract mismatches),
//! gate-block (not really an error, a control signal, but modeled here so
//! callers can match on it uniformly) and fatal (unrecoverable). Each
//! subsystem also gets its own narrow error enum; `CoreError` composes them
//! with `#[from]` so call sites can use `?` across subsystem boundaries.

use thiserror::Error;

/// Errors that are safe to retry with backoff (network, timeout, rate limit).
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("dispatch timed out after {0}ms")]
    Timeout(u64),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("transient network error: {0}")]
    Network(String),
}

/// Errors produced by policy enforcement (quota, budget, allow-list).
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(
        "quota exceeded for tenant {tenant_id} resource {resource}: {current_usage} + {requested} > {quota} (+burst {burst})"
    )]
    QuotaExceeded {
        tenant_id: String,
        resource: String,
        current_usage: f64,
        requested: f64,
        quota: f64,
        burst: f64,
    },

    #[error("run {run_id} budget exceeded: spent {spent} of {total} ({percent_used:.1}%)")]
    BudgetExceeded {
        run_id: String,
        spent: f64,
        total: f64,
        percent_used: f64,
    },

    #[error("tool '{0}' is not on the allow-list for this context")]
    NotAllowListed(String),

    #[error("tenant {0} is throttled, admission delayed")]
    Throttled(String),
}

/// Errors from input/output schema validation of a task invocation.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("input for target '{target}' failed schema validation: {reason}")]
    InvalidInput { target: String, reason: String },
    #[error("output for target '{target}' failed schema validation: {reason}")]
    InvalidOutput { target: String, reason: String },
}

/// Not an error proper — a control signal emitted when a gate vetoes
/// advancement. Carried through the error channel so a coordinator can
/// `match` a single `Result` type across dispatch and gate evaluation.
#[derive(Debug, Error)]
#[error("gate blocked phase {phase}: score {score:.1} < threshold, strategy={auto_fix_strategy}")]
pub struct GateBlock {
    pub phase: String,
    pub score: f64,
    pub auto_fix_strategy: String,
}

/// Unrecoverable errors: invariant violations, authorization failures,
/// ledger append failures. Always terminate the run.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("authorization failed: {0}")]
    Unauthorized(String),
    #[error("ledger append failed: {0}")]
    LedgerAppendFailed(String),
    #[error("illegal state transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
}

/// Errors from the Run Ledger subsystem.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("append rejected: {0}")]
    AppendRejected(String),
}

/// Errors from the Quota Enforcer subsystem.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("unknown tenant {0}")]
    UnknownTenant(String),
}

/// Errors from the Task Dispatcher subsystem.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("doer '{0}' not found in registry")]
    UnknownTarget(String),
    #[error("task cancelled")]
    Cancelled,
}

/// Top-level error composing every subsystem error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    GateBlock(#[from] GateBlock),
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("missing input artifact: {0}")]
    MissingInput(String),
    #[error("dependency cycle detected among tasks: {0:?}")]
    CyclicDependency(Vec<String>),
    #[error("no allow-listed tool produces required artifact '{0}'")]
    NoAllowlistedProducer(String),
}

impl CoreError {
    /// Whether this error is safe for the caller to retry: only
    /// `TransientError` is caller-retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }

    /// Whether this error should immediately fail the run (never retried).
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Fatal(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
