//! phaseforge: a multi-phase workflow orchestrator core.
//!
//! Wires together a Workflow Engine (run state machine), Phase Coordinator
//! (per-phase task DAG dispatch), Priority Scheduler, Gatekeeper, Budget
//! Guard, Quota Enforcer, Self-Execution Mode fallback executor, and an
//! append-only Run Ledger. The crate is domain-agnostic: what each phase's
//! tasks actually do is supplied by the embedder through
//! `engine::PhaseManifestProvider` and the `registry::Registry` of agents
//! and tools.

pub mod budget;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod events;
pub mod gatekeeper;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod sem;
