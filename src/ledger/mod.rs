//! Run Ledger: immutable, append-only per-run timeline of tasks, gates,
//! decisions, artifacts, costs and signatures.

mod store;

pub use store::LedgerStore;

use serde::{Deserialize, Serialize};

use crate::errors::LedgerError;
use crate::model::{DeliberationScore, LedgerEntry, LedgerEntryType, Provenance};

/// Query filter for `Ledger::query`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerQuery {
    pub run_id: Option<String>,
    pub entry_type: Option<LedgerEntryType>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub total_tool_minutes: f64,
}

/// The ledger's public operations: append, query, timeline, cost summary.
/// Backed by `LedgerStore` (SQLite); this type is the thin API surface the
/// rest of the engine calls through.
pub struct RunLedger {
    store: LedgerStore,
}

impl RunLedger {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    /// Append-only; a `UNIQUE(run_id, sequence)` constraint in the store
    /// enforces strictly increasing `sequence` per run.
    pub fn append(
        &self,
        run_id: &str,
        entry_type: LedgerEntryType,
        data: serde_json::Value,
        provenance: Provenance,
    ) -> Result<LedgerEntry, LedgerError> {
        self.store.append(run_id, entry_type, data, provenance)
    }

    pub fn query(&self, query: LedgerQuery) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.query(query)
    }

    pub fn record_deliberation_score(&self, score: &DeliberationScore) -> Result<(), LedgerError> {
        self.store.record_deliberation_score(score)
    }

    pub fn timeline(&self, run_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.query(LedgerQuery {
            run_id: Some(run_id.to_string()),
            ..Default::default()
        })
    }

    pub fn cost_summary(&self, run_id: &str) -> Result<CostSummary, LedgerError> {
        let entries = self.store.query(LedgerQuery {
            run_id: Some(run_id.to_string()),
            entry_type: Some(LedgerEntryType::Cost),
            ..Default::default()
        })?;
        let mut summary = CostSummary::default();
        for entry in &entries {
            summary.total_cost_usd += entry.data.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
            summary.total_tokens += entry.data.get("tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            summary.total_tool_minutes +=
                entry.data.get("tool_minutes").and_then(|v| v.as_f64()).unwrap_or(0.0);
        }
        Ok(summary)
    }
}
