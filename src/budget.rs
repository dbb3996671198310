//! Budget Guard: per-run enforcement of total cost/tokens/time.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::{Budget, PriorityClass};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetEventType {
    Warn,
    Throttle,
    Pause,
    Preempt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    RecordOnly,
    PreferHigherPriority,
    PreemptP3AndFreeze,
    HandPreemptionCandidates,
}

/// One persisted budget event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetEvent {
    pub run_id: String,
    pub tenant_id: String,
    pub total: f64,
    pub spent: f64,
    pub remaining: f64,
    pub percent_used: f64,
    pub event_type: BudgetEventType,
    pub threshold: f64,
    pub action: BudgetAction,
    pub tasks_affected: Vec<String>,
    pub priority_classes_preempted: Vec<PriorityClass>,
}

/// Per-run cost/token counters, guarded by a per-run mutex.
struct RunCounters {
    spent_usd: f64,
    tokens: u64,
    warned: bool,
    throttled: bool,
    paused: bool,
}

/// Tracks cumulative spend for one run and fires threshold events.
pub struct BudgetGuard {
    run_id: String,
    tenant_id: String,
    budget: Budget,
    counters: Mutex<RunCounters>,
}

impl BudgetGuard {
    pub fn new(run_id: String, tenant_id: String, budget: Budget) -> Self {
        Self {
            run_id,
            tenant_id,
            budget,
            counters: Mutex::new(RunCounters {
                spent_usd: 0.0,
                tokens: 0,
                warned: false,
                throttled: false,
                paused: false,
            }),
        }
    }

    /// Record spend and return the budget event fired, if any threshold was
    /// newly crossed (warn >=50%, throttle >=80%, pause >=95%).
    pub async fn record_spend(&self, cost_usd: f64, tokens: u64) -> Option<BudgetEvent> {
        let mut counters = self.counters.lock().await;
        counters.spent_usd += cost_usd;
        counters.tokens += tokens;

        let percent_used = counters.spent_usd / self.budget.max_cost_usd;

        let (event_type, action) = if percent_used >= 0.95 && !counters.paused {
            counters.paused = true;
            (BudgetEventType::Pause, BudgetAction::PreemptP3AndFreeze)
        } else if percent_used >= 0.80 && !counters.throttled {
            counters.throttled = true;
            (BudgetEventType::Throttle, BudgetAction::PreferHigherPriority)
        } else if percent_used >= 0.50 && !counters.warned {
            counters.warned = true;
            (BudgetEventType::Warn, BudgetAction::RecordOnly)
        } else {
            return None;
        };

        let event = BudgetEvent {
            run_id: self.run_id.clone(),
            tenant_id: self.tenant_id.clone(),
            total: self.budget.max_cost_usd,
            spent: counters.spent_usd,
            remaining: (self.budget.max_cost_usd - counters.spent_usd).max(0.0),
            percent_used: percent_used * 100.0,
            event_type,
            threshold: match event_type {
                BudgetEventType::Pause => 0.95,
                BudgetEventType::Throttle => 0.80,
                BudgetEventType::Warn => 0.50,
                BudgetEventType::Preempt => percent_used,
            },
            action,
            tasks_affected: Vec::new(),
            priority_classes_preempted: if matches!(event_type, BudgetEventType::Pause) {
                vec![PriorityClass::P3]
            } else {
                Vec::new()
            },
        };

        match event_type {
            BudgetEventType::Pause => warn!(run_id = %self.run_id, percent_used = event.percent_used, "budget pause threshold crossed"),
            BudgetEventType::Throttle => warn!(run_id = %self.run_id, percent_used = event.percent_used, "budget throttle threshold crossed"),
            BudgetEventType::Warn => info!(run_id = %self.run_id, percent_used = event.percent_used, "budget warn threshold crossed"),
            BudgetEventType::Preempt => {}
        }

        Some(event)
    }

    pub async fn is_paused(&self) -> bool {
        self.counters.lock().await.paused
    }

    pub async fn is_throttled(&self) -> bool {
        self.counters.lock().await.throttled
    }

    pub async fn spent_usd(&self) -> f64 {
        self.counters.lock().await.spent_usd
    }

    /// `sum(phase.cost) <= run.budget.maxCostUSD + eps` at a pass gate
    /// boundary.
    pub async fn within_budget(&self, eps: f64) -> bool {
        self.counters.lock().await.spent_usd <= self.budget.max_cost_usd + eps
    }
}
