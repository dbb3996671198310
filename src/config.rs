//! Layered engine configuration: defaults → TOML file → environment
//! variables, generalized to config-file-then-env for a library rather
//! than a CLI.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default budgets, quota defaults, gatekeeper thresholds, scheduler
/// parallelism, and SEM allow-list defaults for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub default_max_cost_usd: f64,
    pub default_max_tokens: u64,
    pub default_max_retries: u32,
    pub gate_pass_threshold: f64,
    pub gate_margin_error: f64,
    pub scheduler_max_parallel: usize,
    pub budget_warn_percent: f64,
    pub budget_throttle_percent: f64,
    pub budget_pause_percent: f64,
    pub quota_throttle_penalty_ms: u64,
    pub sem_allow_list: Vec<String>,
    pub partial_success_min_fraction: f64,
    pub ledger_db_path: String,
    pub quota_db_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_cost_usd: 10.0,
            default_max_tokens: 1_000_000,
            default_max_retries: 3,
            gate_pass_threshold: 70.0,
            gate_margin_error: 5.0,
            scheduler_max_parallel: 8,
            budget_warn_percent: 0.50,
            budget_throttle_percent: 0.80,
            budget_pause_percent: 0.95,
            quota_throttle_penalty_ms: 5_000,
            sem_allow_list: Vec::new(),
            partial_success_min_fraction: 0.75,
            ledger_db_path: "orchestrator-ledger.sqlite".to_string(),
            quota_db_path: "orchestrator-quota.sqlite".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file, then apply `ORCHESTRATOR_*` environment
    /// overrides. Unknown TOML keys are rejected; missing optional keys
    /// fall back to the documented defaults above.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ORCHESTRATOR_MAX_COST_USD") {
            if let Ok(parsed) = v.parse() {
                self.default_max_cost_usd = parsed;
            }
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_GATE_PASS_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                self.gate_pass_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_SCHEDULER_MAX_PARALLEL") {
            if let Ok(parsed) = v.parse() {
                self.scheduler_max_parallel = parsed;
            }
        }
    }
}
