use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    Free,
    Standard,
    Premium,
    Enterprise,
}

/// Mutable per-tenant resource ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TenantQuota {
    pub max_cpu_cores: f64,
    pub max_memory_gb: f64,
    pub max_storage_gb: f64,
    pub max_tokens_per_day: u64,
    pub max_cost_per_day_usd: f64,
    pub max_gpus: u32,
    pub max_concurrent_runs: u32,
    pub burst_cpu_cores: f64,
    pub burst_memory_gb: f64,
    pub burst_duration_minutes: u32,
    pub throttle_enabled: bool,
    /// Strictly less than 1.
    pub throttle_threshold: f64,
    pub tier: TenantTier,
}

impl TenantQuota {
    pub fn is_well_formed(&self) -> bool {
        self.throttle_threshold < 1.0 && self.throttle_threshold > 0.0
    }

    /// Default quota for a tier, used when a tenant has none on file yet.
    pub fn default_for_tier(tier: TenantTier) -> Self {
        let (cpu, mem, tokens, cost, concurrent) = match tier {
            TenantTier::Free => (1.0, 2.0, 50_000, 5.0, 1),
            TenantTier::Standard => (4.0, 8.0, 500_000, 25.0, 3),
            TenantTier::Premium => (16.0, 32.0, 2_000_000, 100.0, 10),
            TenantTier::Enterprise => (64.0, 128.0, 10_000_000, 1_000.0, 50),
        };
        Self {
            max_cpu_cores: cpu,
            max_memory_gb: mem,
            max_storage_gb: mem * 10.0,
            max_tokens_per_day: tokens,
            max_cost_per_day_usd: cost,
            max_gpus: 0,
            max_concurrent_runs: concurrent,
            burst_cpu_cores: cpu * 0.25,
            burst_memory_gb: mem * 0.25,
            burst_duration_minutes: 10,
            throttle_enabled: true,
            throttle_threshold: 0.9,
            tier,
        }
    }
}

/// One resource-consumption event, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: String,
    pub resource_type: String,
    pub amount: f64,
    pub unit: String,
    pub at: chrono::DateTime<chrono::Utc>,
    pub run_id: Option<String>,
    pub task_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_threshold_must_be_strictly_below_one() {
        let mut quota = TenantQuota::default_for_tier(TenantTier::Standard);
        assert!(quota.is_well_formed());
        quota.throttle_threshold = 1.0;
        assert!(!quota.is_well_formed());
    }

    #[test]
    fn default_for_tier_scales_with_tier() {
        let free = TenantQuota::default_for_tier(TenantTier::Free);
        let enterprise = TenantQuota::default_for_tier(TenantTier::Enterprise);
        assert!(enterprise.max_cost_per_day_usd > free.max_cost_per_day_usd);
        assert!(enterprise.max_concurrent_runs > free.max_concurrent_runs);
    }
}
