//! Quota Enforcer: per-tenant resource accounting and admission control.

mod enforcer;
mod health;
mod store;

pub use enforcer::QuotaEnforcer;
pub use health::calculate_tenant_health;
pub use store::QuotaStore;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Cpu,
    Memory,
    Storage,
    Tokens,
    Cost,
    Gpu,
    ConcurrentRuns,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Memory => "memory",
            Resource::Storage => "storage",
            Resource::Tokens => "tokens",
            Resource::Cost => "cost",
            Resource::Gpu => "gpu",
            Resource::ConcurrentRuns => "concurrent_runs",
        }
    }

    /// Rolling usage window for this resource.
    pub fn window_seconds(&self) -> i64 {
        match self {
            Resource::Cpu | Resource::Memory | Resource::Gpu => 3_600,
            Resource::Tokens | Resource::Cost => 86_400,
            Resource::Storage => i64::MAX,
            Resource::ConcurrentRuns => 300,
        }
    }

    /// Only cpu and memory support burst allowance.
    pub fn supports_burst(&self) -> bool {
        matches!(self, Resource::Cpu | Resource::Memory)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ViolationSeverity {
    /// `<10% low, <25% medium, <50% high, >=50% critical`.
    pub fn from_overage_percent(overage_percent: f64) -> Self {
        if overage_percent >= 50.0 {
            ViolationSeverity::Critical
        } else if overage_percent >= 25.0 {
            ViolationSeverity::High
        } else if overage_percent >= 10.0 {
            ViolationSeverity::Medium
        } else {
            ViolationSeverity::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    pub current_usage: f64,
    pub quota: f64,
    pub percent_used: f64,
    pub burst_allowed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaViolation {
    pub tenant_id: String,
    pub resource: Resource,
    pub action: ViolationAction,
    pub severity: ViolationSeverity,
    pub overage_percent: f64,
    pub at: chrono::DateTime<chrono::Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Rejected,
    BurstAllowed,
    Throttled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cpu_and_memory_support_burst() {
        assert!(Resource::Cpu.supports_burst());
        assert!(Resource::Memory.supports_burst());
        assert!(!Resource::Tokens.supports_burst());
        assert!(!Resource::Gpu.supports_burst());
    }

    #[test]
    fn severity_buckets_match_overage_thresholds() {
        assert_eq!(ViolationSeverity::from_overage_percent(5.0), ViolationSeverity::Low);
        assert_eq!(ViolationSeverity::from_overage_percent(15.0), ViolationSeverity::Medium);
        assert_eq!(ViolationSeverity::from_overage_percent(30.0), ViolationSeverity::High);
        assert_eq!(ViolationSeverity::from_overage_percent(60.0), ViolationSeverity::Critical);
    }
}
