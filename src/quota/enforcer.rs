//! Quota Enforcer operations: `checkQuota`, `recordUsage`, `enforceQuota`.

use dashmap::DashMap;

use super::{QuotaCheckResult, QuotaStore, QuotaViolation, Resource, ViolationAction, ViolationSeverity};
use crate::errors::{PolicyError, QuotaError};
use crate::model::{TenantQuota, UsageRecord};

/// Per-(tenant, resource) throttle marker; `dashmap` gives cheap concurrent
/// reads/writes without a single global lock.
pub struct QuotaEnforcer {
    store: QuotaStore,
    throttled_until: DashMap<String, chrono::DateTime<chrono::Utc>>,
    penalty_ms: u64,
}

impl QuotaEnforcer {
    pub fn new(store: QuotaStore, penalty_ms: u64) -> Self {
        Self {
            store,
            throttled_until: DashMap::new(),
            penalty_ms,
        }
    }

    fn quota_or_default(&self, tenant_id: &str) -> Result<TenantQuota, QuotaError> {
        self.store
            .get_quota(tenant_id)?
            .ok_or_else(|| QuotaError::UnknownTenant(tenant_id.to_string()))
    }

    /// `checkQuota(tenant, resource, amount) -> {allowed, currentUsage,
    /// quota, percentUsed, burstAllowed?}`.
    pub fn check_quota(
        &self,
        tenant_id: &str,
        resource: Resource,
        amount: f64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<QuotaCheckResult, QuotaError> {
        let quota = self.quota_or_default(tenant_id)?;
        let current_usage = self.store.usage_in_window(tenant_id, resource, now)?;
        let ceiling = resource_ceiling(&quota, resource);
        let projected = current_usage + amount;

        if projected <= ceiling {
            let percent_used = if ceiling > 0.0 { (projected / ceiling) * 100.0 } else { 100.0 };
            return Ok(QuotaCheckResult {
                allowed: true,
                current_usage,
                quota: ceiling,
                percent_used,
                burst_allowed: None,
            });
        }

        if resource.supports_burst() {
            let burst_allowance = burst_allowance(&quota, resource);
            if projected <= ceiling + burst_allowance {
                return Ok(QuotaCheckResult {
                    allowed: true,
                    current_usage,
                    quota: ceiling,
                    percent_used: (projected / ceiling) * 100.0,
                    burst_allowed: Some(true),
                });
            }
        }

        Ok(QuotaCheckResult {
            allowed: false,
            current_usage,
            quota: ceiling,
            percent_used: if ceiling > 0.0 { (projected / ceiling) * 100.0 } else { 100.0 },
            burst_allowed: Some(false),
        })
    }

    pub fn record_usage(
        &self,
        tenant_id: &str,
        resource: Resource,
        amount: f64,
        run_id: Option<String>,
        task_id: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), QuotaError> {
        self.store.record_usage(&UsageRecord {
            tenant_id: tenant_id.to_string(),
            resource_type: resource.as_str().to_string(),
            amount,
            unit: "unit".to_string(),
            at: now,
            run_id,
            task_id,
        })
    }

    /// Atomic check-then-record; also sets a throttle marker when
    /// `percentUsed >= throttleThreshold * 100`.
    pub fn enforce_quota(
        &self,
        tenant_id: &str,
        resource: Resource,
        amount: f64,
        run_id: Option<String>,
        task_id: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<QuotaCheckResult, QuotaError> {
        if self.is_throttled(tenant_id, now) {
            return Err(QuotaError::Policy(PolicyError::Throttled(tenant_id.to_string())));
        }

        let quota = self.quota_or_default(tenant_id)?;
        let result = self.check_quota(tenant_id, resource, amount, now)?;

        if !result.allowed {
            let overage_percent = if result.quota > 0.0 {
                ((result.current_usage + amount - result.quota) / result.quota) * 100.0
            } else {
                100.0
            };
            self.store.record_violation(&QuotaViolation {
                tenant_id: tenant_id.to_string(),
                resource,
                action: ViolationAction::Rejected,
                severity: ViolationSeverity::from_overage_percent(overage_percent),
                overage_percent,
                at: now,
                resolved: false,
            })?;
            return Err(QuotaError::Policy(PolicyError::QuotaExceeded {
                tenant_id: tenant_id.to_string(),
                resource: resource.as_str().to_string(),
                current_usage: result.current_usage,
                requested: amount,
                quota: result.quota,
                burst: burst_allowance(&quota, resource),
            }));
        }

        if result.burst_allowed == Some(true) {
            self.store.record_violation(&QuotaViolation {
                tenant_id: tenant_id.to_string(),
                resource,
                action: ViolationAction::BurstAllowed,
                severity: ViolationSeverity::Low,
                overage_percent: 0.0,
                at: now,
                resolved: true,
            })?;
        }

        self.record_usage(tenant_id, resource, amount, run_id, task_id, now)?;

        if quota.throttle_enabled && result.percent_used >= quota.throttle_threshold * 100.0 {
            self.throttle_tenant(tenant_id, now);
        }

        Ok(result)
    }

    fn throttle_tenant(&self, tenant_id: &str, now: chrono::DateTime<chrono::Utc>) {
        self.throttled_until
            .insert(tenant_id.to_string(), now + chrono::Duration::minutes(5));
    }

    pub fn is_throttled(&self, tenant_id: &str, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.throttled_until
            .get(tenant_id)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    pub fn penalty_ms(&self) -> u64 {
        self.penalty_ms
    }

    pub fn store(&self) -> &QuotaStore {
        &self.store
    }
}

fn resource_ceiling(quota: &TenantQuota, resource: Resource) -> f64 {
    match resource {
        Resource::Cpu => quota.max_cpu_cores,
        Resource::Memory => quota.max_memory_gb,
        Resource::Storage => quota.max_storage_gb,
        Resource::Tokens => quota.max_tokens_per_day as f64,
        Resource::Cost => quota.max_cost_per_day_usd,
        Resource::Gpu => quota.max_gpus as f64,
        Resource::ConcurrentRuns => quota.max_concurrent_runs as f64,
    }
}

fn burst_allowance(quota: &TenantQuota, resource: Resource) -> f64 {
    match resource {
        Resource::Cpu => quota.burst_cpu_cores,
        Resource::Memory => quota.burst_memory_gb,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TenantTier;
    use chrono::Utc;

    fn enforcer_with_tenant(tier: TenantTier) -> QuotaEnforcer {
        let store = QuotaStore::open_in_memory().unwrap();
        store.upsert_quota("tenant-1", &TenantQuota::default_for_tier(tier)).unwrap();
        QuotaEnforcer::new(store, 5_000)
    }

    #[test]
    fn check_quota_allows_within_ceiling() {
        let enforcer = enforcer_with_tenant(TenantTier::Standard);
        let now = Utc::now();
        let result = enforcer.check_quota("tenant-1", Resource::Cpu, 1.0, now).unwrap();
        assert!(result.allowed);
    }

    #[test]
    fn enforce_quota_rejects_over_ceiling_plus_burst() {
        let enforcer = enforcer_with_tenant(TenantTier::Free);
        let now = Utc::now();
        // Free tier: max_cpu_cores=1.0, burst=0.25
        let result = enforcer.enforce_quota("tenant-1", Resource::Cpu, 10.0, None, None, now);
        assert!(result.is_err());
    }

    #[test]
    fn enforce_quota_records_usage_on_success() {
        let enforcer = enforcer_with_tenant(TenantTier::Standard);
        let now = Utc::now();
        enforcer
            .enforce_quota("tenant-1", Resource::Cpu, 1.0, None, None, now)
            .unwrap();
        let usage = enforcer
            .store()
            .usage_in_window("tenant-1", Resource::Cpu, now)
            .unwrap();
        assert_eq!(usage, 1.0);
    }

    #[test]
    fn quota_exceeded_without_burst_support_rejects_immediately() {
        let enforcer = enforcer_with_tenant(TenantTier::Free);
        let now = Utc::now();
        // tokens has no burst support
        let result = enforcer.enforce_quota("tenant-1", Resource::Tokens, 1_000_000.0, None, None, now);
        assert!(result.is_err());
    }

    #[test]
    fn throttled_tenant_is_rejected_until_window_elapses() {
        let enforcer = enforcer_with_tenant(TenantTier::Standard);
        let now = Utc::now();
        enforcer.throttle_tenant("tenant-1", now);
        assert!(enforcer.is_throttled("tenant-1", now));
        assert!(!enforcer.is_throttled("tenant-1", now + chrono::Duration::minutes(6)));
    }
}
