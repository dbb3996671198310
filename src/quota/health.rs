//! Tenant health score.

use super::{QuotaStore, Resource};
use crate::errors::QuotaError;
use crate::model::TenantQuota;

/// `calculate_tenant_health(tenantId) -> integer[0..100]`, monotonically
/// decreased by high utilizations and unresolved recent violations.
pub fn calculate_tenant_health(
    store: &QuotaStore,
    tenant_id: &str,
    quota: &TenantQuota,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<u32, QuotaError> {
    let mut score: i32 = 100;

    let cpu_pct = percent_used(store, tenant_id, Resource::Cpu, quota.max_cpu_cores, now)?;
    let mem_pct = percent_used(store, tenant_id, Resource::Memory, quota.max_memory_gb, now)?;
    let cost_pct = percent_used(store, tenant_id, Resource::Cost, quota.max_cost_per_day_usd, now)?;

    for pct in [cpu_pct, mem_pct] {
        if pct > 90.0 {
            score -= 20;
        } else if pct > 75.0 {
            score -= 10;
        }
    }

    if cost_pct > 95.0 {
        score -= 30;
    } else if cost_pct > 80.0 {
        score -= 15;
    }

    let unresolved = store.unresolved_violations_last_hour(tenant_id, now)?;
    score -= 5 * unresolved as i32;

    Ok(score.clamp(0, 100) as u32)
}

fn percent_used(
    store: &QuotaStore,
    tenant_id: &str,
    resource: Resource,
    quota_amount: f64,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<f64, QuotaError> {
    if quota_amount <= 0.0 {
        return Ok(0.0);
    }
    let usage = store.usage_in_window(tenant_id, resource, now)?;
    Ok((usage / quota_amount) * 100.0)
}
