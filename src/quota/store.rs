//! SQLite-backed tenant quota/usage storage (`tenant_quotas`, `tenant_usage`,
//! `quota_violations`, `budget_events`, `preemption_history`), using plain
//! `CREATE TABLE IF NOT EXISTS` migrations and `PRAGMA foreign_keys = ON`.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::{QuotaViolation, Resource, ViolationAction, ViolationSeverity};
use crate::budget::{BudgetAction, BudgetEvent, BudgetEventType};
use crate::errors::QuotaError;
use crate::model::{PriorityClass, TenantQuota, TenantTier, UsageRecord};
use crate::scheduler::{PreemptionReason, PreemptionRecord};

pub struct QuotaStore {
    conn: Mutex<Connection>,
}

impl QuotaStore {
    pub fn open(path: &Path) -> Result<Self, QuotaError> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, QuotaError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS tenant_quotas (
                tenant_id TEXT PRIMARY KEY,
                max_cpu_cores REAL NOT NULL,
                max_memory_gb REAL NOT NULL,
                max_storage_gb REAL NOT NULL,
                max_tokens_per_day INTEGER NOT NULL,
                max_cost_per_day_usd REAL NOT NULL,
                max_gpus INTEGER NOT NULL,
                max_concurrent_runs INTEGER NOT NULL,
                burst_cpu_cores REAL NOT NULL,
                burst_memory_gb REAL NOT NULL,
                burst_duration_minutes INTEGER NOT NULL,
                throttle_enabled INTEGER NOT NULL,
                throttle_threshold REAL NOT NULL,
                tier TEXT NOT NULL,
                throttled_until TEXT
            );

            CREATE TABLE IF NOT EXISTS tenant_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                amount REAL NOT NULL,
                unit TEXT NOT NULL,
                at TEXT NOT NULL,
                run_id TEXT,
                task_id TEXT
            );

            CREATE TABLE IF NOT EXISTS quota_violations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                action TEXT NOT NULL,
                severity TEXT NOT NULL,
                overage_percent REAL NOT NULL,
                at TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS budget_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                total REAL NOT NULL,
                spent REAL NOT NULL,
                remaining REAL NOT NULL,
                percent_used REAL NOT NULL,
                event_type TEXT NOT NULL,
                threshold REAL NOT NULL,
                action TEXT NOT NULL,
                tasks_affected TEXT NOT NULL,
                priority_classes_preempted TEXT NOT NULL,
                at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS preemption_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                threshold REAL NOT NULL,
                priority TEXT NOT NULL,
                checkpoint_id TEXT,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_usage_tenant_resource ON tenant_usage(tenant_id, resource_type, at);
            CREATE INDEX IF NOT EXISTS idx_violations_tenant ON quota_violations(tenant_id, at);
            CREATE INDEX IF NOT EXISTS idx_budget_events_run ON budget_events(run_id, at);
            CREATE INDEX IF NOT EXISTS idx_preemption_run ON preemption_history(run_id, at);
            ",
        )?;
        Ok(())
    }

    /// Persists one `budget_events` row; `run_id` is threaded separately
    /// since `BudgetEvent` is a pure value and callers attach it to
    /// whichever run triggered the threshold crossing.
    pub fn record_budget_event(&self, run_id: &str, event: &BudgetEvent) -> Result<(), QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        let tasks_affected = serde_json::to_string(&event.tasks_affected).unwrap_or_default();
        let classes_preempted =
            serde_json::to_string(&event.priority_classes_preempted).unwrap_or_default();
        conn.execute(
            "INSERT INTO budget_events (run_id, tenant_id, total, spent, remaining, percent_used,
                event_type, threshold, action, tasks_affected, priority_classes_preempted, at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                run_id,
                event.tenant_id,
                event.total,
                event.spent,
                event.remaining,
                event.percent_used,
                budget_event_type_str(event.event_type),
                event.threshold,
                budget_action_str(event.action),
                tasks_affected,
                classes_preempted,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Persists one `preemption_history` row.
    pub fn record_preemption(&self, run_id: &str, record: &PreemptionRecord) -> Result<(), QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        conn.execute(
            "INSERT INTO preemption_history (run_id, task_id, reason, resource_type, threshold,
                priority, checkpoint_id, at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                run_id,
                record.task_id,
                preemption_reason_str(record.reason),
                record.resource_type,
                record.threshold,
                priority_class_str(record.priority),
                record.checkpoint_id,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_quota(&self, tenant_id: &str, quota: &TenantQuota) -> Result<(), QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        conn.execute(
            "INSERT INTO tenant_quotas (tenant_id, max_cpu_cores, max_memory_gb, max_storage_gb,
                max_tokens_per_day, max_cost_per_day_usd, max_gpus, max_concurrent_runs,
                burst_cpu_cores, burst_memory_gb, burst_duration_minutes, throttle_enabled,
                throttle_threshold, tier)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
             ON CONFLICT(tenant_id) DO UPDATE SET
                max_cpu_cores=excluded.max_cpu_cores, max_memory_gb=excluded.max_memory_gb,
                max_storage_gb=excluded.max_storage_gb, max_tokens_per_day=excluded.max_tokens_per_day,
                max_cost_per_day_usd=excluded.max_cost_per_day_usd, max_gpus=excluded.max_gpus,
                max_concurrent_runs=excluded.max_concurrent_runs, burst_cpu_cores=excluded.burst_cpu_cores,
                burst_memory_gb=excluded.burst_memory_gb, burst_duration_minutes=excluded.burst_duration_minutes,
                throttle_enabled=excluded.throttle_enabled, throttle_threshold=excluded.throttle_threshold,
                tier=excluded.tier",
            params![
                tenant_id,
                quota.max_cpu_cores,
                quota.max_memory_gb,
                quota.max_storage_gb,
                quota.max_tokens_per_day,
                quota.max_cost_per_day_usd,
                quota.max_gpus,
                quota.max_concurrent_runs,
                quota.burst_cpu_cores,
                quota.burst_memory_gb,
                quota.burst_duration_minutes,
                quota.throttle_enabled as i64,
                quota.throttle_threshold,
                tier_str(quota.tier),
            ],
        )?;
        Ok(())
    }

    pub fn get_quota(&self, tenant_id: &str) -> Result<Option<TenantQuota>, QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        conn.query_row(
            "SELECT max_cpu_cores, max_memory_gb, max_storage_gb, max_tokens_per_day,
                    max_cost_per_day_usd, max_gpus, max_concurrent_runs, burst_cpu_cores,
                    burst_memory_gb, burst_duration_minutes, throttle_enabled, throttle_threshold, tier
             FROM tenant_quotas WHERE tenant_id = ?1",
            params![tenant_id],
            |row| {
                let tier: String = row.get(12)?;
                Ok(TenantQuota {
                    max_cpu_cores: row.get(0)?,
                    max_memory_gb: row.get(1)?,
                    max_storage_gb: row.get(2)?,
                    max_tokens_per_day: row.get(3)?,
                    max_cost_per_day_usd: row.get(4)?,
                    max_gpus: row.get(5)?,
                    max_concurrent_runs: row.get(6)?,
                    burst_cpu_cores: row.get(7)?,
                    burst_memory_gb: row.get(8)?,
                    burst_duration_minutes: row.get(9)?,
                    throttle_enabled: row.get::<_, i64>(10)? != 0,
                    throttle_threshold: row.get(11)?,
                    tier: tier_from_str(&tier),
                })
            },
        )
        .optional()
        .map_err(QuotaError::from)
    }

    pub fn record_usage(&self, record: &UsageRecord) -> Result<(), QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        conn.execute(
            "INSERT INTO tenant_usage (tenant_id, resource_type, amount, unit, at, run_id, task_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                record.tenant_id,
                record.resource_type,
                record.amount,
                record.unit,
                record.at.to_rfc3339(),
                record.run_id,
                record.task_id,
            ],
        )?;
        Ok(())
    }

    /// Sum of usage for `resource` within its rolling window.
    pub fn usage_in_window(
        &self,
        tenant_id: &str,
        resource: Resource,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<f64, QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        let window_start = if resource.window_seconds() == i64::MAX {
            chrono::DateTime::<chrono::Utc>::MIN_UTC
        } else {
            now - chrono::Duration::seconds(resource.window_seconds())
        };
        let total: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM tenant_usage
                 WHERE tenant_id = ?1 AND resource_type = ?2 AND at >= ?3",
                params![tenant_id, resource.as_str(), window_start.to_rfc3339()],
                |row| row.get(0),
            )
            .unwrap_or(0.0);
        Ok(total)
    }

    pub fn record_violation(&self, violation: &QuotaViolation) -> Result<(), QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        conn.execute(
            "INSERT INTO quota_violations (tenant_id, resource_type, action, severity, overage_percent, at, resolved)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                violation.tenant_id,
                violation.resource.as_str(),
                action_str(violation.action),
                severity_str(violation.severity),
                violation.overage_percent,
                violation.at.to_rfc3339(),
                violation.resolved as i64,
            ],
        )?;
        Ok(())
    }

    /// Count of unresolved violations for `tenant_id` within the last hour.
    pub fn unresolved_violations_last_hour(
        &self,
        tenant_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<u32, QuotaError> {
        let conn = self.conn.lock().expect("quota connection poisoned");
        let window_start = now - chrono::Duration::hours(1);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM quota_violations
             WHERE tenant_id = ?1 AND resolved = 0 AND at >= ?2",
            params![tenant_id, window_start.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }
}

fn tier_str(tier: TenantTier) -> &'static str {
    match tier {
        TenantTier::Free => "free",
        TenantTier::Standard => "standard",
        TenantTier::Premium => "premium",
        TenantTier::Enterprise => "enterprise",
    }
}

fn tier_from_str(s: &str) -> TenantTier {
    match s {
        "standard" => TenantTier::Standard,
        "premium" => TenantTier::Premium,
        "enterprise" => TenantTier::Enterprise,
        _ => TenantTier::Free,
    }
}

fn action_str(action: ViolationAction) -> &'static str {
    match action {
        ViolationAction::Rejected => "rejected",
        ViolationAction::BurstAllowed => "burst_allowed",
        ViolationAction::Throttled => "throttled",
    }
}

fn severity_str(severity: ViolationSeverity) -> &'static str {
    match severity {
        ViolationSeverity::Low => "low",
        ViolationSeverity::Medium => "medium",
        ViolationSeverity::High => "high",
        ViolationSeverity::Critical => "critical",
    }
}

fn budget_event_type_str(event_type: BudgetEventType) -> &'static str {
    match event_type {
        BudgetEventType::Warn => "warn",
        BudgetEventType::Throttle => "throttle",
        BudgetEventType::Pause => "pause",
        BudgetEventType::Preempt => "preempt",
    }
}

fn budget_action_str(action: BudgetAction) -> &'static str {
    match action {
        BudgetAction::RecordOnly => "record_only",
        BudgetAction::PreferHigherPriority => "prefer_higher_priority",
        BudgetAction::PreemptP3AndFreeze => "preempt_p3_and_freeze",
        BudgetAction::HandPreemptionCandidates => "hand_preemption_candidates",
    }
}

fn preemption_reason_str(reason: PreemptionReason) -> &'static str {
    match reason {
        PreemptionReason::Cost => "cost",
        PreemptionReason::Cpu => "cpu",
        PreemptionReason::Memory => "memory",
        PreemptionReason::Budget => "budget",
        PreemptionReason::Quota => "quota",
    }
}

fn priority_class_str(priority: PriorityClass) -> &'static str {
    match priority {
        PriorityClass::P0 => "p0",
        PriorityClass::P1 => "p1",
        PriorityClass::P2 => "p2",
        PriorityClass::P3 => "p3",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn upsert_and_get_quota_round_trips() {
        let store = QuotaStore::open_in_memory().unwrap();
        let quota = TenantQuota::default_for_tier(TenantTier::Premium);
        store.upsert_quota("tenant-1", &quota).unwrap();
        let fetched = store.get_quota("tenant-1").unwrap().unwrap();
        assert_eq!(fetched.tier, TenantTier::Premium);
        assert_eq!(fetched.max_concurrent_runs, quota.max_concurrent_runs);
    }

    #[test]
    fn usage_in_window_excludes_old_records() {
        let store = QuotaStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .record_usage(&UsageRecord {
                tenant_id: "tenant-1".into(),
                resource_type: "cpu".into(),
                amount: 2.0,
                unit: "cores".into(),
                at: now - chrono::Duration::hours(2),
                run_id: None,
                task_id: None,
            })
            .unwrap();
        store
            .record_usage(&UsageRecord {
                tenant_id: "tenant-1".into(),
                resource_type: "cpu".into(),
                amount: 1.0,
                unit: "cores".into(),
                at: now,
                run_id: None,
                task_id: None,
            })
            .unwrap();
        let total = store.usage_in_window("tenant-1", Resource::Cpu, now).unwrap();
        assert_eq!(total, 1.0);
    }

    #[test]
    fn unresolved_violations_last_hour_counts_correctly() {
        let store = QuotaStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .record_violation(&QuotaViolation {
                tenant_id: "tenant-1".into(),
                resource: Resource::Cost,
                action: ViolationAction::Rejected,
                severity: ViolationSeverity::Low,
                overage_percent: 2.0,
                at: now,
                resolved: false,
            })
            .unwrap();
        assert_eq!(
            store.unresolved_violations_last_hour("tenant-1", now).unwrap(),
            1
        );
    }
}
