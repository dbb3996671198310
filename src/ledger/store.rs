//! SQLite-backed storage for the Run Ledger, using plain
//! `CREATE TABLE IF NOT EXISTS` migrations and `PRAGMA foreign_keys = ON`.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::LedgerQuery;
use crate::errors::LedgerError;
use crate::model::{DeliberationScore, LedgerEntry, LedgerEntryType, Provenance};

pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                data TEXT NOT NULL,
                provenance TEXT NOT NULL,
                UNIQUE(run_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS sem_interventions (
                intervention_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                original_doer TEXT NOT NULL,
                context_snapshot TEXT NOT NULL,
                micro_plan TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                completed_at TEXT,
                status TEXT NOT NULL,
                tools_used TEXT NOT NULL,
                gate_score REAL
            );

            CREATE TABLE IF NOT EXISTS deliberation_scores (
                run_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                guard TEXT NOT NULL,
                score REAL NOT NULL,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_run ON ledger(run_id, sequence);
            CREATE INDEX IF NOT EXISTS idx_sem_run ON sem_interventions(run_id);
            CREATE INDEX IF NOT EXISTS idx_deliberation_run_phase ON deliberation_scores(run_id, phase);
            ",
        )?;
        Ok(())
    }

    /// Appends one `{runId, phase, guard, score, at}` row per guard report.
    /// Purely additive: failures here never affect gate semantics, so
    /// callers log and move on rather than propagating.
    pub fn record_deliberation_score(&self, score: &DeliberationScore) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        conn.execute(
            "INSERT INTO deliberation_scores (run_id, phase, guard, score, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                score.run_id,
                score.phase,
                score.guard,
                score.score,
                score.at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn append(
        &self,
        run_id: &str,
        entry_type: LedgerEntryType,
        data: serde_json::Value,
        provenance: Provenance,
    ) -> Result<LedgerEntry, LedgerError> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let next_sequence: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM ledger WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .unwrap_or(1);

        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            timestamp: chrono::Utc::now(),
            sequence: next_sequence,
            entry_type,
            data,
            provenance,
        };

        let rows = conn.execute(
            "INSERT INTO ledger (id, run_id, sequence, timestamp, entry_type, data, provenance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.run_id,
                entry.sequence,
                entry.timestamp.to_rfc3339(),
                serde_json::to_string(&entry.entry_type)?,
                serde_json::to_string(&entry.data)?,
                serde_json::to_string(&entry.provenance)?,
            ],
        );

        match rows {
            Ok(_) => Ok(entry),
            Err(e) => Err(LedgerError::AppendRejected(format!(
                "sequence {} for run {} already taken: {}",
                entry.sequence, run_id, e
            ))),
        }
    }

    pub fn query(&self, query: LedgerQuery) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let mut sql = String::from(
            "SELECT id, run_id, sequence, timestamp, entry_type, data, provenance FROM ledger WHERE 1=1",
        );
        if query.run_id.is_some() {
            sql.push_str(" AND run_id = ?");
        }
        if query.entry_type.is_some() {
            sql.push_str(" AND entry_type = ?");
        }
        if query.from.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if query.to.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        sql.push_str(" ORDER BY run_id, sequence");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut idx = 1;
        if let Some(run_id) = &query.run_id {
            stmt.raw_bind_parameter(idx, run_id)?;
            idx += 1;
        }
        if let Some(entry_type) = &query.entry_type {
            stmt.raw_bind_parameter(idx, serde_json::to_string(entry_type)?)?;
            idx += 1;
        }
        if let Some(from) = &query.from {
            stmt.raw_bind_parameter(idx, from.to_rfc3339())?;
            idx += 1;
        }
        if let Some(to) = &query.to {
            stmt.raw_bind_parameter(idx, to.to_rfc3339())?;
        }

        let mut rows = stmt.raw_query();
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let entry_type_json: String = row.get(4)?;
            let data_json: String = row.get(5)?;
            let provenance_json: String = row.get(6)?;
            let timestamp_str: String = row.get(3)?;
            entries.push(LedgerEntry {
                id: row.get(0)?,
                run_id: row.get(1)?,
                sequence: row.get(2)?,
                timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp_str)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|_| chrono::Utc::now()),
                entry_type: serde_json::from_str(&entry_type_json)?,
                data: serde_json::from_str(&data_json)?,
                provenance: serde_json::from_str(&provenance_json)?,
            });
        }
        Ok(entries)
    }

    #[allow(dead_code)]
    fn intervention_exists(&self, intervention_id: &str) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let found: Option<String> = conn
            .query_row(
                "SELECT intervention_id FROM sem_interventions WHERE intervention_id = ?1",
                params![intervention_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
