// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! SQLite storage for counters and per-visitor hit records.
//!
//! Two tables, `counters` and `hits`, plus `retired_ids` so that an id is
//! never handed out again after its counter is deleted. Every mutation runs
//! inside one SQLite transaction while holding the connection mutex, which
//! serializes all writers in the process. That is what makes the
//! read-decide-write sequence of [`Store::record_hit_transaction`] atomic.
//!
//! The mode column keeps the legacy encoding: `cooldown_hours` is `NULL` for
//! unique counters and `0` for unlimited ones. Rows written by older
//! deployments with a positive `cooldown_hours` load as unlimited counters
//! throttled by that many hours.

use chrono::{DateTime, Utc};
use rusqlite::{
    functions::FunctionFlags, params, params_from_iter, types::Value, Connection,
    OptionalExtension, Row, TransactionBehavior,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{CountMode, Counter};
use crate::validator::ValidPatch;

const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS counters (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT    NOT NULL UNIQUE,
    label          TEXT    NOT NULL,
    value          INTEGER NOT NULL DEFAULT 0 CHECK (value >= 0),
    cooldown_hours INTEGER,
    throttle_ms    INTEGER,
    note           TEXT,
    created_at     INTEGER
);

CREATE TABLE IF NOT EXISTS hits (
    counter_id  TEXT    NOT NULL REFERENCES counters(id) ON DELETE CASCADE,
    identity    TEXT    NOT NULL,
    last_hit_at INTEGER NOT NULL,
    PRIMARY KEY (counter_id, identity)
);

CREATE INDEX IF NOT EXISTS hits_counter_time_idx ON hits (counter_id, last_hit_at);

CREATE TABLE IF NOT EXISTS retired_ids (
    id TEXT PRIMARY KEY
);
"#;

const COUNTER_COLUMNS: &str = "id, label, value, cooldown_hours, throttle_ms, note, created_at";

const MS_PER_HOUR: i64 = 3_600_000;

/// Largest value a counter can hold; hits beyond it no longer increment.
pub const MAX_COUNTER_VALUE: u64 = i64::MAX as u64;

/// Outcome of a committed hit transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedHit {
    /// Counter state after the transaction
    pub counter: Counter,
    pub incremented: bool,
}

/// Raw `counters` row before mapping to the domain type.
struct CounterRow {
    id: String,
    label: String,
    value: i64,
    cooldown_hours: Option<i64>,
    throttle_ms: Option<i64>,
    note: Option<String>,
    created_at: Option<i64>,
}

impl CounterRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            label: row.get(1)?,
            value: row.get(2)?,
            cooldown_hours: row.get(3)?,
            throttle_ms: row.get(4)?,
            note: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_counter(self) -> Result<Counter, StoreError> {
        let value = u64::try_from(self.value)
            .map_err(|_| StoreError::CorruptRow(format!("negative value for {}", self.id)))?;

        let (mode, throttle_ms) = match self.cooldown_hours {
            None => (CountMode::Unique, None),
            Some(0) => (CountMode::Unlimited, self.throttle_ms),
            Some(hours) => (
                CountMode::Unlimited,
                self.throttle_ms.or(Some(hours.saturating_mul(MS_PER_HOUR))),
            ),
        };

        let created_at = self.created_at.map(from_ms).transpose()?;

        Ok(Counter {
            id: self.id,
            label: self.label,
            value,
            mode,
            throttle_ms,
            created_at,
            note: self.note,
        })
    }
}

/// Storage column encoding of a mode.
fn cooldown_hours(mode: CountMode) -> Option<i64> {
    match mode {
        CountMode::Unique => None,
        CountMode::Unlimited => Some(0),
    }
}

fn mode_condition(mode: CountMode) -> &'static str {
    match mode {
        CountMode::Unique => "cooldown_hours IS NULL",
        CountMode::Unlimited => "cooldown_hours IS NOT NULL",
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::CorruptRow(format!("timestamp out of range: {ms}")))
}

fn to_sql_value(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::CorruptRow(format!("value out of range: {value}")))
}

fn to_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// Build the `WHERE` clause shared by listing and counting.
fn filter_clause(search: Option<&str>, mode: Option<CountMode>) -> (String, Vec<Value>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
        values.push(Value::Text(term.to_lowercase()));
        let n = values.len();
        conditions.push(format!(
            "(instr(fold(id), ?{n}) > 0 OR instr(fold(label), ?{n}) > 0)"
        ));
    }

    if let Some(mode) = mode {
        conditions.push(mode_condition(mode).to_string());
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

fn select_counter(conn: &Connection, id: &str) -> Result<Option<Counter>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {COUNTER_COLUMNS} FROM counters WHERE id = ?1"),
            params![id],
            CounterRow::from_row,
        )
        .optional()?;

    row.map(CounterRow::into_counter).transpose()
}

/// SQLite-backed counter store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open the store. `"memory"` selects a private in-memory database;
    /// anything else is a file path.
    pub fn connect(path: &str) -> Result<Self, StoreError> {
        if path == "memory" {
            Self::in_memory()
        } else {
            Self::open(Path::new(path))
        }
    }

    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let journal: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::initialize_connection(&conn)?;
        info!(path = %path.display(), journal = %journal, "Opened counter store");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        // Unicode case folding for search; SQLite's lower() only folds ASCII
        conn.create_scalar_function(
            "fold",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| Ok(ctx.get::<String>(0)?.to_lowercase()),
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert a new counter.
    ///
    /// Fails with [`StoreError::DuplicateId`] if the id belongs to a live
    /// counter or to one that was deleted; the caller retries with a fresh id.
    pub fn create_counter(&self, counter: &Counter) -> Result<Counter, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let retired: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM retired_ids WHERE id = ?1)",
            params![counter.id],
            |row| row.get(0),
        )?;
        if retired {
            return Err(StoreError::DuplicateId(counter.id.clone()));
        }

        let inserted = tx.execute(
            "INSERT INTO counters (id, label, value, cooldown_hours, throttle_ms, note, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO NOTHING",
            params![
                counter.id,
                counter.label,
                to_sql_value(counter.value)?,
                cooldown_hours(counter.mode),
                counter.throttle_ms,
                counter.note,
                counter.created_at.map(to_ms),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateId(counter.id.clone()));
        }

        tx.commit()?;
        debug!(counter_id = %counter.id, mode = %counter.mode, "Counter inserted");
        Ok(counter.clone())
    }

    /// Whether an id is held by a live or a deleted counter.
    pub fn id_taken(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let taken = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM counters WHERE id = ?1)
                 OR EXISTS (SELECT 1 FROM retired_ids WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(taken)
    }

    pub fn get_counter(&self, id: &str) -> Result<Option<Counter>, StoreError> {
        let conn = self.lock()?;
        select_counter(&conn, id)
    }

    /// Page through counters, newest first.
    ///
    /// `search` matches a case-insensitive substring of the id or label;
    /// `mode` filters exactly. Equal creation times fall back to insertion
    /// order, newest first, and rows without a creation time sort last.
    pub fn list_counters_page(
        &self,
        limit: u32,
        offset: u32,
        search: Option<&str>,
        mode: Option<CountMode>,
    ) -> Result<Vec<Counter>, StoreError> {
        let (clause, mut values) = filter_clause(search, mode);
        values.push(Value::Integer(i64::from(limit)));
        let limit_idx = values.len();
        values.push(Value::Integer(i64::from(offset)));
        let offset_idx = values.len();

        let sql = format!(
            "SELECT {COUNTER_COLUMNS} FROM counters{clause}
             ORDER BY created_at IS NULL, created_at DESC, seq DESC
             LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), CounterRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(CounterRow::into_counter).collect()
    }

    /// Count counters matching the same filters as [`Store::list_counters_page`].
    pub fn count_counters(
        &self,
        search: Option<&str>,
        mode: Option<CountMode>,
    ) -> Result<u64, StoreError> {
        let (clause, values) = filter_clause(search, mode);
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM counters{clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(to_count(n))
    }

    /// Record one hit atomically.
    ///
    /// Reads the counter and the visitor's previous hit time, asks `decide`
    /// whether this hit increments, then applies the increment and upserts
    /// the hit record in the same transaction. Without an identity no hit
    /// record is read or written. Returns `None` when the counter does not
    /// exist, in which case nothing is written.
    pub fn record_hit_transaction<F>(
        &self,
        counter_id: &str,
        identity: Option<&str>,
        now: DateTime<Utc>,
        decide: F,
    ) -> Result<Option<RecordedHit>, StoreError>
    where
        F: FnOnce(&Counter, Option<DateTime<Utc>>) -> bool,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut counter) = select_counter(&tx, counter_id)? else {
            return Ok(None);
        };

        let previous = match identity {
            Some(identity) => tx
                .query_row(
                    "SELECT last_hit_at FROM hits WHERE counter_id = ?1 AND identity = ?2",
                    params![counter_id, identity],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .map(from_ms)
                .transpose()?,
            None => None,
        };

        let mut incremented = decide(&counter, previous);
        if incremented {
            let changed = tx.execute(
                "UPDATE counters SET value = value + 1 WHERE id = ?1 AND value < ?2",
                params![counter_id, to_sql_value(MAX_COUNTER_VALUE)?],
            )?;
            if changed == 0 {
                warn!(counter_id, "Counter at maximum value, hit not counted");
                incremented = false;
            } else {
                counter.value += 1;
            }
        }

        if let Some(identity) = identity {
            tx.execute(
                "INSERT INTO hits (counter_id, identity, last_hit_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (counter_id, identity) DO UPDATE SET last_hit_at = excluded.last_hit_at",
                params![counter_id, identity, to_ms(now)],
            )?;
        }

        tx.commit()?;
        Ok(Some(RecordedHit {
            counter,
            incremented,
        }))
    }

    /// Overwrite a counter's value. Returns `false` if the counter is missing.
    pub fn update_counter_value(&self, id: &str, value: u64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE counters SET value = ?2 WHERE id = ?1",
            params![id, to_sql_value(value)?],
        )?;
        Ok(changed > 0)
    }

    /// Apply an admin patch. Returns the updated counter, or `None` if missing.
    pub fn update_counter_metadata(
        &self,
        id: &str,
        patch: &ValidPatch,
    ) -> Result<Option<Counter>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if select_counter(&tx, id)?.is_none() {
            return Ok(None);
        }

        if let Some(label) = &patch.label {
            tx.execute(
                "UPDATE counters SET label = ?2 WHERE id = ?1",
                params![id, label],
            )?;
        }
        if let Some(value) = patch.value {
            tx.execute(
                "UPDATE counters SET value = ?2 WHERE id = ?1",
                params![id, to_sql_value(value)?],
            )?;
        }
        if let Some(note) = &patch.note {
            tx.execute(
                "UPDATE counters SET note = ?2 WHERE id = ?1",
                params![id, note],
            )?;
        }

        let updated = select_counter(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Delete one counter and its hit records. Returns `false` if missing.
    pub fn delete_counter(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("DELETE FROM hits WHERE counter_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM counters WHERE id = ?1", params![id])?;
        if deleted > 0 {
            tx.execute(
                "INSERT OR IGNORE INTO retired_ids (id) VALUES (?1)",
                params![id],
            )?;
        }

        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Delete every counter and hit record. Returns the number of counters removed.
    pub fn delete_all_counters(&self) -> Result<u64, StoreError> {
        self.delete_where("1 = 1")
    }

    /// Delete every counter of one mode, with their hit records.
    pub fn delete_counters_by_mode(&self, mode: CountMode) -> Result<u64, StoreError> {
        self.delete_where(mode_condition(mode))
    }

    fn delete_where(&self, condition: &str) -> Result<u64, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            &format!("INSERT OR IGNORE INTO retired_ids (id) SELECT id FROM counters WHERE {condition}"),
            [],
        )?;
        tx.execute(
            &format!(
                "DELETE FROM hits WHERE counter_id IN (SELECT id FROM counters WHERE {condition})"
            ),
            [],
        )?;
        let deleted = tx.execute(&format!("DELETE FROM counters WHERE {condition}"), [])?;

        tx.commit()?;
        Ok(deleted as u64)
    }

    /// Most recent hit time across all identities of a counter.
    pub fn get_last_hit_timestamp(
        &self,
        counter_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let ms: Option<i64> = conn.query_row(
            "SELECT MAX(last_hit_at) FROM hits WHERE counter_id = ?1",
            params![counter_id],
            |row| row.get(0),
        )?;
        ms.map(from_ms).transpose()
    }

    /// Number of identities whose last hit is at or after `since`.
    pub fn count_hits_since(
        &self,
        counter_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM hits WHERE counter_id = ?1 AND last_hit_at >= ?2",
            params![counter_id, to_ms(since)],
            |row| row.get(0),
        )?;
        Ok(to_count(n))
    }

    /// Last-hit times at or after `since`, oldest first.
    pub fn hit_timestamps_since(
        &self,
        counter_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT last_hit_at FROM hits
             WHERE counter_id = ?1 AND last_hit_at >= ?2
             ORDER BY last_hit_at",
        )?;
        let rows = stmt
            .query_map(params![counter_id, to_ms(since)], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(from_ms).collect()
    }

    /// Number of hit records held for a counter.
    pub fn count_hit_records(&self, counter_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM hits WHERE counter_id = ?1",
            params![counter_id],
            |row| row.get(0),
        )?;
        Ok(to_count(n))
    }

    /// Bulk purge of hit records last seen before `before`.
    pub fn purge_hits_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let purged = conn.execute(
            "DELETE FROM hits WHERE last_hit_at < ?1",
            params![to_ms(before)],
        )?;
        Ok(purged as u64)
    }
}
