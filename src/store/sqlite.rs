//! State history persistence using SQLite.
//!
//! One row per state change, indexed by `(entity_id, last_changed)` so the
//! history lookups are logarithmic per entity.

use super::{EventStore, StoreError, StoreResult};
use crate::state::StateRecord;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Params, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const RECORD_COLUMNS: &str = "entity_id, state, attributes, last_changed, last_updated";

/// Event store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE states (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,  -- insertion order, breaks ties
///     entity_id TEXT NOT NULL,
///     state TEXT NOT NULL,
///     attributes TEXT NOT NULL,              -- JSON object
///     last_changed INTEGER NOT NULL,         -- UTC microseconds
///     last_updated INTEGER NOT NULL          -- UTC microseconds
/// );
/// CREATE INDEX idx_states_entity_changed ON states(entity_id, last_changed);
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex, which serialises appends globally
/// - Reads take the same lock only for the duration of one statement
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database and ensures the schema exists.
    pub fn open<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path).map_err(|e| {
            StoreError::Unavailable(format!(
                "failed to open state database at {}: {}",
                db_path.display(),
                e
            ))
        })?;
        let store = Self::with_connection(conn)?;

        info!(path = %db_path.display(), "Opened state history database");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("failed to open in-memory database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS states (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id    TEXT NOT NULL,
                state        TEXT NOT NULL,
                attributes   TEXT NOT NULL,
                last_changed INTEGER NOT NULL,
                last_updated INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_states_entity_changed
                ON states(entity_id, last_changed);",
        )
        .map_err(|e| StoreError::Unavailable(format!("failed to create states table: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(super) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("state database lock poisoned".to_string()))
    }

    /// Runs a SELECT over RECORD_COLUMNS and decodes every row.
    fn query_records<P: Params>(&self, sql: &str, params: P) -> StoreResult<Vec<StateRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(StoreError::Read)?;
        let rows = stmt
            .query_map(params, RawRow::from_row)
            .map_err(StoreError::Read)?
            .collect::<Result<Vec<RawRow>, _>>()
            .map_err(StoreError::Read)?;

        rows.into_iter().map(RawRow::into_record).collect()
    }
}

impl EventStore for SqliteStore {
    fn append(&self, record: &StateRecord) -> StoreResult<()> {
        let attributes = serde_json::to_string(&record.attributes).map_err(|e| {
            StoreError::Corrupt {
                entity_id: record.entity_id.clone(),
                reason: format!("attributes not serializable: {}", e),
            }
        })?;

        self.lock()?
            .execute(
                "INSERT INTO states (entity_id, state, attributes, last_changed, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.entity_id,
                    record.state,
                    attributes,
                    record.last_changed.timestamp_micros(),
                    record.last_updated.timestamp_micros(),
                ],
            )
            .map_err(|source| StoreError::Write {
                entity_id: record.entity_id.clone(),
                source,
            })?;

        debug!(entity_id = %record.entity_id, state = %record.state, "Appended state record");
        Ok(())
    }

    fn scan(&self, entity_id: &str) -> StoreResult<Vec<StateRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM states
                 WHERE entity_id = ?1
                 ORDER BY last_changed ASC, id ASC"
            ),
            params![entity_id],
        )
    }

    fn scan_all_entities(&self) -> StoreResult<HashMap<String, Vec<StateRecord>>> {
        let records = self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM states
                 ORDER BY entity_id ASC, last_changed ASC, id ASC"
            ),
            [],
        )?;
        Ok(group_by_entity(records))
    }

    fn record_count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM states", [], |row| row.get(0))
            .map_err(StoreError::Read)?;
        Ok(count as usize)
    }

    fn last_n(&self, entity_id: &str, n: usize) -> StoreResult<Vec<StateRecord>> {
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let mut records = self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM states
                 WHERE entity_id = ?1
                 ORDER BY last_changed DESC, id DESC
                 LIMIT ?2"
            ),
            params![entity_id, limit],
        )?;
        records.reverse();
        Ok(records)
    }

    fn latest_at(&self, entity_id: &str, at: DateTime<Utc>) -> StoreResult<Option<StateRecord>> {
        let records = self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM states
                 WHERE entity_id = ?1 AND last_changed <= ?2
                 ORDER BY last_changed DESC, id DESC
                 LIMIT 1"
            ),
            params![entity_id, at.timestamp_micros()],
        )?;
        Ok(records.into_iter().next())
    }

    fn latest_all_at(&self, at: DateTime<Utc>) -> StoreResult<Vec<StateRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM states AS s
                 WHERE s.id = (
                     SELECT i.id FROM states AS i
                     WHERE i.entity_id = s.entity_id AND i.last_changed <= ?1
                     ORDER BY i.last_changed DESC, i.id DESC
                     LIMIT 1
                 )
                 ORDER BY s.entity_id ASC"
            ),
            params![at.timestamp_micros()],
        )
    }

    fn changes_between(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<StateRecord>> {
        if start >= end {
            return Ok(Vec::new());
        }
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM states
                 WHERE entity_id = ?1 AND last_changed >= ?2 AND last_changed < ?3
                 ORDER BY last_changed ASC, id ASC"
            ),
            params![entity_id, start.timestamp_micros(), end.timestamp_micros()],
        )
    }

    fn changes_all_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<HashMap<String, Vec<StateRecord>>> {
        if start >= end {
            return Ok(HashMap::new());
        }
        let records = self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM states
                 WHERE last_changed >= ?1 AND last_changed < ?2
                 ORDER BY entity_id ASC, last_changed ASC, id ASC"
            ),
            params![start.timestamp_micros(), end.timestamp_micros()],
        )?;
        Ok(group_by_entity(records))
    }
}

/// Undecoded row, read inside rusqlite's row callback
struct RawRow {
    entity_id: String,
    state: String,
    attributes: String,
    last_changed: i64,
    last_updated: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            state: row.get(1)?,
            attributes: row.get(2)?,
            last_changed: row.get(3)?,
            last_updated: row.get(4)?,
        })
    }

    fn into_record(self) -> StoreResult<StateRecord> {
        let attributes: HashMap<String, Value> =
            serde_json::from_str(&self.attributes).map_err(|e| StoreError::Corrupt {
                entity_id: self.entity_id.clone(),
                reason: format!("invalid attributes JSON: {}", e),
            })?;
        let last_changed = decode_micros(&self.entity_id, "last_changed", self.last_changed)?;
        let last_updated = decode_micros(&self.entity_id, "last_updated", self.last_updated)?;

        Ok(StateRecord {
            entity_id: self.entity_id,
            state: self.state,
            attributes,
            last_changed,
            last_updated,
        })
    }
}

fn decode_micros(entity_id: &str, column: &str, micros: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
        entity_id: entity_id.to_string(),
        reason: format!("{} out of range: {}", column, micros),
    })
}

/// Groups records (already sorted per entity) into partitions.
fn group_by_entity(records: Vec<StateRecord>) -> HashMap<String, Vec<StateRecord>> {
    let mut partitions: HashMap<String, Vec<StateRecord>> = HashMap::new();
    for record in records {
        partitions
            .entry(record.entity_id.clone())
            .or_default()
            .push(record);
    }
    partitions
}
