//! Durable, append-only log of state records.
//!
//! Records are partitioned by `entity_id`; each partition is ordered by
//! `last_changed` ascending, ties kept in insertion order.
//!
//! # Backends
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  EventStore (trait)          │
//! │  - append / scan             │
//! │  - indexed history lookups   │
//! └──────────────────────────────┘
//!        ↓                  ↓
//! ┌──────────────┐  ┌──────────────────────────────┐
//! │ MemoryStore  │  │ SqliteStore                  │
//! │ DashMap      │  │ index (entity_id,            │
//! │ partitions   │  │        last_changed)         │
//! └──────────────┘  └──────────────────────────────┘
//! ```

use crate::config::{StoreBackend, StoreConfig};
use crate::state::StateRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

mod memory;
pub mod partition;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;


/// Storage failures, split by path so callers can tell writes from reads
#[derive(Debug, Error)]
pub enum StoreError {
    /// Appending a record failed (retried by the recorder)
    #[error("failed to append record for '{entity_id}': {source}")]
    Write {
        entity_id: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A history read failed
    #[error("failed to read state history: {0}")]
    Read(#[source] rusqlite::Error),

    /// A persisted row could not be decoded back into a StateRecord
    #[error("corrupt state row for '{entity_id}': {reason}")]
    Corrupt { entity_id: String, reason: String },

    /// Backend cannot serve requests at all (open failure, poisoned lock)
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Append-only persistence of state records.
///
/// Backends must serialise mutation per entity and allow reads to run
/// concurrently with an in-flight append. The provided history lookups
/// derive from `scan`; backends with an index override them.
pub trait EventStore: Send + Sync {
    /// Add one record to its entity's partition.
    fn append(&self, record: &StateRecord) -> StoreResult<()>;

    /// Full partition for one entity, ascending. Unknown entity → empty.
    fn scan(&self, entity_id: &str) -> StoreResult<Vec<StateRecord>>;

    /// Every partition, keyed by entity id.
    fn scan_all_entities(&self) -> StoreResult<HashMap<String, Vec<StateRecord>>>;

    /// Total number of stored records
    fn record_count(&self) -> StoreResult<usize>;

    /// Up to the last `n` records of an entity, ascending.
    fn last_n(&self, entity_id: &str, n: usize) -> StoreResult<Vec<StateRecord>> {
        let records = self.scan(entity_id)?;
        Ok(partition::last_n(&records, n).to_vec())
    }

    /// Rightmost record with `last_changed <= at`.
    fn latest_at(&self, entity_id: &str, at: DateTime<Utc>) -> StoreResult<Option<StateRecord>> {
        let records = self.scan(entity_id)?;
        Ok(partition::latest_at(&records, at).cloned())
    }

    /// `latest_at` for every entity that has a qualifying record.
    fn latest_all_at(&self, at: DateTime<Utc>) -> StoreResult<Vec<StateRecord>> {
        let partitions = self.scan_all_entities()?;
        Ok(partitions
            .values()
            .filter_map(|records| partition::latest_at(records, at).cloned())
            .collect())
    }

    /// Records with `start <= last_changed < end`, ascending.
    fn changes_between(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<StateRecord>> {
        let records = self.scan(entity_id)?;
        Ok(partition::between(&records, start, end).to_vec())
    }

    /// `changes_between` for every entity; entities without changes are omitted.
    fn changes_all_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<HashMap<String, Vec<StateRecord>>> {
        let partitions = self.scan_all_entities()?;
        Ok(partitions
            .into_iter()
            .filter_map(|(entity_id, records)| {
                let window = partition::between(&records, start, end);
                (!window.is_empty()).then(|| (entity_id, window.to_vec()))
            })
            .collect())
    }
}

/// Open the backend selected by configuration.
pub fn open(config: &StoreConfig) -> StoreResult<Arc<dyn EventStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path)?)),
    }
}
