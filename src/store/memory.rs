use super::{partition, EventStore, StoreResult};
use crate::state::StateRecord;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;

/// In-memory event store.
///
/// Partitions live in a DashMap, so appends lock only the shard holding
/// the entity and reads of other entities proceed in parallel. Used by
/// tests and by deployments that do not need history across restarts.
#[derive(Default)]
pub struct MemoryStore {
    partitions: DashMap<String, Vec<StateRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities with at least one record
    pub fn entity_count(&self) -> usize {
        self.partitions.len()
    }
}

impl EventStore for MemoryStore {
    fn append(&self, record: &StateRecord) -> StoreResult<()> {
        let mut records = self
            .partitions
            .entry(record.entity_id.clone())
            .or_default();

        // Producers normally arrive in order, making this a push
        let idx = partition::insertion_point(&records, record.last_changed);
        records.insert(idx, record.clone());

        debug!(
            entity_id = %record.entity_id,
            state = %record.state,
            position = idx,
            "Appended state record"
        );
        Ok(())
    }

    fn scan(&self, entity_id: &str) -> StoreResult<Vec<StateRecord>> {
        Ok(self
            .partitions
            .get(entity_id)
            .map(|records| records.value().clone())
            .unwrap_or_default())
    }

    fn scan_all_entities(&self) -> StoreResult<HashMap<String, Vec<StateRecord>>> {
        Ok(self
            .partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    fn record_count(&self) -> StoreResult<usize> {
        Ok(self.partitions.iter().map(|entry| entry.value().len()).sum())
    }

    fn last_n(&self, entity_id: &str, n: usize) -> StoreResult<Vec<StateRecord>> {
        Ok(self
            .partitions
            .get(entity_id)
            .map(|records| partition::last_n(&records, n).to_vec())
            .unwrap_or_default())
    }

    fn latest_at(&self, entity_id: &str, at: DateTime<Utc>) -> StoreResult<Option<StateRecord>> {
        Ok(self
            .partitions
            .get(entity_id)
            .and_then(|records| partition::latest_at(&records, at).cloned()))
    }

    fn latest_all_at(&self, at: DateTime<Utc>) -> StoreResult<Vec<StateRecord>> {
        Ok(self
            .partitions
            .iter()
            .filter_map(|entry| partition::latest_at(entry.value(), at).cloned())
            .collect())
    }

    fn changes_between(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<StateRecord>> {
        Ok(self
            .partitions
            .get(entity_id)
            .map(|records| partition::between(&records, start, end).to_vec())
            .unwrap_or_default())
    }
}
