//! Read-only history queries over an EventStore.
//!
//! Every query reflects exactly the records present in the store when it
//! runs. Callers that just submitted events to a
//! [`Recorder`](crate::recorder::Recorder) should await its
//! `block_till_done` first.

use crate::state::StateRecord;
use crate::store::{EventStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
mod tests;

/// Read-path failures; never downgraded to partial results
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history query failed: {0}")]
    Store(#[from] StoreError),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Historical queries against the recorded state log
#[derive(Clone)]
pub struct HistoryQuery {
    store: Arc<dyn EventStore>,
}

impl HistoryQuery {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Most recent `n` states of an entity, newest first.
    ///
    /// Fewer than `n` are returned when the entity has less history; an
    /// unknown entity yields an empty list.
    pub fn last_n_states(&self, entity_id: &str, n: usize) -> HistoryResult<Vec<StateRecord>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut records = self.store.last_n(entity_id, n)?;
        records.reverse();

        debug!(entity_id = %entity_id, requested = n, returned = records.len(), "last_n_states");
        Ok(records)
    }

    /// The five most recent states of an entity, newest first.
    pub fn last_5_states(&self, entity_id: &str) -> HistoryResult<Vec<StateRecord>> {
        self.last_n_states(entity_id, 5)
    }

    /// State of every entity as of `point_in_time`.
    ///
    /// Entities whose first record is later than `point_in_time` are
    /// omitted. Results are sorted by entity id.
    pub fn get_states(&self, point_in_time: DateTime<Utc>) -> HistoryResult<Vec<StateRecord>> {
        let mut states = self.store.latest_all_at(point_in_time)?;
        states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        debug!(point_in_time = %point_in_time, entities = states.len(), "get_states");
        Ok(states)
    }

    /// `get_states` restricted to the listed entities, in the listed order.
    pub fn get_states_for(
        &self,
        point_in_time: DateTime<Utc>,
        entity_ids: &[&str],
    ) -> HistoryResult<Vec<StateRecord>> {
        let mut states = Vec::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            if let Some(record) = self.store.latest_at(entity_id, point_in_time)? {
                states.push(record);
            }
        }
        Ok(states)
    }

    /// State of one entity as of `point_in_time`; `None` if it had no
    /// record at or before that instant.
    pub fn get_state(
        &self,
        point_in_time: DateTime<Utc>,
        entity_id: &str,
    ) -> HistoryResult<Option<StateRecord>> {
        Ok(self.store.latest_at(entity_id, point_in_time)?)
    }

    /// Changes of one entity with `start <= last_changed < end`, ascending.
    ///
    /// Adjacent windows partition the timeline: a record stamped exactly at
    /// a shared boundary belongs to the later window only.
    pub fn state_changes_during_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        entity_id: &str,
    ) -> HistoryResult<Vec<StateRecord>> {
        let changes = self.store.changes_between(entity_id, start, end)?;

        debug!(
            entity_id = %entity_id,
            start = %start,
            end = %end,
            changes = changes.len(),
            "state_changes_during_period"
        );
        Ok(changes)
    }

    /// Period query over every entity, grouped by entity id.
    ///
    /// Entities without changes in the window are omitted.
    pub fn changes_during_period_all(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HistoryResult<BTreeMap<String, Vec<StateRecord>>> {
        let changes = self.store.changes_all_between(start, end)?;
        Ok(changes.into_iter().collect())
    }
}
