use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One observed state of an entity at a point in time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Entity identifier (e.g., "sensor.outside_temp", "switch.porch")
    pub entity_id: String,

    /// Observed value, stringified by the producer
    pub state: String,

    /// Attached metadata (units, friendly names); never used in query predicates
    pub attributes: HashMap<String, Value>,

    /// When `state` last changed
    pub last_changed: DateTime<Utc>,

    /// When this record was last written (>= last_changed)
    pub last_updated: DateTime<Utc>,
}

impl StateRecord {
    /// Build a record, normalising both timestamps to UTC microseconds.
    pub fn new<Tz: TimeZone>(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        attributes: HashMap<String, Value>,
        last_changed: DateTime<Tz>,
        last_updated: DateTime<Tz>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes,
            last_changed: normalize_timestamp(&last_changed),
            last_updated: normalize_timestamp(&last_updated),
        }
    }

    /// Record whose state changed and was written at the same instant.
    pub fn changed_at<Tz: TimeZone>(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        at: DateTime<Tz>,
    ) -> Self {
        Self::new(entity_id, state, HashMap::new(), at.clone(), at)
    }

    /// Attach an attribute (builder style)
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Domain part of the entity id ("sensor" for "sensor.outside_temp")
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.entity_id)
    }
}

/// Convert any zoned timestamp to UTC, truncated to microseconds.
///
/// Every backend stores microseconds, so records compare equal after a
/// round trip through storage.
pub fn normalize_timestamp<Tz: TimeZone>(ts: &DateTime<Tz>) -> DateTime<Utc> {
    ts.with_timezone(&Utc).trunc_subsecs(6)
}
