use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::state::StateRecord;

mod validation;

pub use validation::{validate_and_convert, IngestionError};

/// StateChangeEvent is the only message the recorder accepts from event sources.
///
/// Producers (device scanners, sensor drivers, protocol gateways) emit one
/// event per observed transition. Timestamps may carry any UTC offset; they
/// are normalised when the event becomes a [`StateRecord`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    /// Entity identifier in `domain.object_id` form
    pub entity_id: String,

    /// New state value
    pub state: String,

    /// Scalar metadata attached to the state
    #[serde(default)]
    pub attributes: HashMap<String, Value>,

    /// When the state value changed
    pub changed_at: DateTime<FixedOffset>,

    /// When the state was written (>= changed_at)
    pub updated_at: DateTime<FixedOffset>,
}

impl StateChangeEvent {
    /// Event whose state changed and was written at the same instant.
    pub fn new(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        at: impl Into<DateTime<FixedOffset>>,
    ) -> Self {
        let at = at.into();
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: HashMap::new(),
            changed_at: at,
            updated_at: at,
        }
    }

    /// Attach an attribute (builder style)
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Decode an event from a raw JSON payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, IngestionError> {
        serde_json::from_slice(payload).map_err(|e| IngestionError::Malformed(e.to_string()))
    }

    /// Validates the event and converts it into a storable record.
    pub fn into_record(self) -> Result<StateRecord, IngestionError> {
        validation::validate_and_convert(self)
    }
}
