use super::StateChangeEvent;
use crate::state::StateRecord;
use serde_json::Value;
use thiserror::Error;

/// Reasons an incoming event cannot become a StateRecord
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestionError {
    #[error("malformed event payload: {0}")]
    Malformed(String),
    #[error("entity_id is required")]
    MissingEntityId,
    #[error("invalid entity_id '{0}': expected lowercase domain.object_id")]
    InvalidEntityId(String),
    #[error("updated_at precedes changed_at for '{0}'")]
    UpdatedBeforeChanged(String),
    #[error("attribute '{attribute}' of '{entity_id}' is not a scalar value")]
    NonScalarAttribute { entity_id: String, attribute: String },
}

/// Validates a StateChangeEvent and converts it into a StateRecord.
///
/// Validation rules:
/// - entity_id is required and has the form `domain.object_id`
/// - updated_at is not earlier than changed_at
/// - attribute values are scalars (null, bool, number, string)
pub fn validate_and_convert(event: StateChangeEvent) -> Result<StateRecord, IngestionError> {
    if event.entity_id.is_empty() {
        return Err(IngestionError::MissingEntityId);
    }

    if !is_valid_entity_id(&event.entity_id) {
        return Err(IngestionError::InvalidEntityId(event.entity_id));
    }

    if event.updated_at < event.changed_at {
        return Err(IngestionError::UpdatedBeforeChanged(event.entity_id));
    }

    if let Some(key) = event
        .attributes
        .iter()
        .find(|(_, value)| matches!(value, Value::Array(_) | Value::Object(_)))
        .map(|(key, _)| key.clone())
    {
        return Err(IngestionError::NonScalarAttribute {
            entity_id: event.entity_id,
            attribute: key,
        });
    }

    Ok(StateRecord::new(
        event.entity_id,
        event.state,
        event.attributes,
        event.changed_at,
        event.updated_at,
    ))
}

/// Validates entity id format.
///
/// Valid entity ids:
/// - Exactly one dot separating domain and object id
/// - Neither part empty
/// - Lowercase letters (a-z), numbers (0-9) and underscores only
fn is_valid_entity_id(entity_id: &str) -> bool {
    let Some((domain, object_id)) = entity_id.split_once('.') else {
        return false;
    };

    if domain.is_empty() || object_id.is_empty() || object_id.contains('.') {
        return false;
    }

    entity_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
}
