// State records persisted by the recorder

mod record;

pub use record::{normalize_timestamp, StateRecord};
