// State records and timestamp normalisation
pub mod state;

// Ingress event model and validation
pub mod event;

// Append-only state log backends
pub mod store;

// Asynchronous ingestion with drain barrier
pub mod recorder;

// Last-N, point-in-time and period queries
pub mod history;

// TOML configuration
pub mod config;

pub use event::{IngestionError, StateChangeEvent};
pub use history::{HistoryError, HistoryQuery};
pub use recorder::{Recorder, RecorderError, RecorderHealth};
pub use state::StateRecord;
pub use store::{EventStore, MemoryStore, SqliteStore, StoreError};
