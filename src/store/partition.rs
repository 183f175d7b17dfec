//! Search helpers over one entity's partition.
//!
//! Every function expects a slice sorted by `last_changed` ascending with
//! ties in insertion order, which is what `EventStore::scan` returns.
//! Query bounds are floored to microseconds first, matching stored records.

use crate::state::{normalize_timestamp, StateRecord};
use chrono::{DateTime, Utc};

/// Index at which a record stamped `at` is inserted: after every record
/// with `last_changed <= at`.
pub fn insertion_point(records: &[StateRecord], at: DateTime<Utc>) -> usize {
    let at = normalize_timestamp(&at);
    records.partition_point(|r| r.last_changed <= at)
}

/// Rightmost record with `last_changed <= at`, so the latest-inserted one
/// wins among equal timestamps.
pub fn latest_at(records: &[StateRecord], at: DateTime<Utc>) -> Option<&StateRecord> {
    match insertion_point(records, at) {
        0 => None,
        idx => records.get(idx - 1),
    }
}

/// Records in the half-open window `[start, end)`.
pub fn between(records: &[StateRecord], start: DateTime<Utc>, end: DateTime<Utc>) -> &[StateRecord] {
    let start = normalize_timestamp(&start);
    let end = normalize_timestamp(&end);
    if start >= end {
        return &[];
    }
    let lo = records.partition_point(|r| r.last_changed < start);
    let hi = records.partition_point(|r| r.last_changed < end);
    &records[lo..hi]
}

/// Up to the last `n` records, still ascending.
pub fn last_n(records: &[StateRecord], n: usize) -> &[StateRecord] {
    &records[records.len().saturating_sub(n)..]
}
