use super::*;
use crate::store::{partition, MemoryStore, SqliteStore, StoreResult};
use chrono::{Duration, TimeZone};
use serde_json::json;
use std::collections::HashMap;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 10, 18, 0, 0).unwrap()
}

fn at(offset_ms: i64) -> DateTime<Utc> {
    t0() + Duration::milliseconds(offset_ms)
}

fn stores() -> Vec<(&'static str, Arc<dyn EventStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new()) as Arc<dyn EventStore>),
        ("sqlite", Arc::new(SqliteStore::open_in_memory().unwrap()) as Arc<dyn EventStore>),
    ]
}

/// Irregular history for a handful of entities, including equal timestamps
fn seed(store: &dyn EventStore) {
    let offsets = [0, 0, 400, 1000, 1000, 1000, 2500, 4000, 4001, 9000];
    for (i, offset) in offsets.iter().enumerate() {
        store
            .append(&StateRecord::changed_at("sensor.alpha", format!("a{}", i), at(*offset)))
            .unwrap();
    }
    for i in 0..4 {
        store
            .append(&StateRecord::changed_at("sensor.beta", format!("b{}", i), at(1000 + i * 1500)))
            .unwrap();
    }
    store
        .append(&StateRecord::changed_at("switch.gamma", "on", at(5000)))
        .unwrap();
}

/// Fails every read
struct BrokenStore;

impl EventStore for BrokenStore {
    fn append(&self, _record: &StateRecord) -> StoreResult<()> {
        Ok(())
    }

    fn scan(&self, _entity_id: &str) -> StoreResult<Vec<StateRecord>> {
        Err(StoreError::Unavailable("disk unplugged".to_string()))
    }

    fn scan_all_entities(&self) -> StoreResult<HashMap<String, Vec<StateRecord>>> {
        Err(StoreError::Unavailable("disk unplugged".to_string()))
    }

    fn record_count(&self) -> StoreResult<usize> {
        Err(StoreError::Unavailable("disk unplugged".to_string()))
    }
}

#[test]
fn test_last_5_of_7_states_newest_first() {
    for (name, store) in stores() {
        for i in 0..7 {
            store
                .append(&StateRecord::changed_at("test.entity", format!("State {}", i), at(i * 1000)))
                .unwrap();
        }
        let history = HistoryQuery::new(store);

        let states: Vec<String> = history
            .last_5_states("test.entity")
            .unwrap()
            .into_iter()
            .map(|r| r.state)
            .collect();
        assert_eq!(
            states,
            vec!["State 6", "State 5", "State 4", "State 3", "State 2"],
            "backend {}",
            name
        );
    }
}

#[test]
fn test_last_n_states_short_history_and_unknown_entity() {
    for (name, store) in stores() {
        store
            .append(&StateRecord::changed_at("switch.porch", "on", at(0)))
            .unwrap();
        let history = HistoryQuery::new(store);

        assert_eq!(history.last_n_states("switch.porch", 10).unwrap().len(), 1, "backend {}", name);
        assert!(history.last_n_states("switch.porch", 0).unwrap().is_empty());
        assert!(history.last_n_states("switch.unknown", 3).unwrap().is_empty());
    }
}

#[test]
fn test_last_n_matches_reversed_scan_tail() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store.clone());

        for entity_id in ["sensor.alpha", "sensor.beta", "switch.gamma"] {
            let scanned = store.scan(entity_id).unwrap();
            for n in 0..12 {
                let mut expected = partition::last_n(&scanned, n).to_vec();
                expected.reverse();
                assert_eq!(
                    history.last_n_states(entity_id, n).unwrap(),
                    expected,
                    "backend {} entity {} n {}",
                    name,
                    entity_id,
                    n
                );
            }
        }
    }
}

#[test]
fn test_get_states_between_two_rounds() {
    for (name, store) in stores() {
        for round in 0..2 {
            for i in 0..5 {
                let record = StateRecord::changed_at(
                    format!("test.point_in_time_{}", i),
                    format!("State {}", i),
                    at(round * 1000),
                )
                .with_attribute("attribute_test", json!(i));
                store.append(&record).unwrap();
            }
        }
        let history = HistoryQuery::new(store);

        let states = history.get_states(at(500)).unwrap();
        assert_eq!(states.len(), 5, "backend {}", name);
        for (i, record) in states.iter().enumerate() {
            assert_eq!(record.entity_id, format!("test.point_in_time_{}", i));
            assert_eq!(record.last_changed, at(0));
            assert_eq!(record.attributes["attribute_test"], json!(i));
        }

        assert_eq!(
            history.get_state(at(500), "test.point_in_time_0").unwrap().as_ref(),
            states.first()
        );
    }
}

#[test]
fn test_get_state_matches_filtered_scan() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store.clone());

        for entity_id in ["sensor.alpha", "sensor.beta", "switch.gamma", "sensor.unknown"] {
            let scanned = store.scan(entity_id).unwrap();
            for offset in (-500..10_000).step_by(250) {
                let expected = scanned
                    .iter()
                    .filter(|r| r.last_changed <= at(offset))
                    .last()
                    .cloned();
                assert_eq!(
                    history.get_state(at(offset), entity_id).unwrap(),
                    expected,
                    "backend {} entity {} offset {}",
                    name,
                    entity_id,
                    offset
                );
            }
        }
    }
}

#[test]
fn test_get_states_agrees_with_get_state() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store);

        for offset in [-1, 0, 999, 1000, 4000, 5000, 20_000] {
            let states = history.get_states(at(offset)).unwrap();
            for record in &states {
                assert_eq!(
                    history.get_state(at(offset), &record.entity_id).unwrap().as_ref(),
                    Some(record),
                    "backend {} offset {}",
                    name,
                    offset
                );
            }
            let expected_count = ["sensor.alpha", "sensor.beta", "switch.gamma"]
                .iter()
                .filter(|id| history.get_state(at(offset), id).unwrap().is_some())
                .count();
            assert_eq!(states.len(), expected_count);
        }
    }
}

#[test]
fn test_equal_timestamps_latest_inserted_wins() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store);

        // a3, a4, a5 all share the 1000ms stamp
        let record = history.get_state(at(1000), "sensor.alpha").unwrap().unwrap();
        assert_eq!(record.state, "a5", "backend {}", name);
    }
}

#[test]
fn test_get_states_for_selected_entities() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store);

        let states = history
            .get_states_for(at(4500), &["switch.gamma", "sensor.beta", "sensor.alpha"])
            .unwrap();
        let summary: Vec<(&str, &str)> = states
            .iter()
            .map(|r| (r.entity_id.as_str(), r.state.as_str()))
            .collect();
        // switch.gamma starts at 5000ms, so it is omitted
        assert_eq!(
            summary,
            vec![("sensor.beta", "b2"), ("sensor.alpha", "a8")],
            "backend {}",
            name
        );
    }
}

#[test]
fn test_state_changes_during_period_window() {
    for (name, store) in stores() {
        let entity_id = "media_player.test";
        let start = at(0);
        let point = start + Duration::seconds(1);
        let end = point + Duration::seconds(1);

        for state in ["idle", "YouTube"] {
            store
                .append(&StateRecord::changed_at(entity_id, state, start - Duration::milliseconds(10)))
                .unwrap();
        }
        let mut expected = Vec::new();
        for state in ["idle", "Netflix", "Plex", "YouTube"] {
            let record = StateRecord::changed_at(entity_id, state, point);
            store.append(&record).unwrap();
            expected.push(record);
        }
        for state in ["Netflix", "Plex"] {
            store
                .append(&StateRecord::changed_at(entity_id, state, end))
                .unwrap();
        }
        let history = HistoryQuery::new(store);

        assert_eq!(
            history.state_changes_during_period(start, end, entity_id).unwrap(),
            expected,
            "backend {}",
            name
        );
    }
}

#[test]
fn test_adjacent_periods_partition_the_timeline() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store);
        let instants = [-100, 0, 400, 1000, 2500, 3000, 4001, 9000, 12_000];

        for entity_id in ["sensor.alpha", "sensor.beta"] {
            for (i, a) in instants.iter().enumerate() {
                for (j, b) in instants.iter().enumerate().skip(i) {
                    for c in instants.iter().skip(j) {
                        let mut joined = history
                            .state_changes_during_period(at(*a), at(*b), entity_id)
                            .unwrap();
                        joined.extend(
                            history
                                .state_changes_during_period(at(*b), at(*c), entity_id)
                                .unwrap(),
                        );
                        let whole = history
                            .state_changes_during_period(at(*a), at(*c), entity_id)
                            .unwrap();
                        assert_eq!(
                            joined, whole,
                            "backend {} entity {} a {} b {} c {}",
                            name, entity_id, a, b, c
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn test_period_start_inclusive_end_exclusive() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store);

        let states: Vec<String> = history
            .state_changes_during_period(at(1000), at(4000), "sensor.alpha")
            .unwrap()
            .into_iter()
            .map(|r| r.state)
            .collect();
        assert_eq!(states, vec!["a3", "a4", "a5", "a6"], "backend {}", name);

        assert!(history
            .state_changes_during_period(at(4000), at(1000), "sensor.alpha")
            .unwrap()
            .is_empty());
        assert!(history
            .state_changes_during_period(at(0), at(20_000), "sensor.unknown")
            .unwrap()
            .is_empty());
    }
}

#[test]
fn test_changes_during_period_all_groups_entities() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store);

        let changes = history.changes_during_period_all(at(4000), at(5001)).unwrap();
        let keys: Vec<&String> = changes.keys().collect();
        assert_eq!(keys, vec!["sensor.alpha", "sensor.beta", "switch.gamma"], "backend {}", name);
        assert_eq!(changes["sensor.alpha"].len(), 2);
        assert_eq!(changes["sensor.beta"].len(), 1);
        assert_eq!(changes["switch.gamma"].len(), 1);
    }
}

#[test]
fn test_reads_are_idempotent() {
    for (name, store) in stores() {
        seed(store.as_ref());
        let history = HistoryQuery::new(store);

        assert_eq!(
            history.get_states(at(3000)).unwrap(),
            history.get_states(at(3000)).unwrap(),
            "backend {}",
            name
        );
        assert_eq!(
            history.last_n_states("sensor.alpha", 4).unwrap(),
            history.last_n_states("sensor.alpha", 4).unwrap()
        );
        assert_eq!(
            history.changes_during_period_all(at(0), at(9000)).unwrap(),
            history.changes_during_period_all(at(0), at(9000)).unwrap()
        );
    }
}

#[test]
fn test_read_failures_surface_to_caller() {
    let history = HistoryQuery::new(Arc::new(BrokenStore));

    assert!(matches!(
        history.last_n_states("sensor.alpha", 3),
        Err(HistoryError::Store(StoreError::Unavailable(_)))
    ));
    assert!(history.get_states(t0()).is_err());
    assert!(history.get_state(t0(), "sensor.alpha").is_err());
    assert!(history
        .state_changes_during_period(t0(), at(1000), "sensor.alpha")
        .is_err());
    assert!(history.changes_during_period_all(t0(), at(1000)).is_err());
}

#[test]
fn test_sub_microsecond_bounds_match_stored_precision() {
    for (name, store) in stores() {
        let boundary = at(0) + Duration::nanoseconds(1500);
        store
            .append(&StateRecord::changed_at("sensor.fast", "tick", boundary))
            .unwrap();
        let history = HistoryQuery::new(store);

        let before = history
            .state_changes_during_period(at(0), boundary, "sensor.fast")
            .unwrap();
        let after = history
            .state_changes_during_period(boundary, at(1), "sensor.fast")
            .unwrap();
        assert!(before.is_empty(), "backend {}", name);
        assert_eq!(after.len(), 1, "backend {}", name);

        assert!(history.get_state(boundary, "sensor.fast").unwrap().is_some());
        assert!(history
            .get_state(at(0) + Duration::nanoseconds(999), "sensor.fast")
            .unwrap()
            .is_none());
        assert_eq!(history.get_states(boundary).unwrap().len(), 1, "backend {}", name);
    }
}
