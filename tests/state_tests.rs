use std::collections::HashSet;

use taskmesh::scheduler::state::SchedulerState;
use taskmesh::scheduler::{Priority, TaskState};

fn keyset(keys: &[&str]) -> HashSet<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

fn add_leaf(state: &mut SchedulerState, key: &str, order: u64) -> bool {
    state.add_task(
        key.to_string(),
        b"payload".to_vec(),
        HashSet::new(),
        Priority::new(0, 1, order),
        None,
        false,
    )
}

#[test]
fn test_add_task_builds_both_edge_directions() {
    let mut state = SchedulerState::new();
    add_leaf(&mut state, "a", 0);
    let ready = state.add_task(
        "b".to_string(),
        b"payload".to_vec(),
        keyset(&["a"]),
        Priority::new(0, 1, 1),
        None,
        false,
    );

    assert!(!ready, "b waits on a");
    assert_eq!(state.dependencies["b"], keyset(&["a"]));
    assert_eq!(state.dependents["a"], keyset(&["b"]));
    assert_eq!(state.waiting["b"], keyset(&["a"]));
    assert_eq!(state.waiting_data["a"], keyset(&["b"]));
    state.validate().unwrap();
}

#[test]
fn test_leaf_task_is_immediately_ready() {
    let mut state = SchedulerState::new();
    assert!(add_leaf(&mut state, "a", 0));
    assert!(state.waiting["a"].is_empty());
    state.validate().unwrap();
}

#[test]
fn test_processing_and_memory_records_keep_transposes() {
    let mut state = SchedulerState::new();
    state.add_worker("w1:9000".to_string(), "host1".to_string(), 2);
    add_leaf(&mut state, "a", 0);

    state.record_processing("a", "w1:9000", 0.5);
    assert_eq!(state.task_state("a"), Some(TaskState::Processing));
    assert!(state.processing["w1:9000"].contains_key("a"));
    assert_eq!(state.rprocessing["a"], keyset(&["w1:9000"]));
    state.validate().unwrap();

    let redundant = state.record_memory("a", "w1:9000", 128);
    assert!(redundant.is_empty());
    assert_eq!(state.task_state("a"), Some(TaskState::Memory));
    assert_eq!(state.who_has["a"], keyset(&["w1:9000"]));
    assert!(state.has_what["w1:9000"].contains("a"));
    assert!(!state.processing["w1:9000"].contains_key("a"));
    assert_eq!(state.tasks["a"].nbytes, Some(128));
    state.validate().unwrap();
}

#[test]
fn test_record_memory_releases_redundant_assignments() {
    let mut state = SchedulerState::new();
    state.add_worker("w1:9000".to_string(), "host1".to_string(), 1);
    state.add_worker("w2:9000".to_string(), "host2".to_string(), 1);
    add_leaf(&mut state, "a", 0);

    state.record_processing("a", "w1:9000", 0.5);
    state
        .rprocessing
        .get_mut("a")
        .unwrap()
        .insert("w2:9000".to_string());
    state
        .processing
        .get_mut("w2:9000")
        .unwrap()
        .insert("a".to_string(), 0.5);

    let redundant = state.record_memory("a", "w1:9000", 64);
    assert_eq!(redundant, vec!["w2:9000".to_string()]);
    state.validate().unwrap();
}

#[test]
fn test_remove_worker_returns_everything_it_was_doing() {
    let mut state = SchedulerState::new();
    state.add_worker("w1:9000".to_string(), "host1".to_string(), 2);
    add_leaf(&mut state, "a", 0);
    add_leaf(&mut state, "b", 1);
    state.record_processing("a", "w1:9000", 0.5);
    state.record_memory("b", "w1:9000", 32);

    let removal = state.remove_worker("w1:9000").unwrap();
    assert_eq!(removal.processing.len(), 1);
    assert_eq!(removal.processing[0].0, "a");
    assert_eq!(removal.held, vec!["b".to_string()]);
    assert!(!state.workers.contains_key("w1:9000"));
    assert!(!state.rprocessing.contains_key("a"));
    assert!(!state.who_has.contains_key("b"));

    // Removing an unknown worker is a no-op.
    assert!(state.remove_worker("w1:9000").is_none());
}

#[test]
fn test_client_interest_transposes() {
    let mut state = SchedulerState::new();
    add_leaf(&mut state, "a", 0);
    state.add_client("c1".to_string());
    state.record_wants("c1", "a");

    assert_eq!(state.who_wants["a"], keyset(&["c1"]));
    assert!(state.wants_what["c1"].contains("a"));
    assert!(state.is_wanted("a"));
    state.validate().unwrap();

    assert!(state.drop_wants("c1", "a"));
    assert!(!state.is_wanted("a"));
    state.validate().unwrap();
}

#[test]
fn test_remove_client_returns_wanted_keys() {
    let mut state = SchedulerState::new();
    add_leaf(&mut state, "a", 0);
    add_leaf(&mut state, "b", 1);
    state.add_client("c1".to_string());
    state.record_wants("c1", "a");
    state.record_wants("c1", "b");

    let mut keys = state.remove_client("c1");
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    assert!(!state.is_wanted("a"));
    assert!(state.clients.is_empty());
    state.validate().unwrap();
}

#[test]
fn test_replica_bookkeeping() {
    let mut state = SchedulerState::new();
    state.add_worker("w1:9000".to_string(), "host1".to_string(), 1);
    state.add_worker("w2:9000".to_string(), "host2".to_string(), 1);
    add_leaf(&mut state, "a", 0);
    state.record_processing("a", "w1:9000", 0.5);
    state.record_memory("a", "w1:9000", 64);

    assert!(state.add_replica("a", "w2:9000"));
    assert_eq!(state.who_has["a"].len(), 2);
    state.validate().unwrap();

    assert!(!state.remove_replica("a", "w1:9000"));
    assert!(state.remove_replica("a", "w2:9000"), "last replica gone");
}

#[test]
fn test_add_replica_rejects_non_memory_tasks() {
    let mut state = SchedulerState::new();
    state.add_worker("w1:9000".to_string(), "host1".to_string(), 1);
    add_leaf(&mut state, "a", 0);
    assert!(!state.add_replica("a", "w1:9000"));
}

#[test]
fn test_remove_task_clears_edges() {
    let mut state = SchedulerState::new();
    add_leaf(&mut state, "a", 0);
    state.add_task(
        "b".to_string(),
        b"payload".to_vec(),
        keyset(&["a"]),
        Priority::new(0, 1, 1),
        None,
        false,
    );

    // b is released with no dependents; removal must strip it from a's
    // reverse indices.
    state.record_released("b");
    state.remove_task("b");
    assert!(!state.tasks.contains_key("b"));
    assert!(state.dependents["a"].is_empty());
    assert!(state.waiting_data["a"].is_empty());
    state.validate().unwrap();
}

#[test]
fn test_mean_duration_defaults_until_observed() {
    let mut state = SchedulerState::new();
    assert_eq!(state.mean_duration(0.5), 0.5);
    state.observe_duration(1.0);
    state.observe_duration(3.0);
    assert_eq!(state.mean_duration(0.5), 2.0);
    // Garbage samples are ignored.
    state.observe_duration(f64::NAN);
    state.observe_duration(-1.0);
    assert_eq!(state.mean_duration(0.5), 2.0);
}

#[test]
fn test_free_slots_and_occupancy() {
    let mut state = SchedulerState::new();
    state.add_worker("w1:9000".to_string(), "host1".to_string(), 2);
    add_leaf(&mut state, "a", 0);
    add_leaf(&mut state, "b", 1);

    assert_eq!(state.free_slots("w1:9000"), 2);
    state.record_processing("a", "w1:9000", 0.5);
    state.record_processing("b", "w1:9000", 0.25);
    assert_eq!(state.free_slots("w1:9000"), 0);
    assert!((state.occupancy("w1:9000") - 0.75).abs() < 1e-9);
    assert_eq!(state.free_slots("unknown:1"), 0);
}

#[test]
fn test_validate_catches_broken_transpose() {
    let mut state = SchedulerState::new();
    add_leaf(&mut state, "a", 0);
    state
        .dependents
        .get_mut("a")
        .unwrap()
        .insert("ghost".to_string());
    assert!(state.validate().is_err());
}
