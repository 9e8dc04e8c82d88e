use std::collections::{HashMap, HashSet};

use taskmesh::config::SchedulerConfig;
use taskmesh::protocol::{Outbound, Stimulus, TaskSpec, ToWorker};
use taskmesh::scheduler::{Scheduler, TaskState};

fn sched() -> Scheduler {
    Scheduler::new(SchedulerConfig::default())
}

fn add_worker(s: &mut Scheduler, address: &str, hostname: &str, ncores: u32) -> Vec<Outbound> {
    s.handle(Stimulus::AddWorker {
        address: address.to_string(),
        hostname: hostname.to_string(),
        ncores,
    })
}

fn finish(s: &mut Scheduler, worker: &str, key: &str, nbytes: u64) -> Vec<Outbound> {
    s.handle(Stimulus::TaskFinished {
        worker: worker.to_string(),
        key: key.to_string(),
        nbytes,
        duration: Some(0.1),
    })
}

fn submit_specs(
    s: &mut Scheduler,
    client: &str,
    tasks: Vec<(&str, TaskSpec)>,
    keys: &[&str],
) -> Vec<Outbound> {
    let tasks: HashMap<String, TaskSpec> = tasks
        .into_iter()
        .map(|(k, spec)| (k.to_string(), spec))
        .collect();
    s.handle(Stimulus::UpdateGraph {
        client: client.to_string(),
        tasks,
        keys: keys.iter().map(|k| k.to_string()).collect(),
    })
}

fn plain(deps: &[&str]) -> TaskSpec {
    TaskSpec {
        payload: b"payload".to_vec(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        ..Default::default()
    }
}

fn restricted(deps: &[&str], hosts: &[&str], loose: bool) -> TaskSpec {
    TaskSpec {
        restrictions: Some(hosts.iter().map(|h| h.to_string()).collect::<HashSet<_>>()),
        loose_restrictions: loose,
        ..plain(deps)
    }
}

fn compute_keys(out: &[Outbound]) -> Vec<(String, String)> {
    out.iter()
        .filter_map(|m| m.compute_task())
        .map(|(w, k)| (w.to_string(), k.to_string()))
        .collect()
}

#[test]
fn test_independent_leaves_spread_over_workers() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    add_worker(&mut s, "w2:9000", "host2", 1);
    let out = submit_specs(
        &mut s,
        "c1",
        vec![("x", plain(&[])), ("y", plain(&[]))],
        &["x", "y"],
    );
    let assigned: HashSet<String> = compute_keys(&out).into_iter().map(|(w, _)| w).collect();
    assert_eq!(assigned.len(), 2, "one task per single-core worker");
}

#[test]
fn test_dependent_prefers_worker_holding_larger_input() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    add_worker(&mut s, "w2:9000", "host2", 1);
    submit_specs(
        &mut s,
        "c1",
        vec![
            ("x", plain(&[])),
            ("y", plain(&[])),
            ("z", plain(&["x", "y"])),
        ],
        &["z"],
    );
    let x_worker = s.state.rprocessing["x"].iter().next().unwrap().clone();
    let y_worker = s.state.rprocessing["y"].iter().next().unwrap().clone();

    finish(&mut s, &x_worker, "x", 1_000_000);
    let out = finish(&mut s, &y_worker, "y", 10);
    assert_eq!(
        compute_keys(&out),
        vec![(x_worker.clone(), "z".to_string())],
        "z goes where the expensive input already is"
    );
}

#[test]
fn test_busy_workers_do_not_accept_more_than_ncores() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 2);
    let out = submit_specs(
        &mut s,
        "c1",
        vec![("a", plain(&[])), ("b", plain(&[])), ("c", plain(&[]))],
        &["a", "b", "c"],
    );
    assert_eq!(compute_keys(&out).len(), 2, "two cores, two dispatches");
    assert_eq!(s.state.ready.len(), 1, "third task queued");

    let running: Vec<&str> = ["a", "b", "c"]
        .into_iter()
        .filter(|k| s.state.task_state(k) == Some(TaskState::Processing))
        .collect();
    let queued = ["a", "b", "c"]
        .into_iter()
        .find(|k| s.state.task_state(k) == Some(TaskState::Waiting))
        .unwrap();
    let out = finish(&mut s, "w1:9000", running[0], 1);
    assert_eq!(
        compute_keys(&out),
        vec![("w1:9000".to_string(), queued.to_string())],
        "freed slot pulls from the ready queue"
    );
}

#[test]
fn test_priority_orders_contested_slot() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    let urgent = TaskSpec {
        priority: -10,
        ..plain(&[])
    };
    let lazy = TaskSpec {
        priority: 10,
        ..plain(&[])
    };
    // Submitted in name order that would favor "aa"; priority must win.
    let out = submit_specs(
        &mut s,
        "c1",
        vec![("aa", lazy), ("zz", urgent)],
        &["aa", "zz"],
    );
    assert_eq!(
        compute_keys(&out),
        vec![("w1:9000".to_string(), "zz".to_string())]
    );
}

#[test]
fn test_priority_orders_contested_stack() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit_specs(&mut s, "c1", vec![("data", plain(&[]))], &["data"]);
    finish(&mut s, "w1:9000", "data", 1_000_000);
    submit_specs(&mut s, "c1", vec![("blocker", plain(&[]))], &["blocker"]);
    assert_eq!(s.state.free_slots("w1:9000"), 0);

    // Both consumers stack on the busy holder of their input. The name
    // order would favor "aa"; the smaller priority tuple must pop first.
    let urgent = TaskSpec {
        priority: -10,
        ..plain(&["data"])
    };
    let lazy = TaskSpec {
        priority: 10,
        ..plain(&["data"])
    };
    submit_specs(
        &mut s,
        "c1",
        vec![("aa", lazy), ("zz", urgent)],
        &["aa", "zz"],
    );
    assert_eq!(s.state.tasks["aa"].stacked_on.as_deref(), Some("w1:9000"));
    assert_eq!(s.state.tasks["zz"].stacked_on.as_deref(), Some("w1:9000"));

    let out = finish(&mut s, "w1:9000", "blocker", 1);
    assert_eq!(
        compute_keys(&out),
        vec![("w1:9000".to_string(), "zz".to_string())]
    );

    let out = finish(&mut s, "w1:9000", "zz", 1);
    assert_eq!(
        compute_keys(&out),
        vec![("w1:9000".to_string(), "aa".to_string())]
    );
}

#[test]
fn test_restricted_task_goes_to_matching_host() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 4);
    add_worker(&mut s, "gpu:9000", "gpu-1", 1);
    let out = submit_specs(
        &mut s,
        "c1",
        vec![("k", restricted(&[], &["gpu-1"], false))],
        &["k"],
    );
    assert_eq!(
        compute_keys(&out),
        vec![("gpu:9000".to_string(), "k".to_string())]
    );
}

#[test]
fn test_unsatisfiable_restriction_parks_task() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 4);
    submit_specs(
        &mut s,
        "c1",
        vec![("k", restricted(&[], &["gpu-1"], false))],
        &["k"],
    );
    assert_eq!(s.state.task_state("k"), Some(TaskState::NoWorker));
    assert!(s.state.unrunnable.contains("k"));

    // A satisfying worker joining unparks it.
    let out = add_worker(&mut s, "gpu:9000", "gpu-1", 1);
    assert_eq!(
        compute_keys(&out),
        vec![("gpu:9000".to_string(), "k".to_string())]
    );
    assert_eq!(s.state.task_state("k"), Some(TaskState::Processing));
}

#[test]
fn test_loose_restriction_falls_back_to_any_worker() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 4);
    let out = submit_specs(
        &mut s,
        "c1",
        vec![("k", restricted(&[], &["gpu-1"], true))],
        &["k"],
    );
    assert_eq!(
        compute_keys(&out),
        vec![("w1:9000".to_string(), "k".to_string())]
    );
}

#[test]
fn test_idle_worker_steals_stacked_task() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit_specs(&mut s, "c1", vec![("a", plain(&[]))], &["a"]);
    finish(&mut s, "w1:9000", "a", 100);

    // Both consumers stack on w1 (it holds a); only one slot there.
    submit_specs(
        &mut s,
        "c1",
        vec![("b", plain(&["a"])), ("c", plain(&["a"]))],
        &["b", "c"],
    );
    assert_eq!(s.state.rprocessing.len(), 1);
    let stacked = if s.state.task_state("b") == Some(TaskState::Waiting) {
        "b"
    } else {
        "c"
    };
    assert_eq!(s.state.tasks[stacked].stacked_on.as_deref(), Some("w1:9000"));

    add_worker(&mut s, "w2:9000", "host2", 1);
    let out = s.handle(Stimulus::RebalanceTick);
    assert_eq!(
        compute_keys(&out),
        vec![("w2:9000".to_string(), stacked.to_string())]
    );
}

#[test]
fn test_steal_respects_restrictions() {
    let mut s = sched();
    add_worker(&mut s, "gpu:9000", "gpu-1", 1);
    submit_specs(&mut s, "c1", vec![("a", plain(&[]))], &["a"]);
    finish(&mut s, "gpu:9000", "a", 100);

    submit_specs(
        &mut s,
        "c1",
        vec![
            ("b", restricted(&["a"], &["gpu-1"], false)),
            ("c", restricted(&["a"], &["gpu-1"], false)),
        ],
        &["b", "c"],
    );

    // The plain worker may not run gpu-restricted work.
    add_worker(&mut s, "w2:9000", "host2", 1);
    let out = s.handle(Stimulus::RebalanceTick);
    assert!(compute_keys(&out).is_empty());
    let still_stacked = ["b", "c"]
        .into_iter()
        .filter(|k| s.state.tasks[*k].stacked_on.as_deref() == Some("gpu:9000"))
        .count();
    assert_eq!(still_stacked, 1);
}

#[test]
fn test_worker_goes_idle_when_nothing_is_left() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit_specs(&mut s, "c1", vec![("a", plain(&[]))], &["a"]);
    assert!(!s.state.idle.contains("w1:9000"));
    finish(&mut s, "w1:9000", "a", 1);
    assert!(s.state.idle.contains("w1:9000"));
}

#[test]
fn test_release_messages_clean_up_cancelled_dispatch() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit_specs(&mut s, "c1", vec![("a", plain(&[]))], &["a"]);
    let out = s.handle(Stimulus::ClientReleasesKeys {
        client: "c1".to_string(),
        keys: vec!["a".to_string()],
    });
    assert!(out.contains(&Outbound::Worker(
        "w1:9000".to_string(),
        ToWorker::Release {
            key: "a".to_string()
        }
    )));
    // A late finish for the cancelled key is ignored.
    let out = finish(&mut s, "w1:9000", "a", 10);
    assert!(compute_keys(&out).is_empty());
    assert!(!s.state.tasks.contains_key("a"));
}
