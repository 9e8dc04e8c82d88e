use std::collections::HashMap;

use taskmesh::config::SchedulerConfig;
use taskmesh::protocol::{Outbound, Stimulus, TaskSpec, ToClient, ToWorker};
use taskmesh::scheduler::{Scheduler, TaskState};

fn sched() -> Scheduler {
    Scheduler::new(SchedulerConfig::default())
}

fn spec(deps: &[&str]) -> TaskSpec {
    TaskSpec {
        payload: b"payload".to_vec(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        ..Default::default()
    }
}

fn submit(
    s: &mut Scheduler,
    client: &str,
    tasks: &[(&str, &[&str])],
    keys: &[&str],
) -> Vec<Outbound> {
    let tasks: HashMap<String, TaskSpec> = tasks
        .iter()
        .map(|(k, deps)| (k.to_string(), spec(deps)))
        .collect();
    s.handle(Stimulus::UpdateGraph {
        client: client.to_string(),
        tasks,
        keys: keys.iter().map(|k| k.to_string()).collect(),
    })
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

fn compute_keys(out: &[Outbound]) -> Vec<(String, String)> {
    out.iter()
        .filter_map(|m| m.compute_task())
        .map(|(w, k)| (w.to_string(), k.to_string()))
        .collect()
}

#[test]
fn test_submit_without_workers_parks_tasks() {
    let mut s = sched();
    submit(&mut s, "c1", &[("a", &[])], &["a"]);
    assert_eq!(s.state.task_state("a"), Some(TaskState::NoWorker));
    assert!(s.state.unrunnable.contains("a"));
}

#[test]
fn test_leaf_dispatched_to_free_worker() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    let out = submit(&mut s, "c1", &[("a", &[])], &["a"]);
    assert_eq!(
        compute_keys(&out),
        vec![("w1:9000".to_string(), "a".to_string())]
    );
    assert_eq!(s.state.task_state("a"), Some(TaskState::Processing));
}

#[test]
fn test_dependent_waits_for_dependency() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 2);
    let out = submit(&mut s, "c1", &[("a", &[]), ("b", &["a"])], &["b"]);
    assert_eq!(compute_keys(&out).len(), 1, "only the leaf is dispatched");
    assert_eq!(s.state.task_state("b"), Some(TaskState::Waiting));

    let out = finish(&mut s, "w1:9000", "a", 10);
    assert_eq!(
        compute_keys(&out),
        vec![("w1:9000".to_string(), "b".to_string())]
    );
}

#[test]
fn test_compute_task_carries_dependency_locations() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 2);
    submit(&mut s, "c1", &[("a", &[]), ("b", &["a"])], &["b"]);
    let out = finish(&mut s, "w1:9000", "a", 10);

    let who_has = out
        .iter()
        .find_map(|m| match m {
            Outbound::Worker(_, ToWorker::ComputeTask { key, who_has, .. }) if key == "b" => {
                Some(who_has.clone())
            }
            _ => None,
        })
        .expect("compute-task for b");
    assert_eq!(who_has["a"], vec!["w1:9000".to_string()]);
}

#[test]
fn test_finished_wanted_key_notifies_client() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit(&mut s, "c1", &[("a", &[])], &["a"]);
    let out = finish(&mut s, "w1:9000", "a", 42);
    assert!(out.contains(&Outbound::Client(
        "c1".to_string(),
        ToClient::KeyDone {
            key: "a".to_string(),
            nbytes: 42,
        }
    )));
}

#[test]
fn test_requesting_a_memory_key_answers_immediately() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit(&mut s, "c1", &[("a", &[])], &["a"]);
    finish(&mut s, "w1:9000", "a", 42);

    let out = submit(&mut s, "c2", &[("a", &[])], &["a"]);
    assert!(out.contains(&Outbound::Client(
        "c2".to_string(),
        ToClient::KeyDone {
            key: "a".to_string(),
            nbytes: 42,
        }
    )));
}

#[test]
fn test_update_graph_is_idempotent() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 2);
    let graph: &[(&str, &[&str])] = &[("a", &[]), ("b", &["a"])];
    submit(&mut s, "c1", graph, &["b"]);
    let states_once: Vec<_> = ["a", "b"].iter().map(|k| s.state.task_state(k)).collect();
    let processing_once = s.state.rprocessing.len();

    let out = submit(&mut s, "c1", graph, &["b"]);
    let states_twice: Vec<_> = ["a", "b"].iter().map(|k| s.state.task_state(k)).collect();
    assert_eq!(states_once, states_twice);
    assert_eq!(s.state.rprocessing.len(), processing_once);
    assert!(compute_keys(&out).is_empty(), "nothing re-dispatched");
}

#[test]
fn test_disjoint_submissions_commute() {
    let run = |first: bool| {
        let mut s = sched();
        add_worker(&mut s, "w1:9000", "host1", 4);
        let g1: &[(&str, &[&str])] = &[("a", &[]), ("b", &["a"])];
        let g2: &[(&str, &[&str])] = &[("x", &[]), ("y", &["x"])];
        if first {
            submit(&mut s, "c1", g1, &["b"]);
            submit(&mut s, "c2", g2, &["y"]);
        } else {
            submit(&mut s, "c2", g2, &["y"]);
            submit(&mut s, "c1", g1, &["b"]);
        }
        let mut snapshot: Vec<(String, String)> = s
            .state
            .tasks
            .iter()
            .map(|(k, t)| (k.clone(), t.state.to_string()))
            .collect();
        snapshot.sort();
        snapshot
    };
    assert_eq!(run(true), run(false));
}

#[test]
fn test_cyclic_graph_rejected() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    let out = submit(&mut s, "c1", &[("a", &["b"]), ("b", &["a"])], &["a"]);
    assert!(s.state.tasks.is_empty(), "nothing from the submission sticks");
    let erred = out.iter().any(|m| {
        matches!(m, Outbound::Client(c, ToClient::KeyErred { key, exception, .. })
            if c == "c1" && key == "a" && exception.contains("cycle"))
    });
    assert!(erred);
}

#[test]
fn test_unknown_dependency_rejected() {
    let mut s = sched();
    let out = submit(&mut s, "c1", &[("a", &["ghost"])], &["a"]);
    assert!(s.state.tasks.is_empty());
    let erred = out.iter().any(|m| {
        matches!(m, Outbound::Client(_, ToClient::KeyErred { exception, .. })
            if exception.contains("unknown dependency"))
    });
    assert!(erred);
}

#[test]
fn test_intermediate_released_after_consumption() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit(&mut s, "c1", &[("a", &[]), ("b", &["a"])], &["b"]);
    finish(&mut s, "w1:9000", "a", 10);
    let out = finish(&mut s, "w1:9000", "b", 20);

    // Nobody wants a and nothing else will consume it.
    assert_eq!(s.state.task_state("a"), Some(TaskState::Released));
    assert!(out.contains(&Outbound::Worker(
        "w1:9000".to_string(),
        ToWorker::Release {
            key: "a".to_string()
        }
    )));
    assert_eq!(s.state.task_state("b"), Some(TaskState::Memory));
}

#[test]
fn test_client_release_forgets_unneeded_graph() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit(&mut s, "c1", &[("a", &[]), ("b", &["a"])], &["b"]);
    s.handle(Stimulus::ClientReleasesKeys {
        client: "c1".to_string(),
        keys: vec!["b".to_string()],
    });
    assert!(
        s.state.tasks.is_empty(),
        "abandoned graph drains away entirely"
    );
}

#[test]
fn test_resubmission_revives_released_keys() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 1);
    submit(&mut s, "c1", &[("a", &[]), ("b", &["a"])], &["b"]);
    finish(&mut s, "w1:9000", "a", 10);
    finish(&mut s, "w1:9000", "b", 20);
    assert_eq!(s.state.task_state("a"), Some(TaskState::Released));

    // A new task consuming a forces a to be recomputed.
    let out = submit(&mut s, "c2", &[("c", &["a"])], &["c"]);
    assert_eq!(
        compute_keys(&out),
        vec![("w1:9000".to_string(), "a".to_string())]
    );
    assert_eq!(s.state.task_state("a"), Some(TaskState::Processing));
}

#[test]
fn test_gather_reports_locations_and_missing() {
    let mut s = sched();
    add_worker(&mut s, "w1:9000", "host1", 2);
    submit(&mut s, "c1", &[("a", &[]), ("b", &["a"])], &["b"]);
    finish(&mut s, "w1:9000", "a", 10);

    let out = s.handle(Stimulus::Gather {
        client: "c1".to_string(),
        keys: vec!["a".to_string(), "b".to_string(), "nope".to_string()],
    });
    let (who_has, missing) = out
        .iter()
        .find_map(|m| match m {
            Outbound::Client(c, ToClient::GatherReply { who_has, missing }) if c == "c1" => {
                Some((who_has.clone(), missing.clone()))
            }
            _ => None,
        })
        .expect("gather reply");
    assert_eq!(who_has["a"], vec!["w1:9000".to_string()]);
    assert_eq!(missing, vec!["b".to_string(), "nope".to_string()]);
}

#[test]
fn test_batched_stimuli_apply_in_order() {
    let mut s = sched();
    // A batch arriving as one transport frame is just a sequence of
    // stimuli applied back to back.
    let batch = vec![
        Stimulus::AddWorker {
            address: "w1:9000".to_string(),
            hostname: "host1".to_string(),
            ncores: 1,
        },
        Stimulus::UpdateGraph {
            client: "c1".to_string(),
            tasks: HashMap::from([("a".to_string(), spec(&[]))]),
            keys: vec!["a".to_string()],
        },
        Stimulus::TaskFinished {
            worker: "w1:9000".to_string(),
            key: "a".to_string(),
            nbytes: 1,
            duration: None,
        },
    ];
    let mut out = Vec::new();
    for stimulus in batch {
        out.extend(s.handle(stimulus));
    }
    assert_eq!(s.state.task_state("a"), Some(TaskState::Memory));
    assert!(out
        .iter()
        .any(|m| matches!(m, Outbound::Client(_, ToClient::KeyDone { .. }))));
}
