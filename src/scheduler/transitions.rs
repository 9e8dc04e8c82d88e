//! Per-task state transitions and their side effects.
//!
//! Each transition either completes all of its side effects or makes none
//! visible: handlers run serially, so a transition is never observed
//! half-applied. Every function here touches only the task's graph
//! neighborhood (in-edges, out-edges, replicas).

use std::collections::{HashSet, VecDeque};

use crate::protocol::{ToClient, ToWorker};
use crate::scheduler::task::{TaskError, TaskKey, TaskState};
use crate::scheduler::Scheduler;

impl Scheduler {
    /// processing → memory. Settles dependents, unpins consumed inputs,
    /// notifies interested clients and refills the finishing worker.
    pub(crate) fn transition_to_memory(
        &mut self,
        key: &str,
        worker: &str,
        nbytes: u64,
        duration: Option<f64>,
    ) {
        let redundant = self.state.record_memory(key, worker, nbytes);
        for w in redundant {
            // Replicated dispatch transient: another worker is still
            // computing this; tell it to stop.
            self.send_worker(&w, ToWorker::Release { key: key.to_string() });
        }
        if let Some(secs) = duration {
            self.state.observe_duration(secs);
            if let Some(task) = self.state.tasks.get_mut(key) {
                task.duration = Some(secs);
            }
        }

        // Dependents stop waiting on this key; dispatch the ones that are
        // now unblocked.
        let dependents: Vec<TaskKey> = self.state.dependents[key].iter().cloned().collect();
        for d in dependents {
            let newly_ready = match self.state.waiting.get_mut(&d) {
                Some(wset) => {
                    wset.remove(key);
                    wset.is_empty()
                }
                None => false,
            };
            if newly_ready {
                let task = &self.state.tasks[&d];
                if task.state == TaskState::Waiting && !task.queued {
                    self.dispatch_ready(&d);
                }
            }
        }

        // This task consumed its inputs; inputs nobody else needs can go.
        let deps: Vec<TaskKey> = self.state.dependencies[key].iter().cloned().collect();
        for p in &deps {
            if let Some(wd) = self.state.waiting_data.get_mut(p) {
                wd.remove(key);
            }
        }
        for p in &deps {
            self.release_if_unneeded(p);
        }

        let clients: Vec<String> = self.state.desired_by(key).cloned().collect();
        for c in clients {
            self.send_client(
                &c,
                ToClient::KeyDone {
                    key: key.to_string(),
                    nbytes,
                },
            );
        }

        self.ensure_worker_occupied(worker);
    }

    /// Mark `root` erred and propagate blame through `dependents*`. Already
    /// erred tasks keep their blame but are traversed; finished (memory)
    /// dependents are left alone — their results exist and stand.
    ///
    /// Idempotent: re-running for the same root only touches tasks that
    /// erred since, so update-graph can re-propagate after attaching new
    /// dependents to an erred key.
    pub(crate) fn transition_to_erred(&mut self, root: &str, error: Option<TaskError>) {
        if let Some(e) = error {
            self.state.exceptions.insert(root.to_string(), e);
        }
        let err = self
            .state
            .exceptions
            .get(root)
            .cloned()
            .unwrap_or_else(|| TaskError {
                exception: format!("task {root} erred"),
                traceback: String::new(),
            });

        let mut queue: VecDeque<TaskKey> = VecDeque::from([root.to_string()]);
        let mut seen: HashSet<TaskKey> = HashSet::from([root.to_string()]);
        while let Some(k) = queue.pop_front() {
            let Some(task) = self.state.tasks.get(&k) else {
                continue;
            };
            match task.state {
                // A finished dependent's result stands; its own dependents
                // no longer depend on the erred root through it.
                TaskState::Memory => continue,
                TaskState::Erred => {}
                _ => {
                    let (holders, cancelled) = self.state.record_erred(&k);
                    for w in holders.into_iter().chain(cancelled) {
                        self.send_worker(&w, ToWorker::Release { key: k.clone() });
                    }
                    self.state
                        .exceptions_blame
                        .insert(k.clone(), root.to_string());
                    tracing::info!(key = %k, blame = root, "Task erred");
                    let clients: Vec<String> = self.state.desired_by(&k).cloned().collect();
                    for c in clients {
                        self.send_client(
                            &c,
                            ToClient::KeyErred {
                                key: k.clone(),
                                blame: root.to_string(),
                                exception: err.exception.clone(),
                                traceback: err.traceback.clone(),
                            },
                        );
                    }
                }
            }
            for d in &self.state.dependents[&k] {
                if seen.insert(d.clone()) {
                    queue.push_back(d.clone());
                }
            }
        }
    }

    /// processing → waiting, after the assignment evaporated (worker lost or
    /// gave up). Recomputes the unmet-dependency set and re-dispatches if it
    /// is empty.
    pub(crate) fn return_to_waiting(&mut self, key: &str) {
        let (_, cancelled) = self.state.record_released(key);
        for w in cancelled {
            self.send_worker(&w, ToWorker::Release { key: key.to_string() });
        }
        let unmet: HashSet<TaskKey> = self.state.dependencies[key]
            .iter()
            .filter(|d| self.state.tasks[*d].state != TaskState::Memory)
            .cloned()
            .collect();
        let ready = unmet.is_empty();
        self.state
            .tasks
            .get_mut(key)
            .expect("return_to_waiting: unknown task")
            .state = TaskState::Waiting;
        self.state.waiting.insert(key.to_string(), unmet);
        if ready {
            self.dispatch_ready(key);
        }
    }

    /// Release a key if no client wants it and nothing will consume it,
    /// cancelling it if currently in flight, then walk the same check up its
    /// dependency chain. Records that end up with no dependents at all are
    /// forgotten entirely.
    pub(crate) fn release_if_unneeded(&mut self, key: &str) {
        let mut work: Vec<TaskKey> = vec![key.to_string()];
        while let Some(k) = work.pop() {
            let Some(task) = self.state.tasks.get(&k) else {
                continue;
            };
            if self.state.is_wanted(&k) || self.state.has_pending_consumers(&k) {
                continue;
            }
            match task.state {
                TaskState::Released | TaskState::Erred => {
                    self.maybe_forget(&k, &mut work);
                }
                TaskState::Memory => {
                    let (holders, _) = self.state.record_released(&k);
                    for w in holders {
                        self.send_worker(&w, ToWorker::Release { key: k.clone() });
                    }
                    tracing::debug!(key = %k, "Released unneeded result");
                    self.maybe_forget(&k, &mut work);
                }
                TaskState::Processing | TaskState::Waiting | TaskState::NoWorker => {
                    let (_, cancelled) = self.state.record_released(&k);
                    for w in cancelled {
                        self.send_worker(&w, ToWorker::Release { key: k.clone() });
                    }
                    // This task will no longer consume its inputs.
                    let deps: Vec<TaskKey> =
                        self.state.dependencies[&k].iter().cloned().collect();
                    for p in deps {
                        if let Some(wd) = self.state.waiting_data.get_mut(&p) {
                            wd.remove(&k);
                        }
                        work.push(p);
                    }
                    tracing::debug!(key = %k, "Cancelled unneeded task");
                    self.maybe_forget(&k, &mut work);
                }
            }
        }
    }

    /// Drop the record of a released/erred task nothing references, and
    /// queue its dependencies for the same eligibility check.
    fn maybe_forget(&mut self, key: &str, work: &mut Vec<TaskKey>) {
        let forgettable = matches!(
            self.state.task_state(key),
            Some(TaskState::Released | TaskState::Erred)
        ) && self
            .state
            .dependents
            .get(key)
            .is_some_and(|d| d.is_empty())
            && !self.state.is_wanted(key);
        if !forgettable {
            return;
        }
        let deps: Vec<TaskKey> = self.state.dependencies[key].iter().cloned().collect();
        self.state.remove_task(key);
        tracing::debug!(key, "Forgot task");
        work.extend(deps);
    }

    /// Re-schedule a released task, walking released ancestors until a
    /// surviving replica or a leaf is found. Returns the erred dependencies
    /// encountered, which make the revived chain uncomputable until retried.
    pub(crate) fn revive(&mut self, key: &str) -> Vec<TaskKey> {
        let mut erred = Vec::new();
        let mut to_dispatch = Vec::new();
        let mut work: Vec<TaskKey> = vec![key.to_string()];
        let mut visited: HashSet<TaskKey> = HashSet::new();
        while let Some(k) = work.pop() {
            if !visited.insert(k.clone()) {
                continue;
            }
            if self.state.task_state(&k) != Some(TaskState::Released) {
                continue;
            }
            let deps: Vec<TaskKey> = self.state.dependencies[&k].iter().cloned().collect();
            let mut unmet: HashSet<TaskKey> = HashSet::new();
            for p in deps {
                self.state
                    .waiting_data
                    .get_mut(&p)
                    .expect("dependency of live task")
                    .insert(k.clone());
                match self.state.task_state(&p) {
                    Some(TaskState::Memory) => {}
                    Some(TaskState::Erred) => {
                        erred.push(p.clone());
                        unmet.insert(p);
                    }
                    _ => {
                        work.push(p.clone());
                        unmet.insert(p);
                    }
                }
            }
            let ready = unmet.is_empty();
            let task = self.state.tasks.get_mut(&k).expect("revive: unknown task");
            task.state = TaskState::Waiting;
            self.state.waiting.insert(k.clone(), unmet);
            if ready {
                to_dispatch.push(k);
            }
        }
        for k in to_dispatch {
            self.dispatch_ready(&k);
        }
        erred
    }

    /// All replicas of a memory task are gone but something still needs it:
    /// walk `dependencies*` back to surviving data and recompute. Consumers
    /// that were counting the key as satisfied start waiting on it again.
    pub(crate) fn recover_lost(&mut self, key: &str) {
        tracing::warn!(key, "All replicas lost, recomputing");
        let (_, cancelled) = self.state.record_released(key);
        for w in cancelled {
            self.send_worker(&w, ToWorker::Release { key: key.to_string() });
        }

        let dependents: Vec<TaskKey> = self.state.dependents[key].iter().cloned().collect();
        for d in dependents {
            match self.state.task_state(&d) {
                Some(TaskState::Waiting) => {
                    let task = self.state.tasks.get_mut(&d).expect("checked above");
                    task.queued = false;
                    task.stacked_on = None;
                    self.state
                        .waiting
                        .get_mut(&d)
                        .expect("waiting task has waiting entry")
                        .insert(key.to_string());
                }
                Some(TaskState::NoWorker) => {
                    self.state.unrunnable.remove(&d);
                    let task = self.state.tasks.get_mut(&d).expect("checked above");
                    task.state = TaskState::Waiting;
                    self.state
                        .waiting
                        .insert(d.clone(), HashSet::from([key.to_string()]));
                }
                // In-flight consumers will report missing-data themselves.
                _ => {}
            }
        }

        let erred = self.revive(key);
        if !erred.is_empty() {
            // The chain below is poisoned; the data cannot come back.
            let clients: Vec<String> = self.state.desired_by(key).cloned().collect();
            for c in clients {
                self.send_client(&c, ToClient::KeyLost { key: key.to_string() });
            }
        }
    }
}
