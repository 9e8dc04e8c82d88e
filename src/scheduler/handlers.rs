//! Stimulus handlers: one entry point per external message kind.
//!
//! Each handler is a function of (current state, message) that mutates the
//! store, applies the bounded set of transitions the stimulus entails and
//! appends outbound messages to the outbox. Handlers never block; all I/O
//! lives in the transport layer.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::protocol::{TaskSpec, ToClient, ToWorker};
use crate::scheduler::task::{Priority, TaskError, TaskKey, TaskState, WorkerAddr};
use crate::scheduler::Scheduler;

impl Scheduler {
    pub(crate) fn handle_update_graph(
        &mut self,
        client: String,
        mut tasks: HashMap<TaskKey, TaskSpec>,
        keys: Vec<TaskKey>,
    ) {
        self.state.add_client(client.clone());

        // Resubmitting known keys is idempotent: existing records win.
        let mut new_keys: Vec<TaskKey> = tasks
            .keys()
            .filter(|k| !self.state.tasks.contains_key(*k))
            .cloned()
            .collect();
        new_keys.sort_unstable();
        let new_set: HashSet<TaskKey> = new_keys.iter().cloned().collect();

        for k in &new_keys {
            for dep in &tasks[k].dependencies {
                if !self.state.tasks.contains_key(dep) && !new_set.contains(dep) {
                    self.reject_graph(&client, &keys, format!("unknown dependency {dep} of {k}"));
                    return;
                }
            }
        }

        // Topological order over the submitted subgraph; doubles as the
        // cycle check and as the intra-submission priority order.
        let mut indegree: HashMap<TaskKey, usize> = HashMap::new();
        let mut local_dependents: HashMap<TaskKey, Vec<TaskKey>> = HashMap::new();
        for k in &new_keys {
            let deg = tasks[k]
                .dependencies
                .iter()
                .filter(|d| new_set.contains(*d))
                .count();
            indegree.insert(k.clone(), deg);
            for dep in &tasks[k].dependencies {
                if new_set.contains(dep) {
                    local_dependents.entry(dep.clone()).or_default().push(k.clone());
                }
            }
        }
        let mut queue: VecDeque<TaskKey> = new_keys
            .iter()
            .filter(|k| indegree[*k] == 0)
            .cloned()
            .collect();
        let mut order: Vec<TaskKey> = Vec::with_capacity(new_keys.len());
        while let Some(k) = queue.pop_front() {
            order.push(k.clone());
            for d in local_dependents.get(&k).into_iter().flatten() {
                let deg = indegree.get_mut(d).expect("local dependent is a new key");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(d.clone());
                }
            }
        }
        if order.len() != new_keys.len() {
            self.reject_graph(&client, &keys, "cycle detected in submitted graph".to_string());
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        for (i, k) in order.iter().enumerate() {
            let spec = tasks.remove(k).expect("ordered key came from the submission");
            let deps: HashSet<TaskKey> = spec.dependencies.into_iter().collect();
            self.state.add_task(
                k.clone(),
                spec.payload,
                deps,
                Priority::new(spec.priority, generation, i as u64),
                spec.restrictions,
                spec.loose_restrictions,
            );
        }
        tracing::info!(
            client = %client,
            new_tasks = order.len(),
            wanted = keys.len(),
            "Graph updated"
        );

        // Dependencies that exist only as released records must be
        // recomputed; requested keys that were released likewise.
        let mut erred_roots: Vec<TaskKey> = Vec::new();
        for k in &order {
            let deps: Vec<TaskKey> = self.state.dependencies[k].iter().cloned().collect();
            for dep in deps {
                match self.state.task_state(&dep) {
                    Some(TaskState::Released) => erred_roots.extend(self.revive(&dep)),
                    Some(TaskState::Erred) => {
                        if let Some(root) = self.state.exceptions_blame.get(&dep) {
                            erred_roots.push(root.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        for key in &keys {
            if self.state.task_state(key) == Some(TaskState::Released) {
                erred_roots.extend(self.revive(key));
            }
        }

        // Queue the newly-ready tasks. Smallest priority tuple goes first:
        // priority orders contested slots, it never preempts.
        let mut ready_now: Vec<TaskKey> = order
            .iter()
            .filter(|k| {
                let task = &self.state.tasks[*k];
                task.state == TaskState::Waiting
                    && !task.queued
                    && self.state.waiting.get(*k).is_some_and(|w| w.is_empty())
            })
            .cloned()
            .collect();
        ready_now.sort_by_key(|k| self.state.tasks[k].priority);
        for k in &ready_now {
            self.dispatch_ready(k);
        }

        // Attachments to erred keys inherit the blame before the wants are
        // registered, so nobody is notified twice. Intermediate erred keys
        // resolve to their original root.
        let mut erred_roots: Vec<TaskKey> = erred_roots
            .into_iter()
            .map(|r| self.state.exceptions_blame.get(&r).cloned().unwrap_or(r))
            .collect();
        erred_roots.sort_unstable();
        erred_roots.dedup();
        for root in erred_roots {
            self.transition_to_erred(&root, None);
        }

        for key in &keys {
            if self.state.tasks.contains_key(key) {
                self.state.record_wants(&client, key);
            } else {
                self.send_client(
                    &client,
                    ToClient::KeyErred {
                        key: key.clone(),
                        blame: key.clone(),
                        exception: format!("unknown key {key}"),
                        traceback: String::new(),
                    },
                );
            }
        }

        // Requested keys that are already settled get answered right away.
        for key in &keys {
            match self.state.task_state(key) {
                Some(TaskState::Memory) => {
                    let nbytes = self.state.tasks[key].nbytes.unwrap_or(0);
                    self.send_client(
                        &client,
                        ToClient::KeyDone {
                            key: key.clone(),
                            nbytes,
                        },
                    );
                }
                Some(TaskState::Erred) => {
                    let blame = self.state.exceptions_blame[key].clone();
                    let err = self.state.exceptions.get(&blame).cloned().unwrap_or(TaskError {
                        exception: format!("task {blame} erred"),
                        traceback: String::new(),
                    });
                    self.send_client(
                        &client,
                        ToClient::KeyErred {
                            key: key.clone(),
                            blame,
                            exception: err.exception,
                            traceback: err.traceback,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    fn reject_graph(&mut self, client: &str, keys: &[TaskKey], reason: String) {
        tracing::warn!(client, reason = %reason, "Rejected update-graph");
        for key in keys {
            self.send_client(
                client,
                ToClient::KeyErred {
                    key: key.clone(),
                    blame: key.clone(),
                    exception: reason.clone(),
                    traceback: String::new(),
                },
            );
        }
    }

    pub(crate) fn handle_task_finished(
        &mut self,
        worker: WorkerAddr,
        key: TaskKey,
        nbytes: u64,
        duration: Option<f64>,
    ) {
        if !self.state.workers.contains_key(&worker) {
            tracing::debug!(worker = %worker, key = %key, "Finish from unknown worker ignored");
            return;
        }
        match self.state.task_state(&key) {
            Some(TaskState::Processing) => {
                let assigned = self
                    .state
                    .rprocessing
                    .get(&key)
                    .is_some_and(|ws| ws.contains(&worker));
                if assigned {
                    tracing::debug!(key = %key, worker = %worker, nbytes, "Task finished");
                    self.transition_to_memory(&key, &worker, nbytes, duration);
                } else {
                    // A worker we never assigned; drop the stray copy.
                    self.send_worker(&worker, ToWorker::Release { key });
                }
            }
            Some(TaskState::Memory) => {
                self.state.add_replica(&key, &worker);
            }
            Some(TaskState::Waiting) | Some(TaskState::NoWorker) => {
                // Unsolicited but usable, e.g. a worker that recovered after
                // its task was returned to waiting.
                self.transition_to_memory(&key, &worker, nbytes, duration);
            }
            // Late finish after cancellation: ignore the result.
            Some(TaskState::Released) | Some(TaskState::Erred) | None => {
                self.send_worker(&worker, ToWorker::Release { key });
            }
        }
    }

    pub(crate) fn handle_task_failed(
        &mut self,
        worker: WorkerAddr,
        key: TaskKey,
        exception: String,
        traceback: String,
    ) {
        let assigned = self.state.task_state(&key) == Some(TaskState::Processing)
            && self
                .state
                .rprocessing
                .get(&key)
                .is_some_and(|ws| ws.contains(&worker));
        if !assigned {
            tracing::debug!(key = %key, worker = %worker, "Stale task-failed ignored");
            return;
        }
        tracing::info!(key = %key, worker = %worker, "Task failed");
        self.transition_to_erred(
            &key,
            Some(TaskError {
                exception,
                traceback,
            }),
        );
        self.ensure_worker_occupied(&worker);
    }

    pub(crate) fn handle_add_worker(&mut self, address: WorkerAddr, hostname: String, ncores: u32) {
        if self.state.workers.contains_key(&address) {
            self.state.worker_heartbeat(&address, HashMap::new());
            return;
        }
        tracing::info!(address = %address, hostname = %hostname, ncores, "Worker joined");
        self.state.add_worker(address.clone(), hostname.clone(), ncores);

        // Tasks parked for want of a satisfying worker get another chance.
        let candidates: Vec<TaskKey> = self
            .state
            .unrunnable
            .iter()
            .filter(|k| {
                let t = &self.state.tasks[*k];
                t.admits_host(&hostname) || t.loose_restrictions
            })
            .cloned()
            .collect();
        for k in candidates {
            self.state.unrunnable.remove(&k);
            let unmet: HashSet<TaskKey> = self.state.dependencies[&k]
                .iter()
                .filter(|d| self.state.tasks[*d].state != TaskState::Memory)
                .cloned()
                .collect();
            let ready = unmet.is_empty();
            self.state
                .tasks
                .get_mut(&k)
                .expect("unrunnable key is a live task")
                .state = TaskState::Waiting;
            self.state.waiting.insert(k.clone(), unmet);
            if ready {
                self.dispatch_ready(&k);
            }
        }
        self.ensure_worker_occupied(&address);
    }

    pub(crate) fn handle_heartbeat(&mut self, worker: WorkerAddr, metrics: HashMap<String, f64>) {
        if !self.state.worker_heartbeat(&worker, metrics) {
            tracing::warn!(worker = %worker, "Heartbeat from unknown worker");
        }
    }

    pub(crate) fn handle_add_keys(&mut self, worker: WorkerAddr, keys: Vec<TaskKey>) {
        for key in keys {
            match self.state.task_state(&key) {
                Some(TaskState::Memory) => {
                    self.state.add_replica(&key, &worker);
                }
                Some(TaskState::Waiting)
                | Some(TaskState::NoWorker)
                | Some(TaskState::Processing) => {}
                // The scheduler no longer tracks this data; the worker
                // should not keep it.
                Some(TaskState::Released) | Some(TaskState::Erred) | None => {
                    self.send_worker(&worker, ToWorker::Release { key });
                }
            }
        }
    }

    pub(crate) fn handle_missing_data(&mut self, worker: WorkerAddr, keys: Vec<TaskKey>) {
        for key in keys {
            tracing::warn!(worker = %worker, key = %key, "Worker reported data missing");
            let lost_last = self.state.remove_replica(&key, &worker);
            if lost_last && self.state.task_state(&key) == Some(TaskState::Memory) {
                if self.state.is_wanted(&key) || self.state.has_pending_consumers(&key) {
                    self.recover_lost(&key);
                } else {
                    self.state.record_released(&key);
                    self.release_if_unneeded(&key);
                }
            }
            // Tasks this worker was computing against the missing input
            // cannot proceed; take them back.
            let stuck: Vec<TaskKey> = self
                .state
                .dependents
                .get(&key)
                .into_iter()
                .flatten()
                .filter(|d| {
                    self.state.task_state(d) == Some(TaskState::Processing)
                        && self
                            .state
                            .rprocessing
                            .get(*d)
                            .is_some_and(|ws| ws.contains(&worker))
                })
                .cloned()
                .collect();
            for d in stuck {
                self.return_to_waiting(&d);
            }
        }
    }

    pub(crate) fn handle_client_releases_keys(&mut self, client: String, keys: Vec<TaskKey>) {
        for key in keys {
            if self.state.drop_wants(&client, &key) {
                self.release_if_unneeded(&key);
            }
        }
    }

    pub(crate) fn handle_add_client(&mut self, client: String) {
        self.state.add_client(client);
    }

    pub(crate) fn handle_remove_client(&mut self, client: String) {
        tracing::info!(client = %client, "Client removed");
        for key in self.state.remove_client(&client) {
            self.release_if_unneeded(&key);
        }
    }

    pub(crate) fn handle_gather(&mut self, client: String, keys: Vec<TaskKey>) {
        let mut who_has: HashMap<TaskKey, Vec<WorkerAddr>> = HashMap::new();
        let mut missing: Vec<TaskKey> = Vec::new();
        for key in keys {
            if self.state.task_state(&key) == Some(TaskState::Memory) {
                let mut ws: Vec<WorkerAddr> = self.state.replicas(&key).cloned().collect();
                ws.sort_unstable();
                who_has.insert(key, ws);
            } else {
                missing.push(key);
            }
        }
        self.send_client(&client, ToClient::GatherReply { who_has, missing });
    }

    /// Clear an erred key (and everything blamed on the same root) and
    /// reschedule it.
    pub(crate) fn handle_retry_key(&mut self, client: String, key: TaskKey) {
        if !self.state.tasks.contains_key(&key) {
            return;
        }
        let root = self
            .state
            .exceptions_blame
            .get(&key)
            .cloned()
            .unwrap_or_else(|| key.clone());

        // Everything blamed on this root is cleared together, so the whole
        // failed region becomes schedulable again.
        let mut cleared: Vec<TaskKey> = Vec::new();
        let mut queue: VecDeque<TaskKey> = VecDeque::from([root.clone()]);
        let mut seen: HashSet<TaskKey> = HashSet::from([root.clone()]);
        while let Some(k) = queue.pop_front() {
            let blamed_here = self.state.task_state(&k) == Some(TaskState::Erred)
                && self.state.exceptions_blame.get(&k) == Some(&root);
            if blamed_here {
                self.state.exceptions.remove(&k);
                self.state.exceptions_blame.remove(&k);
                self.state.record_released(&k);
                let task = self.state.tasks.get_mut(&k).expect("cleared task exists");
                task.suspicion = 0;
                cleared.push(k.clone());
            }
            for d in self.state.dependents.get(&k).into_iter().flatten() {
                if seen.insert(d.clone()) {
                    queue.push_back(d.clone());
                }
            }
        }
        if cleared.is_empty() {
            return;
        }
        tracing::info!(key = %key, root = %root, cleared = cleared.len(), "Retrying erred key");

        self.state.record_wants(&client, &key);
        let mut erred_roots = self.revive(&key);
        for other in cleared {
            if other != key && self.state.is_wanted(&other) {
                erred_roots.extend(self.revive(&other));
            }
        }
        let mut erred_roots: Vec<TaskKey> = erred_roots
            .into_iter()
            .map(|r| self.state.exceptions_blame.get(&r).cloned().unwrap_or(r))
            .collect();
        erred_roots.sort_unstable();
        erred_roots.dedup();
        for r in erred_roots {
            self.transition_to_erred(&r, None);
        }
    }
}
