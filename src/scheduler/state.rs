use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::scheduler::task::{ClientId, Priority, Task, TaskError, TaskKey, TaskState, WorkerAddr};

/// Everything the scheduler knows about one worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub address: WorkerAddr,
    pub hostname: String,
    pub ncores: u32,
    pub last_heartbeat: Instant,
    pub joined_at: DateTime<Utc>,
    pub metrics: HashMap<String, f64>,
}

impl WorkerInfo {
    pub fn new(address: WorkerAddr, hostname: String, ncores: u32) -> Self {
        Self {
            address,
            hostname,
            ncores,
            last_heartbeat: Instant::now(),
            joined_at: Utc::now(),
            metrics: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub connected_at: DateTime<Utc>,
}

/// A worker's queue of locality-affine ready tasks. Min-heap on the
/// priority tuple: the most urgent entry pops first.
pub type WorkerStack = BinaryHeap<Reverse<(Priority, TaskKey)>>;

/// Index entries removed for a departed worker, handed to the failure
/// manager for reconciliation.
#[derive(Debug, Default)]
pub struct WorkerRemoval {
    /// Tasks the worker was computing, with their expected cost.
    pub processing: Vec<(TaskKey, f64)>,
    /// Result keys the worker held in memory.
    pub held: Vec<TaskKey>,
    /// Stack entries that were queued for the worker.
    pub stacked: Vec<TaskKey>,
}

/// The in-memory state store. Every relationship is kept in both directions
/// so any lookup is constant-time; transitioning one task touches only its
/// graph neighborhood, never the whole graph.
///
/// The store is not thread-safe on its own: it is mutated only from within
/// stimulus handlers, which run serially under the scheduler's single
/// logical lock.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub tasks: HashMap<TaskKey, Task>,

    // Static DAG edges, mutual transposes.
    pub dependencies: HashMap<TaskKey, HashSet<TaskKey>>,
    pub dependents: HashMap<TaskKey, HashSet<TaskKey>>,

    /// For each task in state `waiting`: the dependencies not yet in memory.
    pub waiting: HashMap<TaskKey, HashSet<TaskKey>>,
    /// For each task: the unfinished dependents that will still consume its
    /// result. A memory task with an empty entry and no interested client is
    /// eligible for release.
    pub waiting_data: HashMap<TaskKey, HashSet<TaskKey>>,

    // Data residency, mutual transposes.
    pub who_has: HashMap<TaskKey, HashSet<WorkerAddr>>,
    pub has_what: HashMap<WorkerAddr, HashSet<TaskKey>>,

    // In-flight assignments, mutual transposes. The per-worker map carries
    // the expected cost in seconds used for occupancy estimates.
    pub processing: HashMap<WorkerAddr, HashMap<TaskKey, f64>>,
    pub rprocessing: HashMap<TaskKey, HashSet<WorkerAddr>>,

    // Client interest, mutual transposes.
    pub who_wants: HashMap<TaskKey, HashSet<ClientId>>,
    pub wants_what: HashMap<ClientId, HashSet<TaskKey>>,

    /// Tasks whose restrictions no current worker satisfies.
    pub unrunnable: HashSet<TaskKey>,

    pub exceptions: HashMap<TaskKey, TaskError>,
    /// For each erred task, the original erred key held responsible.
    pub exceptions_blame: HashMap<TaskKey, TaskKey>,

    pub workers: HashMap<WorkerAddr, WorkerInfo>,
    pub clients: HashMap<ClientId, ClientInfo>,

    /// Ready tasks with no locality affinity, consumed by any free worker.
    pub ready: VecDeque<TaskKey>,
    /// Per-worker stacks of locality-affine ready tasks. A contested slot
    /// goes to the smallest priority tuple, so entries pop in priority
    /// order.
    pub stacks: HashMap<WorkerAddr, WorkerStack>,
    /// Workers with free slots and nothing to run.
    pub idle: HashSet<WorkerAddr>,

    total_duration: f64,
    duration_samples: u64,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- tasks ----------------------------------------------------------

    /// Insert a new task with its dependency edges. All dependencies must
    /// already be known. Returns true if the task has no unmet dependencies.
    pub fn add_task(
        &mut self,
        key: TaskKey,
        payload: Vec<u8>,
        deps: HashSet<TaskKey>,
        priority: Priority,
        restrictions: Option<HashSet<String>>,
        loose_restrictions: bool,
    ) -> bool {
        debug_assert!(!self.tasks.contains_key(&key));
        let mut waiting = HashSet::new();
        for dep in &deps {
            self.dependents
                .get_mut(dep)
                .unwrap_or_else(|| panic!("unknown dependency {dep}"))
                .insert(key.clone());
            self.waiting_data
                .get_mut(dep)
                .unwrap_or_else(|| panic!("unknown dependency {dep}"))
                .insert(key.clone());
            if self.tasks[dep].state != TaskState::Memory {
                waiting.insert(dep.clone());
            }
        }
        let ready = waiting.is_empty();
        self.dependencies.insert(key.clone(), deps);
        self.dependents.entry(key.clone()).or_default();
        self.waiting_data.entry(key.clone()).or_default();
        self.waiting.insert(key.clone(), waiting);
        self.tasks.insert(
            key.clone(),
            Task::new(key, payload, priority, restrictions, loose_restrictions),
        );
        ready
    }

    /// Drop a task record entirely. Only legal once the task is released or
    /// erred, nothing depends on it, and no client wants it.
    pub fn remove_task(&mut self, key: &str) {
        let task = match self.tasks.get(key) {
            Some(t) => t,
            None => return,
        };
        debug_assert!(matches!(
            task.state,
            TaskState::Released | TaskState::Erred
        ));
        debug_assert!(self.dependents.get(key).map_or(true, |d| d.is_empty()));
        debug_assert!(!self.who_wants.contains_key(key));

        for dep in self.dependencies.remove(key).unwrap_or_default() {
            if let Some(deps) = self.dependents.get_mut(&dep) {
                deps.remove(key);
            }
            if let Some(wd) = self.waiting_data.get_mut(&dep) {
                wd.remove(key);
            }
        }
        self.dependents.remove(key);
        self.waiting.remove(key);
        self.waiting_data.remove(key);
        self.unrunnable.remove(key);
        self.exceptions.remove(key);
        self.exceptions_blame.remove(key);
        self.tasks.remove(key);
    }

    // ---- per-task state records -----------------------------------------

    /// Move a task into `processing` on the given worker.
    pub fn record_processing(&mut self, key: &str, worker: &str, cost: f64) {
        let task = self.tasks.get_mut(key).expect("record_processing: unknown task");
        debug_assert_eq!(task.state, TaskState::Waiting);
        task.state = TaskState::Processing;
        task.queued = false;
        task.stacked_on = None;
        self.waiting.remove(key);
        self.processing
            .get_mut(worker)
            .expect("record_processing: unknown worker")
            .insert(key.to_string(), cost);
        self.rprocessing
            .entry(key.to_string())
            .or_default()
            .insert(worker.to_string());
        self.idle.remove(worker);
    }

    /// Move a task into `memory` on the given worker. Returns the workers
    /// whose in-flight assignment of the task became redundant.
    pub fn record_memory(&mut self, key: &str, worker: &str, nbytes: u64) -> Vec<WorkerAddr> {
        let task = self.tasks.get_mut(key).expect("record_memory: unknown task");
        task.state = TaskState::Memory;
        task.nbytes = Some(nbytes);
        task.queued = false;
        task.stacked_on = None;
        self.waiting.remove(key);
        self.unrunnable.remove(key);

        let mut redundant = Vec::new();
        for w in self.rprocessing.remove(key).unwrap_or_default() {
            if let Some(p) = self.processing.get_mut(&w) {
                p.remove(key);
            }
            if w != worker {
                redundant.push(w);
            }
        }
        self.who_has
            .entry(key.to_string())
            .or_default()
            .insert(worker.to_string());
        self.has_what
            .get_mut(worker)
            .expect("record_memory: unknown worker")
            .insert(key.to_string());
        redundant
    }

    /// Move a task into `released`, clearing its replicas, queue flags and
    /// in-flight assignments. Returns (workers to ask to drop the data,
    /// workers whose in-flight assignment is cancelled).
    pub fn record_released(&mut self, key: &str) -> (Vec<WorkerAddr>, Vec<WorkerAddr>) {
        let task = self.tasks.get_mut(key).expect("record_released: unknown task");
        task.state = TaskState::Released;
        task.nbytes = None;
        task.queued = false;
        task.stacked_on = None;
        self.waiting.remove(key);
        self.unrunnable.remove(key);

        let mut holders = Vec::new();
        for w in self.who_has.remove(key).unwrap_or_default() {
            if let Some(h) = self.has_what.get_mut(&w) {
                h.remove(key);
            }
            holders.push(w);
        }
        let mut cancelled = Vec::new();
        for w in self.rprocessing.remove(key).unwrap_or_default() {
            if let Some(p) = self.processing.get_mut(&w) {
                p.remove(key);
            }
            cancelled.push(w);
        }
        (holders, cancelled)
    }

    /// Move a task into `erred`. Clears queues and assignments like a
    /// release; the blame pointer is recorded by the caller.
    pub fn record_erred(&mut self, key: &str) -> (Vec<WorkerAddr>, Vec<WorkerAddr>) {
        let (holders, cancelled) = self.record_released(key);
        let task = self.tasks.get_mut(key).expect("record_erred: unknown task");
        task.state = TaskState::Erred;
        (holders, cancelled)
    }

    // ---- workers --------------------------------------------------------

    pub fn add_worker(&mut self, address: WorkerAddr, hostname: String, ncores: u32) {
        self.has_what.entry(address.clone()).or_default();
        self.processing.entry(address.clone()).or_default();
        self.stacks.entry(address.clone()).or_default();
        self.idle.insert(address.clone());
        self.workers
            .insert(address.clone(), WorkerInfo::new(address, hostname, ncores));
    }

    /// Remove all traces of a worker, returning what it was doing and
    /// holding so the failure manager can reconcile task states.
    pub fn remove_worker(&mut self, address: &str) -> Option<WorkerRemoval> {
        self.workers.remove(address)?;
        self.idle.remove(address);

        let mut removal = WorkerRemoval::default();
        for (key, cost) in self.processing.remove(address).unwrap_or_default() {
            if let Some(ws) = self.rprocessing.get_mut(&key) {
                ws.remove(address);
                if ws.is_empty() {
                    self.rprocessing.remove(&key);
                }
            }
            removal.processing.push((key, cost));
        }
        for key in self.has_what.remove(address).unwrap_or_default() {
            if let Some(ws) = self.who_has.get_mut(&key) {
                ws.remove(address);
                if ws.is_empty() {
                    self.who_has.remove(&key);
                }
            }
            removal.held.push(key);
        }
        for Reverse((_, key)) in self.stacks.remove(address).unwrap_or_default() {
            if let Some(task) = self.tasks.get_mut(&key) {
                if task.stacked_on.as_deref() == Some(address) {
                    task.stacked_on = None;
                    task.queued = false;
                    removal.stacked.push(key);
                }
            }
        }
        Some(removal)
    }

    /// Record a heartbeat. Returns false for unknown workers.
    pub fn worker_heartbeat(&mut self, address: &str, metrics: HashMap<String, f64>) -> bool {
        match self.workers.get_mut(address) {
            Some(w) => {
                w.last_heartbeat = Instant::now();
                w.metrics = metrics;
                true
            }
            None => false,
        }
    }

    pub fn free_slots(&self, worker: &str) -> u32 {
        let Some(info) = self.workers.get(worker) else {
            return 0;
        };
        let busy = self.processing.get(worker).map(|p| p.len()).unwrap_or(0) as u32;
        info.ncores.saturating_sub(busy)
    }

    /// Sum of expected costs of the worker's in-flight tasks.
    pub fn occupancy(&self, worker: &str) -> f64 {
        self.processing
            .get(worker)
            .map(|p| p.values().sum())
            .unwrap_or(0.0)
    }

    // ---- clients --------------------------------------------------------

    pub fn add_client(&mut self, id: ClientId) {
        self.wants_what.entry(id.clone()).or_default();
        self.clients.entry(id.clone()).or_insert_with(|| ClientInfo {
            id,
            connected_at: Utc::now(),
        });
    }

    /// Remove a client, returning the keys it wanted.
    pub fn remove_client(&mut self, id: &str) -> Vec<TaskKey> {
        self.clients.remove(id);
        let keys: Vec<TaskKey> = self
            .wants_what
            .remove(id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for key in &keys {
            if let Some(cs) = self.who_wants.get_mut(key) {
                cs.remove(id);
                if cs.is_empty() {
                    self.who_wants.remove(key);
                }
            }
        }
        keys
    }

    pub fn record_wants(&mut self, client: &str, key: &str) {
        self.who_wants
            .entry(key.to_string())
            .or_default()
            .insert(client.to_string());
        self.wants_what
            .entry(client.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Drop one client's interest in one key. Returns true if no client
    /// wants the key anymore.
    pub fn drop_wants(&mut self, client: &str, key: &str) -> bool {
        if let Some(ks) = self.wants_what.get_mut(client) {
            ks.remove(key);
        }
        match self.who_wants.get_mut(key) {
            Some(cs) => {
                cs.remove(client);
                if cs.is_empty() {
                    self.who_wants.remove(key);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    /// Record an extra replica of a memory task. No-op unless the task is
    /// in memory and the worker is known.
    pub fn add_replica(&mut self, key: &str, worker: &str) -> bool {
        if self.task_state(key) != Some(TaskState::Memory) || !self.workers.contains_key(worker) {
            return false;
        }
        self.who_has
            .entry(key.to_string())
            .or_default()
            .insert(worker.to_string());
        self.has_what
            .get_mut(worker)
            .expect("known worker has has_what entry")
            .insert(key.to_string());
        true
    }

    /// Drop one replica. Returns true if the task now has no replicas left.
    pub fn remove_replica(&mut self, key: &str, worker: &str) -> bool {
        if let Some(h) = self.has_what.get_mut(worker) {
            h.remove(key);
        }
        match self.who_has.get_mut(key) {
            Some(ws) => {
                ws.remove(worker);
                if ws.is_empty() {
                    self.who_has.remove(key);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    // ---- queries --------------------------------------------------------

    pub fn desired_by(&self, key: &str) -> impl Iterator<Item = &ClientId> {
        self.who_wants.get(key).into_iter().flatten()
    }

    pub fn replicas(&self, key: &str) -> impl Iterator<Item = &WorkerAddr> {
        self.who_has.get(key).into_iter().flatten()
    }

    pub fn task_state(&self, key: &str) -> Option<TaskState> {
        self.tasks.get(key).map(|t| t.state)
    }

    pub fn is_wanted(&self, key: &str) -> bool {
        self.who_wants.get(key).is_some_and(|c| !c.is_empty())
    }

    /// An unfinished dependent will still consume this task's result.
    pub fn has_pending_consumers(&self, key: &str) -> bool {
        self.waiting_data.get(key).is_some_and(|d| !d.is_empty())
    }

    // ---- duration estimates ---------------------------------------------

    pub fn observe_duration(&mut self, seconds: f64) {
        if seconds.is_finite() && seconds >= 0.0 {
            self.total_duration += seconds;
            self.duration_samples += 1;
        }
    }

    /// Running average of observed compute times, used as the expected cost
    /// of a dispatch.
    pub fn mean_duration(&self, default: f64) -> f64 {
        if self.duration_samples == 0 {
            default
        } else {
            self.total_duration / self.duration_samples as f64
        }
    }

    // ---- invariants -----------------------------------------------------

    /// Full consistency check over all redundant indices. O(graph); used in
    /// debug builds and tests after every stimulus, never in release paths.
    pub fn validate(&self) -> crate::error::Result<()> {
        self.check()
            .map_err(crate::error::SchedulerError::InvariantViolation)
    }

    fn check(&self) -> Result<(), String> {
        fn transposed(
            fwd: &HashMap<String, HashSet<String>>,
            rev: &HashMap<String, HashSet<String>>,
            name: &str,
        ) -> Result<(), String> {
            for (a, bs) in fwd {
                for b in bs {
                    if !rev.get(b).is_some_and(|s| s.contains(a)) {
                        return Err(format!("{name}: {a} -> {b} missing reverse entry"));
                    }
                }
            }
            Ok(())
        }

        transposed(&self.dependencies, &self.dependents, "dependencies/dependents")?;
        transposed(&self.dependents, &self.dependencies, "dependents/dependencies")?;
        transposed(&self.who_has, &self.has_what, "who_has/has_what")?;
        transposed(&self.has_what, &self.who_has, "has_what/who_has")?;
        transposed(&self.who_wants, &self.wants_what, "who_wants/wants_what")?;
        transposed(&self.wants_what, &self.who_wants, "wants_what/who_wants")?;
        for (w, keys) in &self.processing {
            for key in keys.keys() {
                if !self.rprocessing.get(key).is_some_and(|s| s.contains(w)) {
                    return Err(format!("processing: {w} -> {key} missing rprocessing"));
                }
            }
        }
        for (key, ws) in &self.rprocessing {
            if ws.is_empty() {
                return Err(format!("rprocessing[{key}] is empty"));
            }
            for w in ws {
                if !self.processing.get(w).is_some_and(|p| p.contains_key(key)) {
                    return Err(format!("rprocessing: {key} -> {w} missing processing"));
                }
            }
        }

        for (key, task) in &self.tasks {
            match task.state {
                TaskState::Waiting => {
                    let Some(waiting) = self.waiting.get(key) else {
                        return Err(format!("waiting task {key} has no waiting entry"));
                    };
                    let unmet: HashSet<_> = self.dependencies[key]
                        .iter()
                        .filter(|d| self.tasks[*d].state != TaskState::Memory)
                        .cloned()
                        .collect();
                    if *waiting != unmet {
                        return Err(format!(
                            "waiting[{key}] = {waiting:?} but unmet dependencies are {unmet:?}"
                        ));
                    }
                }
                TaskState::Memory => {
                    if !self.who_has.get(key).is_some_and(|w| !w.is_empty()) {
                        return Err(format!("memory task {key} has no replicas"));
                    }
                }
                TaskState::Processing => {
                    if !self.rprocessing.get(key).is_some_and(|w| !w.is_empty()) {
                        return Err(format!("processing task {key} has no assignment"));
                    }
                }
                TaskState::NoWorker => {
                    if !self.unrunnable.contains(key) {
                        return Err(format!("no-worker task {key} not in unrunnable"));
                    }
                }
                TaskState::Erred => {
                    if !self.exceptions_blame.contains_key(key) {
                        return Err(format!("erred task {key} has no blame entry"));
                    }
                }
                TaskState::Released => {}
            }
            if task.state != TaskState::Memory && self.who_has.contains_key(key) {
                return Err(format!("non-memory task {key} has replicas"));
            }
            if task.state != TaskState::Processing && self.rprocessing.contains_key(key) {
                return Err(format!("non-processing task {key} has assignments"));
            }
        }

        // Acyclicity: Kahn's algorithm over the whole graph.
        let mut indegree: HashMap<&str, usize> = self
            .tasks
            .keys()
            .map(|k| (k.as_str(), self.dependencies[k].len()))
            .collect();
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut seen = 0usize;
        while let Some(k) = queue.pop_front() {
            seen += 1;
            for d in &self.dependents[k] {
                let slot = indegree.get_mut(d.as_str()).unwrap();
                *slot -= 1;
                if *slot == 0 {
                    queue.push_back(d.as_str());
                }
            }
        }
        if seen != self.tasks.len() {
            return Err("task graph contains a cycle".to_string());
        }
        Ok(())
    }
}
