use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};

use crate::protocol::ToWorker;
use crate::scheduler::state::SchedulerState;
use crate::scheduler::task::{TaskKey, TaskState, WorkerAddr};
use crate::scheduler::Scheduler;

/// Where a newly-ready task goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Push onto this worker's stack (locality or restriction affinity).
    Stack(WorkerAddr),
    /// Append to the common ready deque, consumed by any free worker.
    Ready,
    /// No satisfying worker exists; park until one joins.
    Unrunnable,
}

/// Decides where a newly-ready task is queued. The choice is heuristic and
/// approximate by design; implementations must stay O(|dependencies| +
/// replicas) per decision.
pub trait PlacementPolicy: Send + Sync {
    fn decide(&self, state: &SchedulerState, key: &str) -> Placement;
}

/// Default policy: restricted tasks go to the least-loaded satisfying
/// worker; unrestricted tasks are scored by `occupancy + transfer_cost`
/// over the workers already holding a dependency plus the idle ones.
pub struct LocalityPolicy {
    /// Assumed network bandwidth in bytes per second.
    pub bandwidth: f64,
}

/// Estimated seconds to move the inputs of `key` that `worker` is missing.
pub fn transfer_cost(state: &SchedulerState, key: &str, worker: &str, bandwidth: f64) -> f64 {
    let Some(deps) = state.dependencies.get(key) else {
        return 0.0;
    };
    let mut bytes = 0u64;
    for dep in deps {
        if !state.who_has.get(dep).is_some_and(|ws| ws.contains(worker)) {
            bytes += state.tasks.get(dep).and_then(|t| t.nbytes).unwrap_or(0);
        }
    }
    bytes as f64 / bandwidth
}

impl PlacementPolicy for LocalityPolicy {
    fn decide(&self, state: &SchedulerState, key: &str) -> Placement {
        if state.workers.is_empty() {
            return Placement::Unrunnable;
        }
        let task = &state.tasks[key];

        if let Some(hosts) = &task.restrictions {
            let best = state
                .workers
                .values()
                .filter(|w| hosts.contains(&w.hostname))
                .min_by_key(|w| {
                    let load = state.processing.get(&w.address).map(|p| p.len()).unwrap_or(0);
                    (load, w.address.clone())
                });
            match best {
                Some(w) => return Placement::Stack(w.address.clone()),
                None if !task.loose_restrictions => return Placement::Unrunnable,
                // Loose restriction with no satisfying worker: fall back to
                // unrestricted placement.
                None => {}
            }
        }

        let deps = &state.dependencies[key];
        let mut candidates: Vec<&WorkerAddr> = Vec::new();
        for dep in deps {
            candidates.extend(state.replicas(dep));
        }
        candidates.extend(state.idle.iter());
        candidates.sort_unstable();
        candidates.dedup();
        if candidates.is_empty() {
            return Placement::Ready;
        }

        let best = candidates
            .into_iter()
            .min_by(|a, b| {
                let sa = state.occupancy(a) + transfer_cost(state, key, a, self.bandwidth);
                let sb = state.occupancy(b) + transfer_cost(state, key, b, self.bandwidth);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.cmp(b))
            })
            .expect("candidates is non-empty");

        let has_local_dep = deps
            .iter()
            .any(|d| state.who_has.get(d).is_some_and(|ws| ws.contains(best)));
        if has_local_dep {
            Placement::Stack(best.clone())
        } else {
            Placement::Ready
        }
    }
}

const STEAL_BUCKETS: usize = 12;
/// Buckets above this ratio are never stolen: moving the inputs would cost
/// more than recomputing elsewhere saves.
const MAX_STEALABLE_BUCKET: usize = 9;

/// Stealable stack entries bucketed by transfer-to-compute cost ratio.
/// Entries are validated lazily at pop time, so stale keys (dispatched,
/// cancelled or already stolen) cost one discarded pop each.
#[derive(Debug)]
pub struct StealBuckets {
    buckets: Vec<VecDeque<TaskKey>>,
}

impl Default for StealBuckets {
    fn default() -> Self {
        Self::new()
    }
}

impl StealBuckets {
    pub fn new() -> Self {
        Self {
            buckets: (0..STEAL_BUCKETS).map(|_| VecDeque::new()).collect(),
        }
    }

    fn bucket_for(ratio: f64) -> usize {
        if ratio <= 0.0 || !ratio.is_finite() {
            return 0;
        }
        ((ratio.log2() + 6.0).ceil().max(0.0) as usize).min(STEAL_BUCKETS - 1)
    }

    pub fn insert(&mut self, key: TaskKey, ratio: f64) {
        self.buckets[Self::bucket_for(ratio)].push_back(key);
    }

    /// Pop the cheapest-to-move candidate, if any bucket within the
    /// stealable range has one.
    pub fn pop(&mut self) -> Option<TaskKey> {
        self.buckets[..=MAX_STEALABLE_BUCKET]
            .iter_mut()
            .find_map(|b| b.pop_front())
    }

    /// Return a popped candidate that turned out unsuitable for the current
    /// thief but is still queued on its victim's stack.
    pub fn requeue(&mut self, key: TaskKey, ratio: f64) {
        self.buckets[Self::bucket_for(ratio)].push_front(key);
    }
}

impl Scheduler {
    /// Queue a task whose `waiting` set just became empty, per the placement
    /// policy, and nudge a worker if one can take it right away.
    pub(crate) fn dispatch_ready(&mut self, key: &str) {
        debug_assert_eq!(self.state.task_state(key), Some(TaskState::Waiting));
        match self.policy.decide(&self.state, key) {
            Placement::Stack(worker) => {
                let ratio = self.steal_ratio(key);
                let task = self.state.tasks.get_mut(key).expect("dispatch_ready: unknown task");
                task.queued = true;
                task.stacked_on = Some(worker.clone());
                let priority = task.priority;
                self.state
                    .stacks
                    .get_mut(&worker)
                    .expect("stack of live worker")
                    .push(Reverse((priority, key.to_string())));
                self.stealable.insert(key.to_string(), ratio);
                if self.state.free_slots(&worker) > 0 {
                    self.ensure_worker_occupied(&worker);
                }
            }
            Placement::Ready => {
                let task = self.state.tasks.get_mut(key).expect("dispatch_ready: unknown task");
                task.queued = true;
                task.stacked_on = None;
                self.state.ready.push_back(key.to_string());
                if let Some(worker) = self.state.idle.iter().min().cloned() {
                    self.ensure_worker_occupied(&worker);
                }
            }
            Placement::Unrunnable => {
                let task = self.state.tasks.get_mut(key).expect("dispatch_ready: unknown task");
                task.state = TaskState::NoWorker;
                task.queued = false;
                task.stacked_on = None;
                self.state.waiting.remove(key);
                self.state.unrunnable.insert(key.to_string());
                tracing::debug!(key, "No satisfying worker, task parked as unrunnable");
            }
        }
    }

    /// The worker-pull path: hand the worker tasks until its slots are full
    /// or nothing is left, then mark it idle. O(log stack) per handed task
    /// plus skipped stale queue entries.
    pub(crate) fn ensure_worker_occupied(&mut self, worker: &str) {
        if !self.state.workers.contains_key(worker) {
            return;
        }
        while self.state.free_slots(worker) > 0 {
            match self.next_task_for(worker) {
                Some(key) => self.transition_to_processing(&key, worker),
                None => {
                    self.state.idle.insert(worker.to_string());
                    break;
                }
            }
        }
    }

    /// Pop the worker's stack in priority order, then the common ready
    /// deque, skipping stale entries. A valid entry is a waiting task with
    /// no unmet dependencies still flagged as queued where we left it.
    fn next_task_for(&mut self, worker: &str) -> Option<TaskKey> {
        while let Some(Reverse((_, key))) = self
            .state
            .stacks
            .get_mut(worker)
            .and_then(|stack| stack.pop())
        {
            if self.queue_entry_valid(&key, Some(worker)) {
                return Some(key);
            }
        }
        while let Some(key) = self.state.ready.pop_front() {
            if self.queue_entry_valid(&key, None) {
                return Some(key);
            }
        }
        None
    }

    fn queue_entry_valid(&self, key: &str, stack_of: Option<&str>) -> bool {
        let Some(task) = self.state.tasks.get(key) else {
            return false;
        };
        let placed_ok = match stack_of {
            Some(w) => task.stacked_entry_valid(w),
            None => task.ready_entry_valid(),
        };
        placed_ok && self.state.waiting.get(key).is_some_and(|w| w.is_empty())
    }

    /// Assign a ready task to a worker and emit `compute-task`.
    pub(crate) fn transition_to_processing(&mut self, key: &str, worker: &str) {
        let cost = self
            .state
            .mean_duration(self.config.default_task_duration);
        self.state.record_processing(key, worker, cost);

        let task = &self.state.tasks[key];
        let mut who_has: HashMap<TaskKey, Vec<WorkerAddr>> = HashMap::new();
        for dep in &self.state.dependencies[key] {
            let mut ws: Vec<WorkerAddr> = self.state.replicas(dep).cloned().collect();
            ws.sort_unstable();
            who_has.insert(dep.clone(), ws);
        }
        let msg = ToWorker::ComputeTask {
            key: key.to_string(),
            payload: task.payload.clone(),
            who_has,
            priority: task.priority,
        };
        tracing::debug!(key, worker, "Task dispatched");
        self.send_worker(worker, msg);
    }

    fn steal_ratio(&self, key: &str) -> f64 {
        let compute = self
            .state
            .mean_duration(self.config.default_task_duration)
            .max(1e-9);
        let mut bytes = 0u64;
        for dep in self.state.dependencies.get(key).into_iter().flatten() {
            bytes += self.state.tasks.get(dep).and_then(|t| t.nbytes).unwrap_or(0);
        }
        (bytes as f64 / self.config.bandwidth_bytes_per_sec) / compute
    }

    /// Periodic work stealing: while some worker is idle and another has
    /// queued stack entries, move a cheap-to-move key to an idle worker.
    pub(crate) fn rebalance(&mut self) {
        let mut thieves: Vec<WorkerAddr> = self.state.idle.iter().cloned().collect();
        thieves.sort_unstable();
        for thief in thieves {
            if self.state.free_slots(&thief) == 0 {
                continue;
            }
            self.steal_for(&thief);
        }
    }

    fn steal_for(&mut self, thief: &str) {
        let hostname = match self.state.workers.get(thief) {
            Some(w) => w.hostname.clone(),
            None => return,
        };
        while let Some(key) = self.stealable.pop() {
            let Some(task) = self.state.tasks.get(&key) else {
                continue;
            };
            let victim = match &task.stacked_on {
                Some(v) if task.queued && task.state == TaskState::Waiting => v.clone(),
                _ => continue, // stale entry: dispatched, cancelled or moved
            };
            if victim == thief || !task.admits_host(&hostname) {
                // Valid entry, wrong thief. Put it back and stop rather
                // than spinning on the same candidate.
                let ratio = self.steal_ratio(&key);
                self.stealable.requeue(key, ratio);
                return;
            }
            let task = self.state.tasks.get_mut(&key).expect("checked above");
            task.stacked_on = Some(thief.to_string());
            let priority = task.priority;
            self.state
                .stacks
                .get_mut(thief)
                .expect("stack of live worker")
                .push(Reverse((priority, key.clone())));
            // The victim's stack entry goes stale and is skipped at pop time.
            let ratio = self.steal_ratio(&key);
            self.stealable.insert(key.clone(), ratio);
            tracing::debug!(key = %key, victim = %victim, thief, "Stole queued task");
            self.ensure_worker_occupied(thief);
            return;
        }
    }
}
