use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable, content-derived task identifier (e.g. "inc-ab31c010").
pub type TaskKey = String;
/// Network address of a worker, e.g. "10.0.0.5:9000".
pub type WorkerAddr = String;
/// Opaque client identifier.
pub type ClientId = String;

/// Scheduling priority. Lexicographically smallest wins a contested slot;
/// priority orders dispatch but never preempts running work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority {
    /// Client-assigned priority for the submission (smaller is sooner).
    pub user: i64,
    /// Submission generation, incremented per update-graph.
    pub generation: u64,
    /// Topological order within the submission.
    pub order: u64,
}

impl Priority {
    pub fn new(user: i64, generation: u64, order: u64) -> Self {
        Self {
            user,
            generation,
            order,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Released,
    Waiting,
    NoWorker,
    Processing,
    Memory,
    Erred,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Released => write!(f, "released"),
            TaskState::Waiting => write!(f, "waiting"),
            TaskState::NoWorker => write!(f, "no-worker"),
            TaskState::Processing => write!(f, "processing"),
            TaskState::Memory => write!(f, "memory"),
            TaskState::Erred => write!(f, "erred"),
        }
    }
}

/// Exception reported for a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub exception: String,
    pub traceback: String,
}

/// A unit of computation tracked by the scheduler. The payload (serialized
/// function and arguments) is opaque; the scheduler only transports it and
/// tracks the size of the result.
#[derive(Debug, Clone)]
pub struct Task {
    pub key: TaskKey,
    pub payload: Vec<u8>,
    pub state: TaskState,
    pub priority: Priority,
    /// Acceptable hostnames, if the task is restricted.
    pub restrictions: Option<HashSet<String>>,
    /// Permit violating restrictions when they are unsatisfiable.
    pub loose_restrictions: bool,
    /// Size of the result, set on completion.
    pub nbytes: Option<u64>,
    /// Observed compute time in seconds, reported by the worker.
    pub duration: Option<f64>,
    /// Worker failures this task has been involved in.
    pub suspicion: u32,
    /// Task sits in the ready deque or a worker stack awaiting dispatch.
    /// Entries in those queues are only valid while this is set; cancelled
    /// tasks are skipped lazily at pop time.
    pub queued: bool,
    /// Which worker stack holds the task, `None` for the common ready deque.
    pub stacked_on: Option<WorkerAddr>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        key: TaskKey,
        payload: Vec<u8>,
        priority: Priority,
        restrictions: Option<HashSet<String>>,
        loose_restrictions: bool,
    ) -> Self {
        Self {
            key,
            payload,
            state: TaskState::Waiting,
            priority,
            restrictions,
            loose_restrictions,
            nbytes: None,
            duration: None,
            suspicion: 0,
            queued: false,
            stacked_on: None,
            created_at: Utc::now(),
        }
    }

    /// A queued entry for this task on worker `w`'s stack is still valid.
    pub fn stacked_entry_valid(&self, w: &str) -> bool {
        self.queued && self.state == TaskState::Waiting && self.stacked_on.as_deref() == Some(w)
    }

    /// A queued entry for this task in the common ready deque is still valid.
    pub fn ready_entry_valid(&self) -> bool {
        self.queued && self.state == TaskState::Waiting && self.stacked_on.is_none()
    }

    /// Whether a worker on `hostname` may run this task.
    pub fn admits_host(&self, hostname: &str) -> bool {
        match &self.restrictions {
            Some(hosts) => hosts.contains(hostname),
            None => true,
        }
    }
}
