//! Message semantics exchanged with workers and clients.
//!
//! Each message is a tagged record (`op` plus fields). Byte-level framing
//! and user payload serialization live in the transport layer; handlers see
//! only these types.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::scheduler::task::{ClientId, Priority, TaskKey, WorkerAddr};

/// One task within an `update-graph` submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Opaque serialized function and arguments.
    pub payload: Vec<u8>,
    pub dependencies: Vec<TaskKey>,
    /// Client-assigned priority, smaller is sooner.
    pub priority: i64,
    /// Acceptable hostnames, if restricted.
    pub restrictions: Option<HashSet<String>>,
    pub loose_restrictions: bool,
}

/// Every external event the scheduler reacts to. One handler per variant;
/// handlers run serially and never block.
#[derive(Debug, Clone, PartialEq)]
pub enum Stimulus {
    UpdateGraph {
        client: ClientId,
        tasks: HashMap<TaskKey, TaskSpec>,
        /// Keys whose completion the client wants reported.
        keys: Vec<TaskKey>,
    },
    TaskFinished {
        worker: WorkerAddr,
        key: TaskKey,
        nbytes: u64,
        /// Observed compute time in seconds, if the worker measured it.
        duration: Option<f64>,
    },
    TaskFailed {
        worker: WorkerAddr,
        key: TaskKey,
        exception: String,
        traceback: String,
    },
    AddWorker {
        address: WorkerAddr,
        hostname: String,
        ncores: u32,
    },
    RemoveWorker {
        address: WorkerAddr,
    },
    Heartbeat {
        worker: WorkerAddr,
        metrics: HashMap<String, f64>,
    },
    /// Replica bookkeeping: the worker now holds these keys.
    AddKeys {
        worker: WorkerAddr,
        keys: Vec<TaskKey>,
    },
    /// Replica bookkeeping: the worker does not hold these keys after all.
    MissingData {
        worker: WorkerAddr,
        keys: Vec<TaskKey>,
    },
    ClientReleasesKeys {
        client: ClientId,
        keys: Vec<TaskKey>,
    },
    AddClient {
        client: ClientId,
    },
    RemoveClient {
        client: ClientId,
    },
    Gather {
        client: ClientId,
        keys: Vec<TaskKey>,
    },
    /// Clear an erred key and reschedule it.
    RetryKey {
        client: ClientId,
        key: TaskKey,
    },
    /// Periodic: move stealable work from loaded stacks to idle workers.
    RebalanceTick,
    /// Periodic: evict workers that missed too many heartbeats.
    HeartbeatTick,
}

/// Messages the scheduler emits to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ToWorker {
    ComputeTask {
        key: TaskKey,
        payload: Vec<u8>,
        /// Replica locations for each dependency, so the worker can fetch
        /// inputs peer-to-peer.
        who_has: HashMap<TaskKey, Vec<WorkerAddr>>,
        priority: Priority,
    },
    /// Drop the result of `key` (and abandon it if still running).
    Release { key: TaskKey },
}

/// Messages the scheduler emits to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ToClient {
    KeyDone {
        key: TaskKey,
        nbytes: u64,
    },
    KeyErred {
        key: TaskKey,
        /// The original erred key held responsible.
        blame: TaskKey,
        exception: String,
        traceback: String,
    },
    /// All replicas of a wanted key are gone and it cannot be recomputed.
    KeyLost {
        key: TaskKey,
    },
    /// Reply to `gather`: where each requested key currently lives.
    GatherReply {
        who_has: HashMap<TaskKey, Vec<WorkerAddr>>,
        missing: Vec<TaskKey>,
    },
}

/// An outbound message routed to one peer's send queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Worker(WorkerAddr, ToWorker),
    Client(ClientId, ToClient),
}

impl Outbound {
    pub fn compute_task(&self) -> Option<(&str, &str)> {
        match self {
            Outbound::Worker(w, ToWorker::ComputeTask { key, .. }) => Some((w, key)),
            _ => None,
        }
    }
}
