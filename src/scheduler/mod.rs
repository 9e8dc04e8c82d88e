//! The scheduler core: state store, task state machine, dispatcher,
//! stimulus handlers and failure manager.
//!
//! The core is synchronous and single-owner. All mutation goes through
//! [`Scheduler::handle`], which applies one stimulus to completion and
//! returns the outbound messages it produced; the event loop serializes
//! calls behind one lock, so no two handlers ever observe state
//! concurrently.

pub mod dispatch;
mod failure;
mod handlers;
pub mod state;
pub mod task;
mod transitions;

use crate::config::SchedulerConfig;
use crate::protocol::{Outbound, Stimulus, ToClient, ToWorker};
use dispatch::{LocalityPolicy, PlacementPolicy, StealBuckets};
use state::SchedulerState;

pub use state::WorkerInfo;
pub use task::{ClientId, Priority, Task, TaskError, TaskKey, TaskState, WorkerAddr};

pub struct Scheduler {
    pub state: SchedulerState,
    pub(crate) config: SchedulerConfig,
    pub(crate) policy: Box<dyn PlacementPolicy>,
    pub(crate) stealable: StealBuckets,
    pub(crate) outbox: Vec<Outbound>,
    pub(crate) generation: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let policy = Box::new(LocalityPolicy {
            bandwidth: config.bandwidth_bytes_per_sec,
        });
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: SchedulerConfig, policy: Box<dyn PlacementPolicy>) -> Self {
        Self {
            state: SchedulerState::new(),
            config,
            policy,
            stealable: StealBuckets::new(),
            outbox: Vec::new(),
            generation: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Apply one stimulus and return the outbound messages it produced, in
    /// emission order. The transport feeds stimulus batches through here one
    /// message at a time, in arrival order.
    pub fn handle(&mut self, stimulus: Stimulus) -> Vec<Outbound> {
        match stimulus {
            Stimulus::UpdateGraph {
                client,
                tasks,
                keys,
            } => self.handle_update_graph(client, tasks, keys),
            Stimulus::TaskFinished {
                worker,
                key,
                nbytes,
                duration,
            } => self.handle_task_finished(worker, key, nbytes, duration),
            Stimulus::TaskFailed {
                worker,
                key,
                exception,
                traceback,
            } => self.handle_task_failed(worker, key, exception, traceback),
            Stimulus::AddWorker {
                address,
                hostname,
                ncores,
            } => self.handle_add_worker(address, hostname, ncores),
            Stimulus::RemoveWorker { address } => self.handle_remove_worker(address),
            Stimulus::Heartbeat { worker, metrics } => self.handle_heartbeat(worker, metrics),
            Stimulus::AddKeys { worker, keys } => self.handle_add_keys(worker, keys),
            Stimulus::MissingData { worker, keys } => self.handle_missing_data(worker, keys),
            Stimulus::ClientReleasesKeys { client, keys } => {
                self.handle_client_releases_keys(client, keys)
            }
            Stimulus::AddClient { client } => self.handle_add_client(client),
            Stimulus::RemoveClient { client } => self.handle_remove_client(client),
            Stimulus::Gather { client, keys } => self.handle_gather(client, keys),
            Stimulus::RetryKey { client, key } => self.handle_retry_key(client, key),
            Stimulus::RebalanceTick => self.handle_rebalance_tick(),
            Stimulus::HeartbeatTick => self.handle_heartbeat_tick(),
        }

        #[cfg(debug_assertions)]
        if let Err(violation) = self.state.validate() {
            panic!("{violation}");
        }

        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn send_worker(&mut self, worker: &str, msg: ToWorker) {
        self.outbox.push(Outbound::Worker(worker.to_string(), msg));
    }

    pub(crate) fn send_client(&mut self, client: &str, msg: ToClient) {
        self.outbox.push(Outbound::Client(client.to_string(), msg));
    }
}
