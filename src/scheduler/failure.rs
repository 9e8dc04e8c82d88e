//! Worker loss and task suspicion.
//!
//! Losing a worker invalidates its replicas, reassigns its in-flight tasks
//! and counts each of them against the suspicion limit: a task involved in
//! too many worker failures is deemed poison and erred permanently, even if
//! no exception was ever observed. The recovery walk touches only tasks
//! whose data was actually lost.

use std::time::Duration;

use crate::scheduler::task::{TaskError, TaskState, WorkerAddr};
use crate::scheduler::Scheduler;

impl Scheduler {
    pub(crate) fn handle_remove_worker(&mut self, address: WorkerAddr) {
        let Some(removal) = self.state.remove_worker(&address) else {
            return;
        };
        tracing::warn!(
            address = %address,
            processing = removal.processing.len(),
            held = removal.held.len(),
            "Worker removed"
        );

        // Lost replicas first, so reassigned tasks see the post-loss view of
        // which inputs still exist.
        for key in removal.held {
            if self.state.task_state(&key) != Some(TaskState::Memory) {
                continue;
            }
            if self.state.who_has.contains_key(&key) {
                continue; // another replica survives
            }
            if self.state.is_wanted(&key) || self.state.has_pending_consumers(&key) {
                self.recover_lost(&key);
            } else {
                self.state.record_released(&key);
                self.release_if_unneeded(&key);
            }
        }

        for (key, _cost) in removal.processing {
            if self.state.task_state(&key) != Some(TaskState::Processing) {
                continue;
            }
            if self.state.rprocessing.contains_key(&key) {
                continue; // a replicated dispatch is still in flight elsewhere
            }
            let task = self
                .state
                .tasks
                .get_mut(&key)
                .expect("processing key is a live task");
            task.suspicion += 1;
            let suspicion = task.suspicion;
            if suspicion >= self.config.suspicion_limit {
                tracing::warn!(
                    key = %key,
                    suspicion,
                    "Task hit suspicion limit, quarantined as erred"
                );
                self.transition_to_erred(
                    &key,
                    Some(TaskError {
                        exception: format!(
                            "task deemed suspicious: involved in {suspicion} worker failures"
                        ),
                        traceback: String::new(),
                    }),
                );
            } else {
                self.return_to_waiting(&key);
            }
        }

        // Stack entries queued for the departed worker go back through
        // placement.
        for key in removal.stacked {
            let still_ready = self.state.task_state(&key) == Some(TaskState::Waiting)
                && self.state.waiting.get(&key).is_some_and(|w| w.is_empty())
                && !self.state.tasks[&key].queued;
            if still_ready {
                self.dispatch_ready(&key);
            }
        }
    }

    /// Evict workers that missed too many consecutive heartbeats.
    pub(crate) fn handle_heartbeat_tick(&mut self) {
        let timeout = Duration::from_millis(
            self.config.heartbeat_interval_ms * self.config.heartbeat_misses as u64,
        );
        let overdue: Vec<WorkerAddr> = self
            .state
            .workers
            .values()
            .filter(|w| w.last_heartbeat.elapsed() > timeout)
            .map(|w| w.address.clone())
            .collect();
        for address in overdue {
            tracing::warn!(address = %address, "Worker missed heartbeats, evicting");
            self.handle_remove_worker(address);
        }
    }

    pub(crate) fn handle_rebalance_tick(&mut self) {
        self.rebalance();
    }
}
