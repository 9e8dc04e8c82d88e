//! The scheduler's event loop and per-peer send queues.
//!
//! All state mutation is serialized here: stimuli are drained in arrival
//! order and applied under a single write-lock acquisition per batch, so
//! handlers run to completion one at a time. Outbound messages are routed
//! to per-peer batched queues consumed by the transport.

pub mod batch;
pub mod heartbeat;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Outbound, Stimulus, ToClient, ToWorker};
use crate::scheduler::task::{ClientId, WorkerAddr};
use crate::scheduler::Scheduler;
use batch::BatchedSender;

/// A message into the event loop: either an external stimulus or transport
/// plumbing attaching/detaching a peer's outbound queue.
pub enum Event {
    Stimulus(Stimulus),
    WorkerChannel {
        address: WorkerAddr,
        handle: BatchedSender<ToWorker>,
    },
    ClientChannel {
        id: ClientId,
        handle: BatchedSender<ToClient>,
    },
    WorkerDetached {
        address: WorkerAddr,
    },
    ClientDetached {
        id: ClientId,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;

pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<Event>) {
    mpsc::unbounded_channel()
}

/// Drive the scheduler until shutdown. Stimuli are applied in arrival
/// order; per-peer FIFO holds because each peer's transport feeds this
/// queue sequentially and outbound messages are queued in emission order.
pub async fn run_event_loop(
    scheduler: Arc<RwLock<Scheduler>>,
    mut events: mpsc::UnboundedReceiver<Event>,
    batch_limit: usize,
    shutdown: CancellationToken,
) {
    let mut workers: HashMap<WorkerAddr, BatchedSender<ToWorker>> = HashMap::new();
    let mut clients: HashMap<ClientId, BatchedSender<ToClient>> = HashMap::new();

    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        let mut batch = vec![first];
        while batch.len() < batch_limit {
            match events.try_recv() {
                Ok(ev) => batch.push(ev),
                Err(_) => break,
            }
        }

        let mut outbound: Vec<Outbound> = Vec::new();
        {
            let mut sched = scheduler.write().await;
            for event in batch {
                match event {
                    Event::Stimulus(stimulus) => outbound.extend(sched.handle(stimulus)),
                    Event::WorkerChannel { address, handle } => {
                        workers.insert(address, handle);
                    }
                    Event::ClientChannel { id, handle } => {
                        clients.insert(id, handle);
                    }
                    Event::WorkerDetached { address } => {
                        workers.remove(&address);
                    }
                    Event::ClientDetached { id } => {
                        clients.remove(&id);
                    }
                }
            }
        }

        for msg in outbound {
            match msg {
                Outbound::Worker(addr, m) => {
                    let delivered = workers.get(&addr).map(|h| h.send(m)).unwrap_or(false);
                    if !delivered {
                        tracing::debug!(worker = %addr, "Dropped message for absent worker");
                        workers.remove(&addr);
                    }
                }
                Outbound::Client(id, m) => {
                    let delivered = clients.get(&id).map(|h| h.send(m)).unwrap_or(false);
                    if !delivered {
                        tracing::debug!(client = %id, "Dropped message for absent client");
                        clients.remove(&id);
                    }
                }
            }
        }
    }
}
