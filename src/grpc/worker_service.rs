use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::comm::batch::BatchedSender;
use crate::comm::{Event, EventSender};
use crate::pb;
use crate::protocol::{Stimulus, ToWorker};

/// gRPC surface for workers: one bidirectional stream per worker, opened
/// with a registration frame. Inbound frames become stimuli; outbound
/// messages flow through a per-worker batched queue.
pub struct WorkerService {
    events: EventSender,
    batch_window: Duration,
}

impl WorkerService {
    pub fn new(events: EventSender, batch_window: Duration) -> Self {
        Self {
            events,
            batch_window,
        }
    }
}

#[tonic::async_trait]
impl pb::worker_api_server::WorkerApi for WorkerService {
    type ConnectStream = ReceiverStream<Result<pb::SchedulerToWorkerBatch, Status>>;

    async fn connect(
        &self,
        request: Request<Streaming<pb::WorkerBatch>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty worker stream"))?;
        let mut first_msgs = first.messages.into_iter();
        let reg = match first_msgs.next().and_then(|m| m.msg) {
            Some(pb::worker_message::Msg::Register(r)) => r,
            _ => {
                return Err(Status::failed_precondition(
                    "first worker message must be register",
                ))
            }
        };
        if reg.address.is_empty() {
            return Err(Status::invalid_argument("worker address must not be empty"));
        }
        let address = reg.address.clone();
        tracing::info!(address = %address, hostname = %reg.hostname, "Worker stream opened");

        let (handle, mut batches) = BatchedSender::<ToWorker>::new(self.batch_window);
        let (out_tx, out_rx) = mpsc::channel::<Result<pb::SchedulerToWorkerBatch, Status>>(64);

        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                let frame = pb::SchedulerToWorkerBatch {
                    messages: batch.into_iter().map(to_worker_frame).collect(),
                };
                if out_tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
        });

        let _ = self.events.send(Event::WorkerChannel {
            address: address.clone(),
            handle,
        });
        let _ = self.events.send(Event::Stimulus(Stimulus::AddWorker {
            address: address.clone(),
            hostname: reg.hostname,
            ncores: reg.ncores,
        }));
        for m in first_msgs {
            forward_worker_message(&self.events, &address, m);
        }

        let events = self.events.clone();
        let reader_addr = address;
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        for m in frame.messages {
                            forward_worker_message(&events, &reader_addr, m);
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(worker = %reader_addr, error = %status, "Worker stream error");
                        break;
                    }
                }
            }
            tracing::info!(worker = %reader_addr, "Worker stream closed");
            let _ = events.send(Event::Stimulus(Stimulus::RemoveWorker {
                address: reader_addr.clone(),
            }));
            let _ = events.send(Event::WorkerDetached {
                address: reader_addr,
            });
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

fn forward_worker_message(events: &EventSender, address: &str, message: pb::WorkerMessage) {
    let Some(msg) = message.msg else {
        return;
    };
    let stimulus = match msg {
        // Registration is only valid as the first message of the stream.
        pb::worker_message::Msg::Register(_) => {
            tracing::warn!(worker = address, "Unexpected register mid-stream, dropped");
            return;
        }
        pb::worker_message::Msg::TaskFinished(f) => Stimulus::TaskFinished {
            worker: address.to_string(),
            key: f.key,
            nbytes: f.nbytes,
            duration: (f.compute_time > 0.0).then_some(f.compute_time),
        },
        pb::worker_message::Msg::TaskFailed(f) => Stimulus::TaskFailed {
            worker: address.to_string(),
            key: f.key,
            exception: f.exception,
            traceback: f.traceback,
        },
        pb::worker_message::Msg::AddKeys(a) => Stimulus::AddKeys {
            worker: address.to_string(),
            keys: a.keys,
        },
        pb::worker_message::Msg::MissingData(m) => Stimulus::MissingData {
            worker: address.to_string(),
            keys: m.keys,
        },
        pb::worker_message::Msg::Heartbeat(h) => Stimulus::Heartbeat {
            worker: address.to_string(),
            metrics: h.metrics,
        },
    };
    let _ = events.send(Event::Stimulus(stimulus));
}

fn to_worker_frame(msg: ToWorker) -> pb::SchedulerToWorker {
    let msg = match msg {
        ToWorker::ComputeTask {
            key,
            payload,
            who_has,
            priority,
        } => pb::scheduler_to_worker::Msg::ComputeTask(pb::ComputeTask {
            key,
            payload,
            who_has: who_has
                .into_iter()
                .map(|(k, workers)| (k, pb::WorkerList { workers }))
                .collect(),
            priority: vec![
                priority.user,
                priority.generation as i64,
                priority.order as i64,
            ],
        }),
        ToWorker::Release { key } => {
            pb::scheduler_to_worker::Msg::Release(pb::ReleaseKey { key })
        }
    };
    pb::SchedulerToWorker { msg: Some(msg) }
}
