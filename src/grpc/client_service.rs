use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

use crate::comm::batch::BatchedSender;
use crate::comm::{Event, EventSender};
use crate::pb;
use crate::protocol::{Stimulus, TaskSpec, ToClient};

/// gRPC surface for clients. A client opens one bidirectional stream,
/// optionally naming its id; anonymous clients get one minted. Completions
/// and failures for wanted keys arrive on the same stream.
pub struct ClientService {
    events: EventSender,
    batch_window: Duration,
}

impl ClientService {
    pub fn new(events: EventSender, batch_window: Duration) -> Self {
        Self {
            events,
            batch_window,
        }
    }
}

#[tonic::async_trait]
impl pb::client_api_server::ClientApi for ClientService {
    type ConnectStream = ReceiverStream<Result<pb::SchedulerToClientBatch, Status>>;

    async fn connect(
        &self,
        request: Request<Streaming<pb::ClientBatch>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty client stream"))?;
        let mut first_msgs = first.messages.into_iter();
        let reg = match first_msgs.next().and_then(|m| m.msg) {
            Some(pb::client_message::Msg::Register(r)) => r,
            _ => {
                return Err(Status::failed_precondition(
                    "first client message must be register",
                ))
            }
        };
        let client_id = if reg.client_id.is_empty() {
            format!("client-{}", Uuid::new_v4())
        } else {
            reg.client_id
        };
        tracing::info!(client = %client_id, "Client stream opened");

        let (handle, mut batches) = BatchedSender::<ToClient>::new(self.batch_window);
        let (out_tx, out_rx) = mpsc::channel::<Result<pb::SchedulerToClientBatch, Status>>(64);

        // Tell the client its id before anything else.
        let registered = pb::SchedulerToClientBatch {
            messages: vec![pb::SchedulerToClient {
                msg: Some(pb::scheduler_to_client::Msg::Registered(pb::Registered {
                    client_id: client_id.clone(),
                })),
            }],
        };
        let _ = out_tx.send(Ok(registered)).await;

        let forward_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                let frame = pb::SchedulerToClientBatch {
                    messages: batch.into_iter().map(to_client_frame).collect(),
                };
                if forward_tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
        });

        let _ = self.events.send(Event::ClientChannel {
            id: client_id.clone(),
            handle,
        });
        let _ = self.events.send(Event::Stimulus(Stimulus::AddClient {
            client: client_id.clone(),
        }));
        for m in first_msgs {
            forward_client_message(&self.events, &client_id, m);
        }

        let events = self.events.clone();
        let reader_id = client_id;
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        for m in frame.messages {
                            forward_client_message(&events, &reader_id, m);
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(client = %reader_id, error = %status, "Client stream error");
                        break;
                    }
                }
            }
            tracing::info!(client = %reader_id, "Client stream closed");
            let _ = events.send(Event::Stimulus(Stimulus::RemoveClient {
                client: reader_id.clone(),
            }));
            let _ = events.send(Event::ClientDetached { id: reader_id });
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

fn forward_client_message(events: &EventSender, client: &str, message: pb::ClientMessage) {
    let Some(msg) = message.msg else {
        return;
    };
    let stimulus = match msg {
        pb::client_message::Msg::Register(_) => {
            tracing::warn!(client, "Unexpected register mid-stream, dropped");
            return;
        }
        pb::client_message::Msg::UpdateGraph(g) => Stimulus::UpdateGraph {
            client: client.to_string(),
            tasks: g
                .tasks
                .into_iter()
                .map(|(key, spec)| (key, from_task_spec(spec)))
                .collect(),
            keys: g.keys,
        },
        pb::client_message::Msg::ReleaseKeys(r) => Stimulus::ClientReleasesKeys {
            client: client.to_string(),
            keys: r.keys,
        },
        pb::client_message::Msg::Gather(g) => Stimulus::Gather {
            client: client.to_string(),
            keys: g.keys,
        },
        pb::client_message::Msg::Retry(r) => Stimulus::RetryKey {
            client: client.to_string(),
            key: r.key,
        },
    };
    let _ = events.send(Event::Stimulus(stimulus));
}

fn from_task_spec(spec: pb::TaskSpec) -> TaskSpec {
    TaskSpec {
        payload: spec.payload,
        dependencies: spec.dependencies,
        priority: spec.priority,
        restrictions: spec
            .restricted
            .then(|| spec.host_restrictions.into_iter().collect()),
        loose_restrictions: spec.loose_restrictions,
    }
}

fn to_client_frame(msg: ToClient) -> pb::SchedulerToClient {
    let msg = match msg {
        ToClient::KeyDone { key, nbytes } => {
            pb::scheduler_to_client::Msg::KeyDone(pb::KeyDone { key, nbytes })
        }
        ToClient::KeyErred {
            key,
            blame,
            exception,
            traceback,
        } => pb::scheduler_to_client::Msg::KeyErred(pb::KeyErred {
            key,
            blame,
            exception,
            traceback,
        }),
        ToClient::KeyLost { key } => pb::scheduler_to_client::Msg::KeyLost(pb::KeyLost { key }),
        ToClient::GatherReply { who_has, missing } => {
            pb::scheduler_to_client::Msg::GatherReply(pb::GatherReply {
                who_has: who_has
                    .into_iter()
                    .map(|(k, workers)| (k, pb::WorkerList { workers }))
                    .collect(),
                missing,
            })
        }
    };
    pb::SchedulerToClient { msg: Some(msg) }
}
