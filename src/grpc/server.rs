use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::comm::EventSender;
use crate::error::Result;
use crate::grpc::client_service::ClientService;
use crate::grpc::worker_service::WorkerService;
use crate::pb::client_api_server::ClientApiServer;
use crate::pb::worker_api_server::WorkerApiServer;

pub struct GrpcServer {
    addr: SocketAddr,
    events: EventSender,
    batch_window: Duration,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, events: EventSender, batch_window_ms: u64) -> Self {
        Self {
            addr,
            events,
            batch_window: Duration::from_millis(batch_window_ms),
        }
    }

    /// Serve the worker and client APIs until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let worker_api =
            WorkerApiServer::new(WorkerService::new(self.events.clone(), self.batch_window));
        let client_api =
            ClientApiServer::new(ClientService::new(self.events.clone(), self.batch_window));

        tracing::info!(addr = %self.addr, "gRPC server listening");
        Server::builder()
            .add_service(worker_api)
            .add_service(client_api)
            .serve_with_shutdown(self.addr, shutdown.cancelled())
            .await?;
        Ok(())
    }
}
