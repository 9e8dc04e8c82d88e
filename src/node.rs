use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::comm::heartbeat::PeriodicStimulus;
use crate::comm::{event_channel, run_event_loop, Event, EventSender};
use crate::config::SchedulerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::protocol::Stimulus;
use crate::scheduler::Scheduler;

/// The scheduler process: one event loop owning all state, the periodic
/// tick timers, the gRPC transport and the diagnostics dashboard.
pub struct SchedulerNode {
    pub config: SchedulerConfig,
    pub scheduler: Arc<RwLock<Scheduler>>,
    events: EventSender,
}

impl SchedulerNode {
    pub fn new(config: SchedulerConfig) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, events_rx) = event_channel();
        let scheduler = Arc::new(RwLock::new(Scheduler::new(config.clone())));
        (
            Self {
                config,
                scheduler,
                events,
            },
            events_rx,
        )
    }

    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// Run the node until shutdown.
    ///
    /// Starts, in order: the event loop (serializes every state mutation),
    /// the heartbeat-eviction and work-stealing timers, the dashboard if
    /// configured, and finally the gRPC server, which this method blocks on.
    pub async fn run(
        self,
        events_rx: mpsc::UnboundedReceiver<Event>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let loop_scheduler = self.scheduler.clone();
        let loop_shutdown = shutdown.clone();
        let batch_limit = self.config.stimulus_batch_limit;
        tokio::spawn(async move {
            run_event_loop(loop_scheduler, events_rx, batch_limit, loop_shutdown).await;
        });

        let heartbeat_timer = PeriodicStimulus::new(
            self.config.heartbeat_interval_ms,
            Stimulus::HeartbeatTick,
        );
        tokio::spawn(heartbeat_timer.run(self.events.clone(), shutdown.clone()));

        let steal_timer =
            PeriodicStimulus::new(self.config.steal_interval_ms, Stimulus::RebalanceTick);
        tokio::spawn(steal_timer.run(self.events.clone(), shutdown.clone()));

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let dashboard_state = DashboardState {
                scheduler: self.scheduler.clone(),
            };
            tokio::spawn(async move {
                run_dashboard(dashboard_addr, dashboard_state).await;
            });
        }

        let server = GrpcServer::new(
            self.config.listen_addr,
            self.events.clone(),
            self.config.batch_window_ms,
        );
        server.run(shutdown).await
    }
}
