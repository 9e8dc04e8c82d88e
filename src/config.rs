use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    pub dashboard_addr: Option<SocketAddr>,
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a worker is evicted.
    pub heartbeat_misses: u32,
    /// Worker failures a task may be involved in before it is quarantined.
    pub suspicion_limit: u32,
    /// Assumed network bandwidth for transfer-cost estimates, bytes/sec.
    pub bandwidth_bytes_per_sec: f64,
    /// Expected task cost in seconds until real durations are observed.
    pub default_task_duration: f64,
    /// Flush window for per-peer outbound message batching.
    pub batch_window_ms: u64,
    /// Interval between work-stealing passes.
    pub steal_interval_ms: u64,
    /// Max stimuli drained from the event queue per lock acquisition.
    pub stimulus_batch_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8786".parse().unwrap(),
            dashboard_addr: None,
            heartbeat_interval_ms: 500,
            heartbeat_misses: 3,
            suspicion_limit: 3,
            bandwidth_bytes_per_sec: 100e6,
            default_task_duration: 0.5,
            batch_window_ms: 2,
            steal_interval_ms: 100,
            stimulus_batch_limit: 256,
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }
}
