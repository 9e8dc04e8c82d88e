use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::comm::{Event, EventSender};
use crate::protocol::Stimulus;

/// Periodically feeds a stimulus into the event loop. Used for the
/// heartbeat-eviction check and the work-stealing pass; the handlers do the
/// actual work so the timers stay trivial.
pub struct PeriodicStimulus {
    interval: Duration,
    stimulus: Stimulus,
}

impl PeriodicStimulus {
    pub fn new(interval_ms: u64, stimulus: Stimulus) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            stimulus,
        }
    }

    pub async fn run(self, events: EventSender, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if events.send(Event::Stimulus(self.stimulus.clone())).is_err() {
                        break;
                    }
                }
            }
        }
    }
}
