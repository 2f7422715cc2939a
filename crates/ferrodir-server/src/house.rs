//! Housekeeping: the periodic tick that refreshes the process-wide sampled
//! time consumed by every CSN generator.

use std::sync::Arc;

use tracing::debug;

use ferrodir_core::csngen::SampledTime;

use crate::eventq::{EventArg, EventId, EventQueue};

/// Default housekeeping interval.
pub const HOUSEKEEPING_INTERVAL_SECS: u64 = 30;

/// Handle to the scheduled housekeeping job.
pub struct Housekeeping {
    event: Option<EventId>,
}

impl Housekeeping {
    /// Schedules the tick on the event queue.
    #[must_use]
    pub fn start(eq: &EventQueue, time: SampledTime, interval_secs: u64) -> Self {
        let tick_time = time.clone();
        let event = eq.repeat(
            Arc::new(move |_when, _arg| {
                tick_time.update();
                debug!("housekeeping tick");
            }),
            Arc::new(()) as EventArg,
            0,
            interval_secs.max(1) * 1000,
        );
        Self { event }
    }

    /// Cancels the tick.
    pub fn stop(&mut self, eq: &EventQueue) {
        if let Some(id) = self.event.take() {
            eq.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn housekeeping_refreshes_sampled_time() {
        let eq = EventQueue::new();
        let time = SampledTime::new();
        time.set(1); // pin to something stale
        let mut hk = Housekeeping::start(&eq, time.clone(), 1);
        eq.start();
        std::thread::sleep(Duration::from_millis(500));
        assert!(time.get() > 1);
        hk.stop(&eq);
        eq.stop();
    }
}
