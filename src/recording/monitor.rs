// Delay monitor: closes a chunk once the trigger has gone quiet
//
// Cooperative polling: the frame callback only updates atomics in the ledger,
// and this loop samples them every poll interval. A chunk may therefore close
// up to one poll interval after the timeout elapsed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::ledger::{now_secs, FrameLedger};

/// Why `DelayMonitor::wait` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// No frame for longer than the timeout delay
    TimedOut,
    /// The controller was cancelled
    Cancelled,
}

pub struct DelayMonitor {
    ledger: Arc<FrameLedger>,
    timeout_delay: Duration,
    poll_interval: Duration,
    /// Cleared when the current chunk should close
    keep_going: AtomicBool,
    cancel: Arc<AtomicBool>,
}

impl DelayMonitor {
    pub fn new(
        ledger: Arc<FrameLedger>,
        timeout_delay: Duration,
        poll_interval: Duration,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ledger,
            timeout_delay,
            poll_interval,
            keep_going: AtomicBool::new(false),
            cancel,
        }
    }

    /// Prepare for a new chunk: last frame time is now, continue flag set
    pub fn arm(&self) {
        self.ledger.set_time_of_last_frame(now_secs());
        self.keep_going.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.keep_going.load(Ordering::SeqCst)
    }

    /// At least one frame recorded in the current chunk
    pub fn video_started(&self) -> bool {
        self.ledger.chunk_counter() > 0
    }

    pub fn timeout_exceeded(&self, now: f64) -> bool {
        now - self.ledger.time_of_last_frame() > self.timeout_delay.as_secs_f64()
    }

    /// Block until the chunk times out or the controller is cancelled
    pub fn wait(&self) -> MonitorOutcome {
        while self.is_running() {
            if self.cancel.load(Ordering::SeqCst) {
                log::info!("Cancellation requested, closing chunk");
                self.keep_going.store(false, Ordering::SeqCst);
                return MonitorOutcome::Cancelled;
            }

            if self.video_started() && self.timeout_exceeded(now_secs()) {
                log::info!(
                    "Timeout delay exceeded ({:.3}s without frames)",
                    self.timeout_delay.as_secs_f64()
                );
                self.keep_going.store(false, Ordering::SeqCst);
                return MonitorOutcome::TimedOut;
            }

            std::thread::sleep(self.poll_interval);
        }

        if self.cancel.load(Ordering::SeqCst) {
            MonitorOutcome::Cancelled
        } else {
            MonitorOutcome::TimedOut
        }
    }
}
