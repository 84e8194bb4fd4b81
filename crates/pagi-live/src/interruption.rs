//! Interruption controller: the agent reported barge-in, silence it now.

use crate::playback::PlaybackScheduler;
use std::time::Duration;
use tracing::info;

/// What a single interruption did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptOutcome {
    /// Entries stopped (playing or pending).
    pub stopped: usize,
    /// Scheduler time of the interrupt; the next entry starts no earlier.
    pub at: Duration,
}

#[derive(Debug, Default)]
pub struct InterruptionController {
    count: u64,
    last: Option<Duration>,
}

impl InterruptionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hard-stop all queued and playing audio and reset the cursor to now.
    pub fn on_interrupted(&mut self, playback: &mut PlaybackScheduler) -> InterruptOutcome {
        let stopped = playback.interrupt();
        let at = playback.now();
        self.count += 1;
        self.last = Some(at);
        info!(
            stopped,
            total = self.count,
            "⚡ Interruption: user speaking, silencing agent output"
        );
        InterruptOutcome { stopped, at }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn last_interrupt(&self) -> Option<Duration> {
        self.last
    }
}
