//! Redial delays for transports that hold a long-lived backend link.

use std::time::Duration;

/// First delay after a link drops.
pub const RECONNECT_MIN: Duration = Duration::from_millis(100);

/// Upper bound on the delay between redials.
pub const RECONNECT_MAX: Duration = Duration::from_secs(5);

/// Doubling delay, capped at [`RECONNECT_MAX`].
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { next: RECONNECT_MIN }
    }
}

impl Backoff {
    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX);
        delay
    }

    /// Start over after a successful attempt.
    pub fn reset(&mut self) {
        self.next = RECONNECT_MIN;
    }
}
