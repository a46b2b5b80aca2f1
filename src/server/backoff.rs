use std::time::Duration;

pub(crate) const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
pub(crate) const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay between retries after temporary accept errors.
///
/// Starts at 5ms, doubles on every consecutive error and saturates at 1s.
/// A successful accept resets it.
#[derive(Debug, Default)]
pub(crate) struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            ACCEPT_BACKOFF_INITIAL
        } else {
            (self.delay * 2).min(ACCEPT_BACKOFF_MAX)
        };
        self.delay
    }

    pub(crate) fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}
