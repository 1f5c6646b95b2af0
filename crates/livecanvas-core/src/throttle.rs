//! Rate limiting for frames and cursor updates.

use std::time::{Duration, Instant};

/// Default interval between rendered frames and cursor broadcasts (~60 fps).
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(16);

/// Lets at most one event through per interval. The first event always passes.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true and starts a new interval if an event may pass at `now`.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Forget the last event so the next one passes.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_event_passes() {
        let mut throttle = Throttle::default();
        assert!(throttle.ready(Instant::now()));
    }

    #[test]
    fn test_events_within_interval_are_dropped() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(16));
        assert!(throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_millis(5)));
        assert!(!throttle.ready(start + Duration::from_millis(15)));
        assert!(throttle.ready(start + Duration::from_millis(16)));
        assert!(!throttle.ready(start + Duration::from_millis(20)));
    }

    #[test]
    fn test_reset() {
        let start = Instant::now();
        let mut throttle = Throttle::default();
        assert!(throttle.ready(start));
        throttle.reset();
        assert!(throttle.ready(start));
    }
}
