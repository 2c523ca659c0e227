//! Adaptive poll pacing
//!
//! The substrate has no wakeup mechanism; inbound messages are drained by
//! polling. A busy link is polled back-to-back, an idle one backs off
//! linearly to a cap so the pump thread stays cheap.

use std::time::Duration;

/// Linear back-off pacing for a polling loop
#[derive(Debug, Clone)]
pub struct AdaptivePoll {
    current: Duration,
    step: Duration,
    max: Duration,
}

impl AdaptivePoll {
    /// Custom pacing
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            step,
            max,
        }
    }

    /// Coarse pacing for the tunnel byte pump: 1 ms steps up to 10 ms
    pub fn coarse() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(10))
    }

    /// Fine pacing for the latency-sensitive L3 path: up to 1 ms
    pub fn fine() -> Self {
        Self::new(Duration::from_micros(250), Duration::from_millis(1))
    }

    /// Feed back how many messages the last poll yielded
    pub fn record(&mut self, messages: usize) {
        if messages > 0 {
            self.current = Duration::ZERO;
        } else {
            self.current = (self.current + self.step).min(self.max);
        }
    }

    /// Delay to sleep before the next poll
    pub fn delay(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_polls_immediately() {
        let mut poll = AdaptivePoll::coarse();
        poll.record(0);
        poll.record(0);
        assert!(poll.delay() > Duration::ZERO);
        poll.record(5);
        assert_eq!(poll.delay(), Duration::ZERO);
    }

    #[test]
    fn test_idle_backs_off_to_cap() {
        let mut poll = AdaptivePoll::coarse();
        for _ in 0..100 {
            poll.record(0);
        }
        assert_eq!(poll.delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_fine_cap_is_one_milli() {
        let mut poll = AdaptivePoll::fine();
        for _ in 0..100 {
            poll.record(0);
        }
        assert_eq!(poll.delay(), Duration::from_millis(1));
    }
}
