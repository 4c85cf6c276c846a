//! A simple interval ticker.
//!
//! Several parts of the runtime (kid-summary checks, retransmission checks,
//! acknowledgement cadences) need to know "how many intervals of length `N`
//! have elapsed since I last checked", without caring about wall-clock time.
//! `Ticker` answers that question as a pure function of accumulated
//! milliseconds.

/// Accepts the passage of time and reports how many ticks have elapsed.
#[derive(Clone, Debug)]
pub struct Ticker {
    current_ms: u64,
    interval_ms: u64,
}

impl Ticker {
    /// Creates a new ticker with the given interval.
    pub fn new(interval_ms: u64) -> Self {
        Ticker { current_ms: 0, interval_ms }
    }

    /// Elapses `ms` milliseconds, returning the number of complete intervals
    /// that have now passed.
    pub fn elapse(&mut self, ms: u64) -> u64 {
        self.current_ms += ms;
        let ticks = self.current_ms / self.interval_ms;
        self.current_ms %= self.interval_ms;
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_accumulate_across_calls() {
        let mut ticker = Ticker::new(30);
        assert_eq!(ticker.elapse(10), 0);
        assert_eq!(ticker.elapse(10), 0);
        assert_eq!(ticker.elapse(10), 1);
        assert_eq!(ticker.elapse(65), 2);
    }
}
