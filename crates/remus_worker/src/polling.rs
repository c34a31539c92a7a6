//! Adaptive work-polling rates.
//!
//! Between empty work requests a worker backs off exponentially from the
//! minimum delay to the maximum, and snaps back to the minimum as soon as
//! work (or any broker activity) arrives.

/// Bounds on the delay between consecutive work requests, in milliseconds.
///
/// Construction normalizes any pair of inputs: negative values clamp to
/// zero, and an inverted pair is swapped. The invariant afterwards is
/// `0 <= min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingRates {
    min_ms: u64,
    max_ms: u64,
}

impl PollingRates {
    pub fn new(min_ms: i64, max_ms: i64) -> Self {
        let (low, high) = if min_ms <= max_ms {
            (min_ms, max_ms)
        } else {
            (max_ms, min_ms)
        };
        Self {
            min_ms: low.max(0) as u64,
            max_ms: high.max(0) as u64,
        }
    }

    pub fn min_ms(&self) -> u64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }
}

impl Default for PollingRates {
    fn default() -> Self {
        Self::new(50, 2_000)
    }
}

/// Tracks the current delay within a [`PollingRates`] envelope.
#[derive(Debug, Clone, Copy)]
pub struct PollBackoff {
    rates: PollingRates,
    current_ms: u64,
}

impl PollBackoff {
    pub fn new(rates: PollingRates) -> Self {
        Self {
            rates,
            current_ms: rates.min_ms,
        }
    }

    /// Delay to wait before the next empty-handed ask.
    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    /// An ask came back empty; wait longer next time.
    pub fn backoff(&mut self) {
        let doubled = self.current_ms.saturating_mul(2).max(1);
        self.current_ms = doubled.clamp(self.rates.min_ms, self.rates.max_ms);
    }

    /// Activity arrived; return to eager polling.
    pub fn reset(&mut self) {
        self.current_ms = self.rates.min_ms;
    }
}
