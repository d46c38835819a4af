//! Fixed-rate due-time tracking

use std::time::{Duration, Instant};

/// Longest period a cadence tracks; longer frequencies are clamped so due
/// times stay representable as an `Instant`
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Fixed-rate schedule for one rule
///
/// Due times are `start + k * frequency`. Periods missed while the
/// scheduler lagged are skipped rather than replayed.
#[derive(Debug, Clone)]
pub struct Cadence {
    frequency: Duration,
    next_due: Instant,
}

impl Cadence {
    /// First evaluation is due immediately at `start`
    pub fn new(frequency: Duration, start: Instant) -> Self {
        Self {
            frequency: frequency.min(MAX_PERIOD),
            next_due: start,
        }
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Move the due time past `now`; returns how many periods were skipped
    pub fn advance(&mut self, now: Instant) -> u64 {
        let freq = self.frequency.as_nanos().max(1);
        let behind = now.saturating_duration_since(self.next_due).as_nanos();
        let periods = behind / freq + 1;

        let step = u64::try_from(freq.saturating_mul(periods)).unwrap_or(u64::MAX);
        self.next_due = self
            .next_due
            .checked_add(Duration::from_nanos(step))
            .or_else(|| now.checked_add(self.frequency))
            .unwrap_or(now);

        (periods - 1) as u64
    }

    /// Adopt a new frequency, keeping the phase unless it would delay the
    /// next evaluation past one new period
    pub fn retune(&mut self, frequency: Duration, now: Instant) {
        let frequency = frequency.min(MAX_PERIOD);
        if frequency == self.frequency {
            return;
        }
        self.frequency = frequency;
        if let Some(latest) = now.checked_add(frequency) {
            if self.next_due > latest {
                self.next_due = latest;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_first_tick_is_due_immediately() {
        let start = Instant::now();
        let cadence = Cadence::new(10 * SEC, start);
        assert!(cadence.is_due(start));
    }

    #[test]
    fn test_fixed_rate() {
        let start = Instant::now();
        let mut cadence = Cadence::new(10 * SEC, start);

        // Evaluated slightly late; the next due time stays on the grid
        assert_eq!(cadence.advance(start + Duration::from_millis(300)), 0);
        assert_eq!(cadence.next_due(), start + 10 * SEC);
        assert!(!cadence.is_due(start + 9 * SEC));
        assert!(cadence.is_due(start + 10 * SEC));
    }

    #[test]
    fn test_skips_missed_periods() {
        let start = Instant::now();
        let mut cadence = Cadence::new(10 * SEC, start);
        cadence.advance(start);

        // Scheduler stalled for 35s: periods at 10s, 20s, 30s collapse into one
        let missed = cadence.advance(start + 35 * SEC);
        assert_eq!(missed, 2);
        assert_eq!(cadence.next_due(), start + 40 * SEC);
    }

    #[test]
    fn test_retune_shorter_frequency() {
        let start = Instant::now();
        let mut cadence = Cadence::new(60 * SEC, start);
        cadence.advance(start);

        cadence.retune(5 * SEC, start + SEC);
        assert_eq!(cadence.frequency(), 5 * SEC);
        assert_eq!(cadence.next_due(), start + 6 * SEC);
    }

    #[test]
    fn test_retune_longer_frequency_keeps_phase() {
        let start = Instant::now();
        let mut cadence = Cadence::new(5 * SEC, start);
        cadence.advance(start);

        cadence.retune(60 * SEC, start + SEC);
        assert_eq!(cadence.next_due(), start + 5 * SEC);
    }

    #[test]
    fn test_huge_frequency_is_clamped() {
        let start = Instant::now();
        let mut cadence = Cadence::new(5 * SEC, start);
        cadence.advance(start);

        cadence.retune(Duration::MAX, start + SEC);
        assert_eq!(cadence.frequency(), MAX_PERIOD);
        assert_eq!(cadence.next_due(), start + 5 * SEC);

        assert_eq!(cadence.advance(start + 5 * SEC), 0);
        assert_eq!(cadence.next_due(), start + 5 * SEC + MAX_PERIOD);
        assert!(!cadence.is_due(start + 6 * SEC));

        let fresh = Cadence::new(Duration::from_secs(u64::MAX), start);
        assert_eq!(fresh.frequency(), MAX_PERIOD);
    }
}
