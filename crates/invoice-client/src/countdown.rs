//! Expiry countdown for normal invoices.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownTick {
    Remaining(u64),
    Expired,
}

/// Converts ticks into `timer`/`expired` outcomes. `Expired` is produced
/// exactly once; every later tick yields `None`.
#[derive(Debug, Clone)]
pub struct Countdown {
    deadline: Instant,
    finished: bool,
}

impl Countdown {
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            finished: false,
        }
    }

    /// Anchor a wall-clock expiry to the runtime clock.
    #[must_use]
    pub fn until(expires: DateTime<Utc>) -> Self {
        let remaining = (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Self::with_deadline(Instant::now() + remaining)
    }

    /// Whole seconds left, rounded up so `0` means the deadline has passed.
    #[must_use]
    pub fn remaining_seconds(&self, now: Instant) -> u64 {
        let remaining = self.deadline.saturating_duration_since(now);
        remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn tick(&mut self, now: Instant) -> Option<CountdownTick> {
        if self.finished {
            return None;
        }
        let remaining = self.remaining_seconds(now);
        if remaining > 0 {
            Some(CountdownTick::Remaining(remaining))
        } else {
            self.finished = true;
            Some(CountdownTick::Expired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_then_expires_once() {
        let start = Instant::now();
        let mut countdown = Countdown::with_deadline(start + Duration::from_secs(3));

        let ticks: Vec<Option<CountdownTick>> = (0..6)
            .map(|second| countdown.tick(start + Duration::from_secs(second)))
            .collect();

        assert_eq!(
            ticks,
            vec![
                Some(CountdownTick::Remaining(3)),
                Some(CountdownTick::Remaining(2)),
                Some(CountdownTick::Remaining(1)),
                Some(CountdownTick::Expired),
                None,
                None,
            ]
        );
        assert!(countdown.is_finished());
    }

    #[test]
    fn partial_seconds_round_up() {
        let start = Instant::now();
        let countdown = Countdown::with_deadline(start + Duration::from_millis(2_400));
        assert_eq!(countdown.remaining_seconds(start), 3);
        assert_eq!(countdown.remaining_seconds(start + Duration::from_millis(2_000)), 1);
        assert_eq!(countdown.remaining_seconds(start + Duration::from_secs(5)), 0);
    }

    #[test]
    fn past_expiry_expires_on_first_tick() {
        let mut countdown = Countdown::until(Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(countdown.tick(Instant::now()), Some(CountdownTick::Expired));
        assert_eq!(countdown.tick(Instant::now()), None);
    }
}
