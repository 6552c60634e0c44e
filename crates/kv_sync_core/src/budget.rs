//! Invocation time budget.
//!
//! The budget is fixed at invocation start from the platform's remaining time
//! minus a safety margin, and read against a monotonic clock afterwards.

use std::time::Duration;

use tokio::time::Instant;

pub const MIN_SAFETY_MARGIN_PERCENT: u8 = 2;
pub const MAX_SAFETY_MARGIN_PERCENT: u8 = 5;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutBudget {
    started_at: Instant,
    deadline: Instant,
    total: Duration,
}

impl TimeoutBudget {
    /// Starts a budget that reserves `margin_percent` (clamped to 2..=5) of
    /// the platform's remaining time.
    pub fn new(platform_remaining: Duration, margin_percent: u8) -> Self {
        let margin_percent =
            margin_percent.clamp(MIN_SAFETY_MARGIN_PERCENT, MAX_SAFETY_MARGIN_PERCENT);
        let reserved = platform_remaining * u32::from(margin_percent) / 100;
        let total = platform_remaining.saturating_sub(reserved);
        let started_at = Instant::now();
        Self {
            started_at,
            deadline: started_at + total,
            total,
        }
    }

    /// Narrows the budget to a caller-requested maximum duration.
    pub fn with_override(self, max_duration: Option<Duration>) -> Self {
        match max_duration {
            Some(max) if max < self.total => Self {
                started_at: self.started_at,
                deadline: self.started_at + max,
                total: max,
            },
            _ => self,
        }
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// True when an operation estimated at `estimated_cost` still fits.
    pub fn within_budget(&self, estimated_cost: Duration) -> bool {
        let remaining = self.remaining();
        !remaining.is_zero() && remaining >= estimated_cost
    }

    /// Caps a wanted duration at what is left.
    pub fn clamp(&self, wanted: Duration) -> Duration {
        wanted.min(self.remaining())
    }
}

/// Converts the platform's absolute deadline (epoch millis) into remaining time.
pub fn platform_remaining(deadline_epoch_ms: u64, now_epoch_ms: i64) -> Duration {
    let now = u64::try_from(now_epoch_ms).unwrap_or(0);
    Duration::from_millis(deadline_epoch_ms.saturating_sub(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reserves_safety_margin() {
        let budget = TimeoutBudget::new(Duration::from_secs(100), 5);
        assert_eq!(budget.total(), Duration::from_secs(95));
        assert_eq!(budget.remaining(), Duration::from_secs(95));
    }

    #[tokio::test(start_paused = true)]
    async fn margin_is_clamped_into_range() {
        let too_small = TimeoutBudget::new(Duration::from_secs(100), 0);
        let too_large = TimeoutBudget::new(Duration::from_secs(100), 50);
        assert_eq!(too_small.total(), Duration::from_secs(98));
        assert_eq!(too_large.total(), Duration::from_secs(95));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_decreases_and_saturates() {
        let budget = TimeoutBudget::new(Duration::from_millis(1000), 2);
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(budget.remaining(), Duration::from_millis(580));
        assert_eq!(budget.elapsed(), Duration::from_millis(400));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(budget.remaining(), Duration::ZERO);
        assert!(!budget.within_budget(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn within_budget_compares_against_estimate() {
        let budget = TimeoutBudget::new(Duration::from_millis(1000), 5);
        assert!(budget.within_budget(Duration::from_millis(950)));
        assert!(!budget.within_budget(Duration::from_millis(951)));
    }

    #[tokio::test(start_paused = true)]
    async fn override_only_narrows() {
        let budget = TimeoutBudget::new(Duration::from_secs(10), 5);
        let narrowed = budget.with_override(Some(Duration::from_secs(2)));
        let widened = budget.with_override(Some(Duration::from_secs(60)));
        assert_eq!(narrowed.total(), Duration::from_secs(2));
        assert_eq!(widened.total(), budget.total());
        assert_eq!(budget.with_override(None).total(), budget.total());
    }

    #[tokio::test(start_paused = true)]
    async fn clamp_caps_at_remaining() {
        let budget = TimeoutBudget::new(Duration::from_millis(1000), 5);
        assert_eq!(budget.clamp(Duration::from_secs(30)), Duration::from_millis(950));
        assert_eq!(budget.clamp(Duration::from_millis(10)), Duration::from_millis(10));
    }

    #[test]
    fn platform_remaining_saturates_past_deadline() {
        assert_eq!(platform_remaining(10_000, 7_500), Duration::from_millis(2_500));
        assert_eq!(platform_remaining(10_000, 12_000), Duration::ZERO);
        assert_eq!(platform_remaining(10_000, -5), Duration::from_millis(10_000));
    }
}
