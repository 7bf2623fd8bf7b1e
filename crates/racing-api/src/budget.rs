//! Per-category call quotas.
//!
//! The remote API documents a separate ceiling for each endpoint family. Each
//! family is an [`OperationCategory`]; its live counter is a [`RateBudget`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// OperationCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    /// GET club roster.
    ClubMembers,
    /// GET one rider.
    Rider,
    /// POST many rider ids at once.
    RiderBulk,
    /// GET one event.
    EventDetails,
    /// GET signups for one event.
    EventSignups,
    /// GET results for one event.
    EventResults,
    /// GET the upcoming events list.
    UpcomingEvents,
}

impl OperationCategory {
    pub const ALL: [OperationCategory; 7] = [
        Self::ClubMembers,
        Self::Rider,
        Self::RiderBulk,
        Self::EventDetails,
        Self::EventSignups,
        Self::EventResults,
        Self::UpcomingEvents,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClubMembers => "club_members",
            Self::Rider => "rider",
            Self::RiderBulk => "rider_bulk",
            Self::EventDetails => "event_details",
            Self::EventSignups => "event_signups",
            Self::EventResults => "event_results",
            Self::UpcomingEvents => "upcoming_events",
        }
    }

    /// Documented ceiling for the standard API tier.
    pub fn default_limit(self) -> BudgetLimit {
        match self {
            Self::ClubMembers => BudgetLimit::new(60 * 60, 1),
            Self::Rider => BudgetLimit::new(60, 5),
            Self::RiderBulk => BudgetLimit::new(15 * 60, 1),
            Self::EventDetails
            | Self::EventSignups
            | Self::EventResults
            | Self::UpcomingEvents => BudgetLimit::new(60, 1),
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown operation category '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// BudgetLimit
// ---------------------------------------------------------------------------

/// Static `(window, count)` ceiling for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub window_secs: u64,
    pub max_calls: u32,
}

impl BudgetLimit {
    pub const fn new(window_secs: u64, max_calls: u32) -> Self {
        Self {
            window_secs,
            max_calls,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    /// Smallest even spacing between calls that stays inside the ceiling,
    /// e.g. 12s for five calls per minute.
    pub fn min_spacing(&self) -> Duration {
        self.window() / self.max_calls.max(1)
    }

    /// Calls the ceiling admits over 24 hours.
    pub fn daily_capacity(&self) -> u64 {
        let windows_per_day = (24 * 60 * 60) / self.window_secs.max(1);
        windows_per_day.max(1) * u64::from(self.max_calls.max(1))
    }
}

// ---------------------------------------------------------------------------
// RateBudget
// ---------------------------------------------------------------------------

/// Live counter for one category. Owned and mutated only by the client.
#[derive(Debug)]
pub struct RateBudget {
    window: Duration,
    max_calls: u32,
    consumed: u32,
    reset_at: Instant,
    /// Incremented on every window roll so stale refunds can be ignored.
    epoch: u64,
}

/// Proof that a slot was taken in a particular window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    epoch: u64,
}

impl RateBudget {
    pub fn new(limit: BudgetLimit, now: Instant) -> Self {
        let window = limit.window();
        Self {
            window,
            max_calls: limit.max_calls.max(1),
            consumed: 0,
            reset_at: now + window,
            epoch: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now < self.reset_at {
            return;
        }
        self.consumed = 0;
        self.epoch += 1;
        while self.reset_at <= now {
            self.reset_at += self.window;
        }
    }

    /// Take one slot, or report how long until the window resets.
    pub fn try_consume(&mut self, now: Instant) -> Result<Permit, Duration> {
        self.roll(now);
        if self.consumed < self.max_calls {
            self.consumed += 1;
            Ok(Permit { epoch: self.epoch })
        } else {
            Err(self.reset_at.saturating_duration_since(now))
        }
    }

    /// Give back a slot taken by `permit`, if its window is still current.
    pub fn refund(&mut self, permit: Permit) {
        if permit.epoch == self.epoch {
            self.consumed = self.consumed.saturating_sub(1);
        }
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    pub fn reset_at(&self) -> Instant {
        self.reset_at
    }

    pub fn status(&mut self, category: OperationCategory, now: Instant) -> BudgetStatus {
        self.roll(now);
        let can_call = self.consumed < self.max_calls;
        BudgetStatus {
            category,
            calls_in_window: self.consumed,
            max_calls: self.max_calls,
            window_secs: self.window.as_secs(),
            can_call,
            wait_ms: if can_call {
                0
            } else {
                self.reset_at.saturating_duration_since(now).as_millis() as u64
            },
        }
    }
}

/// Monitoring snapshot of one category's budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub category: OperationCategory,
    pub calls_in_window: u32,
    pub max_calls: u32,
    pub window_secs: u64,
    pub can_call: bool,
    pub wait_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_str() {
        for c in OperationCategory::ALL {
            assert_eq!(c.as_str().parse::<OperationCategory>().unwrap(), c);
        }
        assert!("bogus".parse::<OperationCategory>().is_err());
    }

    #[test]
    fn min_spacing_for_five_per_minute_is_twelve_seconds() {
        assert_eq!(
            OperationCategory::Rider.default_limit().min_spacing(),
            Duration::from_secs(12)
        );
    }

    #[test]
    fn daily_capacity_for_bulk() {
        // 1 per 15 min = 96 per day
        assert_eq!(OperationCategory::RiderBulk.default_limit().daily_capacity(), 96);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_then_resets_after_window() {
        let start = Instant::now();
        let mut budget = RateBudget::new(BudgetLimit::new(60, 2), start);
        assert!(budget.try_consume(start).is_ok());
        assert!(budget.try_consume(start).is_ok());
        let wait = budget.try_consume(start).unwrap_err();
        assert_eq!(wait, Duration::from_secs(60));

        let later = start + Duration::from_secs(60);
        assert!(budget.try_consume(later).is_ok());
        assert_eq!(budget.consumed(), 1);
        assert_eq!(budget.reset_at(), start + Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn long_idle_advances_reset_by_whole_windows() {
        let start = Instant::now();
        let mut budget = RateBudget::new(BudgetLimit::new(60, 1), start);
        let later = start + Duration::from_secs(150);
        budget.try_consume(later).unwrap();
        assert_eq!(budget.reset_at(), start + Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn refund_ignored_after_window_roll() {
        let start = Instant::now();
        let mut budget = RateBudget::new(BudgetLimit::new(60, 1), start);
        let permit = budget.try_consume(start).unwrap();
        let later = start + Duration::from_secs(61);
        budget.try_consume(later).unwrap();
        budget.refund(permit);
        assert_eq!(budget.consumed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_wait_when_exhausted() {
        let start = Instant::now();
        let mut budget = RateBudget::new(BudgetLimit::new(60, 1), start);
        budget.try_consume(start).unwrap();
        let status = budget.status(OperationCategory::EventResults, start + Duration::from_secs(20));
        assert!(!status.can_call);
        assert_eq!(status.wait_ms, 40_000);
        assert_eq!(status.calls_in_window, 1);
    }
}
