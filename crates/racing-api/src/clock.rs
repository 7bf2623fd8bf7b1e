//! Time source shared by the client, queue and scheduler.
//!
//! Monotonic time and sleeping go through `tokio::time`, so tests running
//! under `#[tokio::test(start_paused = true)]` advance deterministically.
//! Wall-clock time (used for peak-hour decisions and reported timestamps) is a
//! separate method so tests can pin the hour of day.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local};
use futures::future::BoxFuture;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic instant for rate windows and elapsed-time measurements.
    fn now(&self) -> Instant;

    /// Wall-clock time in the deployment's local offset.
    fn wall_now(&self) -> DateTime<FixedOffset>;

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Production clock: tokio timers plus the host's local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock whose wall time is pinned at construction and moves forward only
/// with the tokio clock. Monotonic behaviour is identical to [`SystemClock`].
#[derive(Debug)]
pub struct FixedClock {
    anchor: Mutex<(DateTime<FixedOffset>, Instant)>,
}

impl FixedClock {
    pub fn new(wall: DateTime<FixedOffset>) -> Self {
        Self {
            anchor: Mutex::new((wall, Instant::now())),
        }
    }

    /// Jump wall time to `wall` without touching the monotonic clock.
    pub fn set_wall(&self, wall: DateTime<FixedOffset>) {
        if let Ok(mut anchor) = self.anchor.lock() {
            *anchor = (wall, Instant::now());
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<FixedOffset> {
        match self.anchor.lock() {
            Ok(anchor) => {
                let (wall, at) = *anchor;
                let elapsed = chrono::Duration::from_std(at.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                wall + elapsed
            }
            Err(_) => Local::now().fixed_offset(),
        }
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(hour: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 4, hour, 0, 0)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_clock_wall_follows_tokio_time() {
        let clock = FixedClock::new(at(16));
        clock.sleep(Duration::from_secs(3600)).await;
        assert_eq!(clock.wall_now().hour(), 17);
    }

    #[tokio::test(start_paused = true)]
    async fn set_wall_rebases() {
        let clock = FixedClock::new(at(3));
        clock.set_wall(at(20));
        assert_eq!(clock.wall_now(), at(20));
    }
}
