use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};

use crate::coordinator::Phase;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

// ---------------------------------------------------------------------------
// PeakWindow
// ---------------------------------------------------------------------------

/// Inclusive range of wall-clock hours. `start_hour > end_hour` wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakWindow {
    #[serde(default = "default_peak_start")]
    pub start_hour: u32,
    #[serde(default = "default_peak_end")]
    pub end_hour: u32,
}

fn default_peak_start() -> u32 {
    17
}

fn default_peak_end() -> u32 {
    23
}

impl Default for PeakWindow {
    fn default() -> Self {
        Self {
            start_hour: default_peak_start(),
            end_hour: default_peak_end(),
        }
    }
}

impl PeakWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..=self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour <= self.end_hour
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Peak,
    Normal,
}

// ---------------------------------------------------------------------------
// ScheduleTrigger
// ---------------------------------------------------------------------------

/// What a trigger runs when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    Riders,
    Events,
    Results,
    /// All phases in order.
    Full,
    /// Let the coordinator pick phases.
    Smart,
}

impl TriggerAction {
    /// Phases this action may execute.
    pub fn phases(self) -> &'static [Phase] {
        match self {
            Self::Riders => &[Phase::Riders],
            Self::Events => &[Phase::Events],
            Self::Results => &[Phase::Results],
            Self::Full | Self::Smart => &Phase::ALL,
        }
    }
}

impl fmt::Display for TriggerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Riders => "riders",
            Self::Events => "events",
            Self::Results => "results",
            Self::Full => "full",
            Self::Smart => "smart",
        })
    }
}

impl From<Phase> for TriggerAction {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Riders => Self::Riders,
            Phase::Events => Self::Events,
            Phase::Results => Self::Results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    pub name: String,
    pub action: TriggerAction,
    pub base_interval_minutes: u32,
    /// Interval used inside the peak window; falls back to the base interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_interval_minutes: Option<u32>,
    /// Minute-of-hour alignment. Without it the trigger fires
    /// `interval` minutes after the previous tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_minute: Option<u32>,
    #[serde(default)]
    pub run_on_startup: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ScheduleTrigger {
    pub fn new(name: impl Into<String>, action: TriggerAction, base_interval_minutes: u32) -> Self {
        Self {
            name: name.into(),
            action,
            base_interval_minutes,
            peak_interval_minutes: None,
            offset_minute: None,
            run_on_startup: false,
            enabled: true,
        }
    }

    pub fn with_peak(mut self, minutes: u32) -> Self {
        self.peak_interval_minutes = Some(minutes);
        self
    }

    pub fn with_offset(mut self, minute: u32) -> Self {
        self.offset_minute = Some(minute);
        self
    }

    /// Adaptive interval for a wall-clock hour.
    pub fn interval_for(&self, hour: u32, peak: &PeakWindow) -> u32 {
        let minutes = if peak.contains(hour) {
            self.peak_interval_minutes
                .unwrap_or(self.base_interval_minutes)
        } else {
            self.base_interval_minutes
        };
        minutes.max(1)
    }

    /// Minutes of the day this trigger fires at when aligned (offset 0 when
    /// none is set): every minute `m` with `m % interval == offset % interval`,
    /// using the interval of the hour `m` falls in. Consecutive fires are
    /// exactly one interval apart as long as the interval divides the day.
    pub fn fire_minutes(&self, peak: &PeakWindow) -> BTreeSet<u32> {
        let offset = self.offset_minute.unwrap_or(0);
        (0..MINUTES_PER_DAY)
            .filter(|m| {
                let interval = self.interval_for(m / 60, peak);
                m % interval == offset % interval
            })
            .collect()
    }

    /// Whether aligned ticks keep an exact cadence across midnight.
    pub fn divides_day(interval_minutes: u32) -> bool {
        interval_minutes > 0 && MINUTES_PER_DAY % interval_minutes == 0
    }

    /// Next tick strictly after `now`.
    pub fn next_fire_at(
        &self,
        now: DateTime<FixedOffset>,
        peak: &PeakWindow,
    ) -> DateTime<FixedOffset> {
        let interval = self.interval_for(now.hour(), peak);
        let relative = now + Duration::minutes(i64::from(interval));
        if self.offset_minute.is_none() {
            return relative;
        }

        let fires = self.fire_minutes(peak);
        let minute_of_day = now.hour() * 60 + now.minute();
        let (day_offset, minute) = match fires.range(minute_of_day + 1..).next() {
            Some(m) => (0, *m),
            None => match fires.iter().next() {
                Some(m) => (1, *m),
                None => return relative,
            },
        };
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|t| t.and_local_timezone(*now.offset()).single());
        match midnight {
            Some(midnight) => {
                midnight + Duration::days(day_offset) + Duration::minutes(i64::from(minute))
            }
            None => relative,
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub peak: PeakWindow,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<ScheduleTrigger>,
    /// Delay before `run_on_startup` triggers fire.
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    /// Events starting sooner than this are "near".
    #[serde(default = "default_near_threshold")]
    pub near_event_threshold_minutes: u32,
    /// How far ahead the events phase looks.
    #[serde(default = "default_lookforward")]
    pub lookforward_hours: u32,
}

fn default_triggers() -> Vec<ScheduleTrigger> {
    vec![
        ScheduleTrigger::new("riders", TriggerAction::Riders, 60).with_offset(0),
        ScheduleTrigger::new("events", TriggerAction::Events, 30)
            .with_peak(15)
            .with_offset(5),
        ScheduleTrigger::new("results", TriggerAction::Results, 180).with_offset(55),
    ]
}

fn default_startup_delay() -> u64 {
    10
}

fn default_near_threshold() -> u32 {
    120
}

fn default_lookforward() -> u32 {
    48
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            peak: PeakWindow::default(),
            triggers: default_triggers(),
            startup_delay_secs: default_startup_delay(),
            near_event_threshold_minutes: default_near_threshold(),
            lookforward_hours: default_lookforward(),
        }
    }
}

impl ScheduleConfig {
    pub fn enabled_triggers(&self) -> impl Iterator<Item = &ScheduleTrigger> {
        self.triggers.iter().filter(|t| t.enabled)
    }

    pub fn mode_at(&self, hour: u32) -> ScheduleMode {
        if self.peak.contains(hour) {
            ScheduleMode::Peak
        } else {
            ScheduleMode::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 4, h, m, s)
            .unwrap()
    }

    #[test]
    fn peak_window_is_inclusive() {
        let peak = PeakWindow::default();
        assert!(!peak.contains(16));
        assert!(peak.contains(17));
        assert!(peak.contains(23));
        assert!(!peak.contains(0));
    }

    #[test]
    fn peak_window_wraps_midnight() {
        let peak = PeakWindow {
            start_hour: 22,
            end_hour: 2,
        };
        assert!(peak.contains(23));
        assert!(peak.contains(0));
        assert!(peak.contains(2));
        assert!(!peak.contains(3));
        assert!(!peak.contains(21));
    }

    #[test]
    fn interval_switches_with_hour() {
        let t = ScheduleTrigger::new("riders", TriggerAction::Riders, 120).with_peak(60);
        let peak = PeakWindow::default();
        assert_eq!(t.interval_for(16, &peak), 120);
        assert_eq!(t.interval_for(17, &peak), 60);
        let no_peak = ScheduleTrigger::new("results", TriggerAction::Results, 180);
        assert_eq!(no_peak.interval_for(20, &peak), 180);
    }

    #[test]
    fn fire_minutes_sub_hourly() {
        let t = ScheduleTrigger::new("near", TriggerAction::Events, 15).with_offset(5);
        let fires = t.fire_minutes(&PeakWindow::default());
        assert_eq!(fires.len(), 96);
        assert!(fires.contains(&5));
        assert!(fires.contains(&50));
        assert!(!fires.contains(&0));
    }

    #[test]
    fn fire_minutes_multi_hour() {
        let t = ScheduleTrigger::new("results", TriggerAction::Results, 180).with_offset(55);
        let fires: Vec<u32> = t.fire_minutes(&PeakWindow::default()).into_iter().collect();
        assert_eq!(fires.len(), 8);
        assert_eq!(fires[0], 55);
        assert_eq!(fires[1], 3 * 60 + 55);
    }

    #[test]
    fn aligned_ninety_minutes_keeps_its_cadence() {
        let t = ScheduleTrigger::new("riders", TriggerAction::Riders, 90).with_offset(0);
        let peak = PeakWindow::default();
        assert_eq!(t.fire_minutes(&peak).len(), 16);
        let start = at(1, 30, 0);
        let next = t.next_fire_at(start, &peak);
        assert_eq!(next - start, Duration::minutes(90));
        assert_eq!(t.next_fire_at(at(1, 0, 0), &peak), at(1, 30, 0));
    }

    #[test]
    fn aligned_forty_five_minutes_has_no_short_gaps() {
        let t = ScheduleTrigger::new("events", TriggerAction::Events, 45).with_offset(10);
        let fires: Vec<u32> = t.fire_minutes(&PeakWindow::default()).into_iter().collect();
        assert_eq!(fires.len(), 32);
        assert_eq!(fires[0], 10);
        assert!(fires.windows(2).all(|w| w[1] - w[0] == 45));
        // Wrap from the last fire of the day to the first of the next.
        assert_eq!(MINUTES_PER_DAY - fires[31] + fires[0], 45);
    }

    #[test]
    fn divides_day_accepts_only_exact_divisors() {
        assert!(ScheduleTrigger::divides_day(45));
        assert!(ScheduleTrigger::divides_day(90));
        assert!(ScheduleTrigger::divides_day(180));
        assert!(!ScheduleTrigger::divides_day(100));
        assert!(!ScheduleTrigger::divides_day(0));
    }

    #[test]
    fn next_fire_without_offset_is_relative() {
        let t = ScheduleTrigger::new("riders", TriggerAction::Riders, 60);
        let next = t.next_fire_at(at(12, 7, 30), &PeakWindow::default());
        assert_eq!(next, at(13, 7, 30));
    }

    #[test]
    fn next_fire_with_offset_aligns_to_minute() {
        let t = ScheduleTrigger::new("near", TriggerAction::Events, 15).with_offset(5);
        let peak = PeakWindow::default();
        assert_eq!(t.next_fire_at(at(12, 7, 30), &peak), at(12, 20, 0));
        assert_eq!(t.next_fire_at(at(12, 5, 0), &peak), at(12, 20, 0));
    }

    #[test]
    fn next_fire_wraps_to_next_day() {
        let t = ScheduleTrigger::new("results", TriggerAction::Results, 180).with_offset(55);
        let next = t.next_fire_at(at(23, 58, 0), &PeakWindow::default());
        assert_eq!(next, at(0, 55, 0) + Duration::days(1));
    }

    #[test]
    fn peak_transition_applies_on_next_tick() {
        let t = ScheduleTrigger::new("riders", TriggerAction::Riders, 60)
            .with_peak(15)
            .with_offset(0);
        let peak = PeakWindow::default();
        // 16:50 is off-peak, but the next hour is peak and fires at :00.
        assert_eq!(t.next_fire_at(at(16, 50, 0), &peak), at(17, 0, 0));
        assert_eq!(t.next_fire_at(at(17, 0, 0), &peak), at(17, 15, 0));
    }

    #[test]
    fn default_config_round_trips_yaml() {
        let cfg = ScheduleConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: ScheduleConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, cfg);
        let partial: ScheduleConfig = serde_yaml::from_str("lookforward_hours: 24\n").unwrap();
        assert_eq!(partial.triggers.len(), 3);
        assert_eq!(partial.lookforward_hours, 24);
    }
}
