//! Static checks for a schedule before anything is committed.
//!
//! Every function here is pure: it looks at a [`ScheduleConfig`] plus the
//! per-category budgets and reports problems or generates offsets. Nothing is
//! scheduled from this module.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use racing_api::{BudgetLimit, OperationCategory};
use serde::{Deserialize, Serialize};

use super::trigger::{
    PeakWindow, ScheduleConfig, ScheduleTrigger, TriggerAction, MINUTES_PER_DAY,
};

/// Floor for any trigger regardless of budgets.
const MIN_TRIGGER_MINUTES: u32 = 5;
/// Beyond this the synced data is considered stale.
const STALE_INTERVAL_MINUTES: u32 = 12 * 60;
/// Two triggers closer than this (but not coinciding) congest the queue.
const PROXIMITY_MINUTES: u32 = 3;
/// Tried in order when picking a free minute for a trigger.
const PREFERRED_OFFSETS: [u32; 11] = [55, 56, 57, 58, 59, 0, 1, 2, 3, 4, 5];
/// Assumed near events per events run when estimating signup volume.
const ASSUMED_EVENTS_PER_RUN: u64 = 20;
const SIGNUP_CALLS_WARN_PER_DAY: u64 = 2000;
const NEAR_THRESHOLD_RANGE: std::ops::RangeInclusive<u32> = 30..=360;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Calls a single run of `action` makes directly, per category.
fn calls_per_run(action: TriggerAction) -> &'static [(OperationCategory, u64)] {
    match action {
        TriggerAction::Riders => &[
            (OperationCategory::ClubMembers, 1),
            (OperationCategory::RiderBulk, 1),
        ],
        TriggerAction::Events => &[(OperationCategory::UpcomingEvents, 1)],
        TriggerAction::Results => &[],
        TriggerAction::Full | TriggerAction::Smart => &[
            (OperationCategory::ClubMembers, 1),
            (OperationCategory::RiderBulk, 1),
            (OperationCategory::UpcomingEvents, 1),
        ],
    }
}

fn clock_label(minute_of_day: u32) -> String {
    format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60)
}

/// Shortest distance between two minutes of the day, across midnight.
fn circular_distance(a: u32, b: u32) -> u32 {
    let d = a.abs_diff(b) % MINUTES_PER_DAY;
    d.min(MINUTES_PER_DAY - d)
}

fn min_distance(a: &BTreeSet<u32>, b: &BTreeSet<u32>) -> Option<(u32, u32, u32)> {
    let mut best: Option<(u32, u32, u32)> = None;
    for &x in a {
        for &y in b {
            let d = circular_distance(x, y);
            if best.map_or(true, |(bd, _, _)| d < bd) {
                best = Some((d, x, y));
            }
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct ScheduleValidator {
    limits: HashMap<OperationCategory, BudgetLimit>,
}

impl Default for ScheduleValidator {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl ScheduleValidator {
    /// `overrides` replaces the documented ceiling per category.
    pub fn new(overrides: HashMap<OperationCategory, BudgetLimit>) -> Self {
        let limits = OperationCategory::ALL
            .into_iter()
            .map(|c| (c, overrides.get(&c).copied().unwrap_or_else(|| c.default_limit())))
            .collect();
        Self { limits }
    }

    fn limit(&self, category: OperationCategory) -> BudgetLimit {
        self.limits
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_limit())
    }

    /// Smallest interval at which every direct call of `action` fits its budget.
    pub fn minimum_interval(&self, action: TriggerAction) -> u32 {
        calls_per_run(action)
            .iter()
            .map(|(c, _)| {
                let limit = self.limit(*c);
                let secs = limit.window_secs.max(1);
                let per_call = secs.div_ceil(u64::from(limit.max_calls.max(1)));
                u32::try_from(per_call.div_ceil(60)).unwrap_or(u32::MAX)
            })
            .max()
            .unwrap_or(0)
            .max(MIN_TRIGGER_MINUTES)
    }

    // -----------------------------------------------------------------------
    // validate
    // -----------------------------------------------------------------------

    pub fn validate(&self, config: &ScheduleConfig) -> ValidationReport {
        let mut report = ValidationReport::default();
        let triggers: Vec<&ScheduleTrigger> = config.enabled_triggers().collect();

        self.check_intervals(&triggers, &mut report);
        self.check_collisions(config, &triggers, &mut report);
        Self::check_thresholds(config, &mut report);
        self.check_volume(config, &triggers, &mut report);

        report.valid = report.errors.is_empty();
        report
    }

    fn check_intervals(&self, triggers: &[&ScheduleTrigger], report: &mut ValidationReport) {
        for t in triggers {
            let min = self.minimum_interval(t.action);
            let intervals = std::iter::once(t.base_interval_minutes).chain(t.peak_interval_minutes);
            for interval in intervals {
                if interval < min {
                    report.errors.push(format!(
                        "trigger '{}' runs every {interval} min, below the {min} min minimum for {} syncs",
                        t.name, t.action
                    ));
                    report
                        .suggestions
                        .push(format!("raise '{}' to at least {min} minutes", t.name));
                }
            }
            if t.base_interval_minutes > STALE_INTERVAL_MINUTES {
                report.warnings.push(format!(
                    "trigger '{}' runs every {} min; data may go stale",
                    t.name, t.base_interval_minutes
                ));
            }
            if t.action == TriggerAction::Riders && t.base_interval_minutes < 60 {
                report.warnings.push(format!(
                    "trigger '{}' syncs riders more often than hourly and may hit rate limits with large teams",
                    t.name
                ));
            }
            if let Some(offset) = t.offset_minute {
                if offset >= 60 {
                    report.errors.push(format!(
                        "trigger '{}' has offset_minute {offset}; must be 0..=59",
                        t.name
                    ));
                }
                let intervals =
                    std::iter::once(t.base_interval_minutes).chain(t.peak_interval_minutes);
                for interval in intervals.filter(|i| !ScheduleTrigger::divides_day(*i)) {
                    report.errors.push(format!(
                        "trigger '{}' is aligned to :{offset:02} but its {interval} min interval does not divide the day; ticks would bunch up at midnight",
                        t.name
                    ));
                    report.suggestions.push(format!(
                        "give '{}' an interval that divides 1440 minutes (e.g. 15, 30, 45, 60, 90, 120, 180)",
                        t.name
                    ));
                }
            }
        }
    }

    fn check_collisions(
        &self,
        config: &ScheduleConfig,
        triggers: &[&ScheduleTrigger],
        report: &mut ValidationReport,
    ) {
        let fires: Vec<BTreeSet<u32>> = triggers
            .iter()
            .map(|t| t.fire_minutes(&config.peak))
            .collect();
        let mut needs_offsets = false;

        for i in 0..triggers.len() {
            for j in (i + 1)..triggers.len() {
                let (a, b) = (triggers[i], triggers[j]);
                let Some((distance, x, _)) = min_distance(&fires[i], &fires[j]) else {
                    continue;
                };
                if distance == 0 {
                    report.errors.push(format!(
                        "triggers '{}' and '{}' both fire at {}",
                        a.name,
                        b.name,
                        clock_label(x)
                    ));
                    if a.offset_minute.is_none() || b.offset_minute.is_none() {
                        report.warnings.push(format!(
                            "triggers '{}' and '{}' overlap because they have no explicit offset",
                            a.name, b.name
                        ));
                    }
                    needs_offsets = true;
                } else if distance < PROXIMITY_MINUTES {
                    report.warnings.push(format!(
                        "triggers '{}' and '{}' fire within {distance} min of each other around {}",
                        a.name,
                        b.name,
                        clock_label(x)
                    ));
                    report
                        .suggestions
                        .push("keep triggers at least 5 minutes apart".to_string());
                }
            }
        }

        if needs_offsets {
            for (name, minute) in self.generate_safe_offsets(config) {
                report
                    .suggestions
                    .push(format!("offset trigger '{name}' to :{minute:02}"));
            }
        }
    }

    fn check_thresholds(config: &ScheduleConfig, report: &mut ValidationReport) {
        let threshold = config.near_event_threshold_minutes;
        if u64::from(config.lookforward_hours) * 60 < u64::from(threshold) {
            report.errors.push(format!(
                "lookforward window ({}h) is shorter than the near-event threshold ({threshold} min)",
                config.lookforward_hours
            ));
            report.suggestions.push(format!(
                "set lookforward_hours to at least {}",
                threshold.div_ceil(60)
            ));
        }
        if !NEAR_THRESHOLD_RANGE.contains(&threshold) {
            report.warnings.push(format!(
                "near-event threshold of {threshold} min is outside the usual {}..={} range",
                NEAR_THRESHOLD_RANGE.start(),
                NEAR_THRESHOLD_RANGE.end()
            ));
            report
                .suggestions
                .push("120 minutes gives a safe margin for last-minute signups".to_string());
        }
    }

    fn check_volume(
        &self,
        config: &ScheduleConfig,
        triggers: &[&ScheduleTrigger],
        report: &mut ValidationReport,
    ) {
        let mut per_category: BTreeMap<OperationCategory, u64> = BTreeMap::new();
        for t in triggers {
            let runs = t.fire_minutes(&config.peak).len() as u64;
            for (category, calls) in calls_per_run(t.action) {
                *per_category.entry(*category).or_default() += runs * calls;
            }
            if matches!(t.action, TriggerAction::Events) {
                let signups = runs * ASSUMED_EVENTS_PER_RUN;
                if signups > SIGNUP_CALLS_WARN_PER_DAY {
                    report.warnings.push(format!(
                        "trigger '{}' may issue about {signups} event signup calls per day",
                        t.name
                    ));
                    report.suggestions.push(format!(
                        "lengthen '{}' or lower near_event_threshold_minutes",
                        t.name
                    ));
                }
            }
        }
        for (category, calls) in per_category {
            let capacity = self.limit(category).daily_capacity();
            if calls > capacity {
                report.warnings.push(format!(
                    "schedule needs about {calls} {category} calls per day but the budget allows {capacity}"
                ));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Minute-of-hour offset per enabled trigger so no two fire together.
    ///
    /// Most frequent triggers are placed first. The first one keeps :00; each
    /// later one takes the first preferred minute that neither collides with
    /// nor crowds what is already placed, then the first collision-free
    /// minute, then :55 as a last resort.
    pub fn generate_safe_offsets(&self, config: &ScheduleConfig) -> BTreeMap<String, u32> {
        let mut order: Vec<&ScheduleTrigger> = config.enabled_triggers().collect();
        order.sort_by_key(|t| t.base_interval_minutes);

        let mut placed: BTreeSet<u32> = BTreeSet::new();
        let mut out = BTreeMap::new();
        for trigger in order {
            let fires_with = |minute: u32| {
                let mut candidate = trigger.clone();
                candidate.offset_minute = Some(minute);
                candidate.fire_minutes(&config.peak)
            };
            let minute = if placed.is_empty() {
                0
            } else {
                let spaced = PREFERRED_OFFSETS.into_iter().find(|m| {
                    min_distance(&fires_with(*m), &placed)
                        .is_some_and(|(d, _, _)| d >= PROXIMITY_MINUTES)
                });
                spaced
                    .or_else(|| {
                        PREFERRED_OFFSETS
                            .into_iter()
                            .chain(0..60)
                            .find(|m| fires_with(*m).is_disjoint(&placed))
                    })
                    .unwrap_or(55)
            };
            placed.extend(fires_with(minute));
            out.insert(trigger.name.clone(), minute);
        }
        out
    }

    /// Copy of `config` with `offsets` applied by trigger name.
    pub fn apply_offsets(config: &ScheduleConfig, offsets: &BTreeMap<String, u32>) -> ScheduleConfig {
        let mut out = config.clone();
        for trigger in &mut out.triggers {
            if let Some(minute) = offsets.get(&trigger.name) {
                trigger.offset_minute = Some(*minute);
            }
        }
        out
    }

    /// Known-good schedule: riders hourly at :00, near events every 15 min
    /// from :05, results every 3 hours at :55.
    pub fn recommended() -> ScheduleConfig {
        ScheduleConfig {
            triggers: vec![
                ScheduleTrigger::new("riders", TriggerAction::Riders, 60).with_offset(0),
                ScheduleTrigger::new("events", TriggerAction::Events, 15).with_offset(5),
                ScheduleTrigger::new("results", TriggerAction::Results, 180).with_offset(55),
            ],
            peak: PeakWindow::default(),
            ..ScheduleConfig::default()
        }
    }
}
