//! Periodic triggers with adaptive intervals.
//!
//! Each enabled trigger gets its own tokio timer task. A tick hands the
//! trigger's action to a [`TriggerHandler`] in a separate task and then
//! computes the next tick from the interval in force *now*, so a peak/normal
//! transition applies on the very next tick.

mod trigger;
pub mod validator;

pub use trigger::{
    PeakWindow, ScheduleConfig, ScheduleMode, ScheduleTrigger, TriggerAction, MINUTES_PER_DAY,
};
pub use validator::{ScheduleValidator, ValidationReport};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use futures::future::BoxFuture;
use racing_api::Clock;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// Receives ticks. Implemented by the batch coordinator.
pub trait TriggerHandler: Send + Sync {
    fn run(&self, action: TriggerAction, trigger: &str) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStatus {
    pub name: String,
    pub action: TriggerAction,
    pub enabled: bool,
    pub interval_minutes: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub mode: ScheduleMode,
    pub triggers: Vec<TriggerStatus>,
}

#[derive(Debug, Clone, Default)]
struct TriggerRuntime {
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

type RuntimeMap = Arc<Mutex<HashMap<String, TriggerRuntime>>>;

struct SchedulerState {
    config: ScheduleConfig,
    running: bool,
    timers: Vec<AbortHandle>,
}

pub struct Scheduler {
    handler: Arc<dyn TriggerHandler>,
    clock: Arc<dyn Clock>,
    validator: ScheduleValidator,
    state: Mutex<SchedulerState>,
    runtime: RuntimeMap,
}

fn lock_runtime(runtime: &RuntimeMap) -> MutexGuard<'_, HashMap<String, TriggerRuntime>> {
    runtime.lock().unwrap_or_else(|e| e.into_inner())
}

impl Scheduler {
    /// Refuses a configuration the validator reports errors for.
    pub fn new(
        config: ScheduleConfig,
        validator: ScheduleValidator,
        handler: Arc<dyn TriggerHandler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::check(&validator, &config)?;
        Ok(Self {
            handler,
            clock,
            validator,
            state: Mutex::new(SchedulerState {
                config,
                running: false,
                timers: Vec::new(),
            }),
            runtime: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn check(validator: &ScheduleValidator, config: &ScheduleConfig) -> Result<()> {
        let report = validator.validate(config);
        for warning in &report.warnings {
            warn!("schedule: {warning}");
        }
        if !report.valid {
            return Err(SyncError::InvalidConfig(report.errors.join("; ")));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Start one timer per enabled trigger. No-op when already running.
    pub fn start(&self) {
        let mut state = self.lock();
        if state.running {
            info!("scheduler already running");
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, scheduler not started");
            return;
        };

        let peak = state.config.peak;
        let startup_delay = Duration::from_secs(state.config.startup_delay_secs);
        let triggers: Vec<ScheduleTrigger> = state.config.enabled_triggers().cloned().collect();
        for trigger in triggers {
            lock_runtime(&self.runtime).entry(trigger.name.clone()).or_default();
            let task = TriggerTask {
                trigger,
                peak,
                startup_delay,
                handler: Arc::clone(&self.handler),
                clock: Arc::clone(&self.clock),
                runtime: Arc::clone(&self.runtime),
            };
            let join = handle.spawn(task.run());
            state.timers.push(join.abort_handle());
        }
        state.running = true;
        info!(triggers = state.timers.len(), "scheduler started");
    }

    /// Cancel all pending timers. Runs already handed off keep going.
    pub fn stop(&self) {
        let mut state = self.lock();
        if !state.running {
            debug!("scheduler not running");
            return;
        }
        for timer in state.timers.drain(..) {
            timer.abort();
        }
        state.running = false;
        for rt in lock_runtime(&self.runtime).values_mut() {
            rt.next_run_at = None;
        }
        info!("scheduler stopped");
    }

    /// Replace the triggers and start again.
    pub fn restart(&self, config: ScheduleConfig) -> Result<()> {
        Self::check(&self.validator, &config)?;
        self.stop();
        {
            let mut state = self.lock();
            lock_runtime(&self.runtime).retain(|name, _| config.triggers.iter().any(|t| &t.name == name));
            state.config = config;
        }
        self.start();
        Ok(())
    }

    pub fn config(&self) -> ScheduleConfig {
        self.lock().config.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.lock();
        let now = self.clock.wall_now();
        let runtime = lock_runtime(&self.runtime);
        let triggers = state
            .config
            .triggers
            .iter()
            .map(|t| {
                let rt = runtime.get(&t.name).cloned().unwrap_or_default();
                TriggerStatus {
                    name: t.name.clone(),
                    action: t.action,
                    enabled: t.enabled,
                    interval_minutes: t.interval_for(now.hour(), &state.config.peak),
                    last_run_at: rt.last_run_at,
                    next_run_at: rt.next_run_at,
                }
            })
            .collect();
        SchedulerStatus {
            running: state.running,
            mode: state.config.mode_at(now.hour()),
            triggers,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for timer in self.lock().timers.drain(..) {
            timer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Timer task
// ---------------------------------------------------------------------------

struct TriggerTask {
    trigger: ScheduleTrigger,
    peak: PeakWindow,
    startup_delay: Duration,
    handler: Arc<dyn TriggerHandler>,
    clock: Arc<dyn Clock>,
    runtime: RuntimeMap,
}

impl TriggerTask {
    async fn run(self) {
        if self.trigger.run_on_startup {
            self.clock.sleep(self.startup_delay).await;
            self.fire();
        }
        loop {
            let now = self.clock.wall_now();
            let next = self.trigger.next_fire_at(now, &self.peak);
            if let Some(rt) = lock_runtime(&self.runtime).get_mut(&self.trigger.name) {
                rt.next_run_at = Some(next.with_timezone(&Utc));
            }
            debug!(trigger = %self.trigger.name, next = %next, "next tick scheduled");
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            self.clock.sleep(wait).await;
            self.fire();
        }
    }

    fn fire(&self) {
        let now = self.clock.wall_now().with_timezone(&Utc);
        if let Some(rt) = lock_runtime(&self.runtime).get_mut(&self.trigger.name) {
            rt.last_run_at = Some(now);
        }
        info!(trigger = %self.trigger.name, action = %self.trigger.action, "tick");

        let handler = Arc::clone(&self.handler);
        let action = self.trigger.action;
        let name = self.trigger.name.clone();
        tokio::spawn(async move {
            match handler.run(action, &name).await {
                Ok(()) => {}
                Err(SyncError::Busy) => {
                    info!(trigger = %name, "skipped: a batch is already running")
                }
                Err(SyncError::RecentlyRun { until }) => {
                    info!(trigger = %name, %until, "skipped: batch ran recently")
                }
                Err(e) => error!(trigger = %name, error = %e, "scheduled sync failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use racing_api::FixedClock;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(TriggerAction, String)>>,
        busy: bool,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl TriggerHandler for Recorder {
        fn run(&self, action: TriggerAction, trigger: &str) -> BoxFuture<'_, Result<()>> {
            self.calls
                .lock()
                .unwrap()
                .push((action, trigger.to_string()));
            let busy = self.busy;
            Box::pin(async move {
                if busy {
                    Err(SyncError::Busy)
                } else {
                    Ok(())
                }
            })
        }
    }

    fn noon() -> Arc<FixedClock> {
        let wall = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 4, 12, 0, 0)
            .unwrap();
        Arc::new(FixedClock::new(wall))
    }

    fn hourly() -> ScheduleConfig {
        ScheduleConfig {
            triggers: vec![ScheduleTrigger::new("results", TriggerAction::Results, 60)],
            ..ScheduleConfig::default()
        }
    }

    fn scheduler(config: ScheduleConfig, recorder: &Arc<Recorder>) -> Scheduler {
        Scheduler::new(
            config,
            ScheduleValidator::default(),
            Arc::clone(recorder) as Arc<dyn TriggerHandler>,
            noon(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_interval() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(hourly(), &recorder);
        s.start();

        tokio::time::sleep(Duration::from_secs(60 * 60 - 1)).await;
        assert_eq!(recorder.count(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.count(), 1);
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(hourly(), &recorder);
        s.start();
        s.start();
        assert!(s.is_running());

        tokio::time::sleep(Duration::from_secs(60 * 60 + 1)).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_future_ticks() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(hourly(), &recorder);
        s.start();
        tokio::time::sleep(Duration::from_secs(60 * 60 + 1)).await;
        s.stop();
        assert!(!s.is_running());

        tokio::time::sleep(Duration::from_secs(5 * 60 * 60)).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_on_startup_fires_after_delay() {
        let recorder = Arc::new(Recorder::default());
        let mut cfg = hourly();
        cfg.triggers[0].run_on_startup = true;
        cfg.startup_delay_secs = 10;
        let s = scheduler(cfg, &recorder);
        s.start();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(recorder.count(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.count(), 1);
        assert_eq!(recorder.calls.lock().unwrap()[0].1, "results");
    }

    #[tokio::test(start_paused = true)]
    async fn busy_handler_does_not_stop_ticks() {
        let recorder = Arc::new(Recorder {
            busy: true,
            ..Recorder::default()
        });
        let s = scheduler(hourly(), &recorder);
        s.start();
        tokio::time::sleep(Duration::from_secs(2 * 60 * 60 + 1)).await;
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_next_run_and_mode() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(hourly(), &recorder);
        s.start();
        tokio::task::yield_now().await;

        let status = s.status();
        assert!(status.running);
        assert_eq!(status.mode, ScheduleMode::Normal);
        let t = &status.triggers[0];
        assert_eq!(t.interval_minutes, 60);
        assert_eq!(
            t.next_run_at.unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 4, 13, 0, 0).unwrap()
        );
        assert!(t.last_run_at.is_none());
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let recorder = Arc::new(Recorder::default());
        let cfg = ScheduleConfig {
            triggers: vec![ScheduleTrigger::new("riders", TriggerAction::Riders, 10)],
            ..ScheduleConfig::default()
        };
        let err = Scheduler::new(
            cfg,
            ScheduleValidator::default(),
            recorder as Arc<dyn TriggerHandler>,
            noon(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_swaps_triggers() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(hourly(), &recorder);
        s.start();
        let cfg = ScheduleConfig {
            triggers: vec![ScheduleTrigger::new("events", TriggerAction::Events, 30)],
            ..ScheduleConfig::default()
        };
        s.restart(cfg).unwrap();
        assert!(s.is_running());

        tokio::time::sleep(Duration::from_secs(30 * 60 + 1)).await;
        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(TriggerAction::Events, "events".to_string())]);
        assert_eq!(s.status().triggers.len(), 1);
    }
}
