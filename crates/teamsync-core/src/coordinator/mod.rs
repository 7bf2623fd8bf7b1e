//! Phase-ordered sync batches.
//!
//! A batch runs riders, then events, then results. Each phase makes its
//! direct calls (roster, bulk, upcoming) through the shared client, hands
//! per-entity work to the [`WorkQueue`] and waits for exactly the items it
//! enqueued before the next phase starts.

mod batch;
mod discovery;
mod syncer;

pub use batch::{BatchOptions, BatchRun, BatchStatus, Phase, PhaseResult, PhaseStatus};
pub(crate) use batch::{BatchInProgress, PhaseTally};
pub use discovery::{
    DiscoveryContext, ExplicitEvents, RecentEventsWithoutResults, ResultDiscovery,
};
pub use syncer::EntitySyncer;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use futures::future::{BoxFuture, FutureExt};
use racing_api::{ApiResult, Clock, RateBudgetedClient};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::queue::{EntityKey, ItemStatus, Tier, WorkItem, WorkQueue};
use crate::schedule::{PeakWindow, TriggerAction, TriggerHandler};
use crate::store::{event_start, record_id, EntityStore, EVENT_ID_FIELDS, RIDER_ID_FIELDS};
use crate::sync_log::{SyncLog, SyncLogEntry};

/// Smart sync refreshes riders off-peak once the last run is older than this.
const SMART_RIDERS_AFTER_MINUTES: i64 = 60;
const SMART_EVENTS_AFTER_MINUTES: i64 = 120;
const SMART_RESULTS_AFTER_MINUTES: i64 = 180;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Minimum spacing between manual triggers of the same phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseCooldowns {
    pub riders: Duration,
    pub events: Duration,
    pub results: Duration,
}

impl Default for PhaseCooldowns {
    fn default() -> Self {
        Self {
            riders: Duration::from_secs(5 * 60),
            events: Duration::from_secs(2 * 60),
            results: Duration::from_secs(10 * 60),
        }
    }
}

impl PhaseCooldowns {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Riders => self.riders,
            Phase::Events => self.events,
            Phase::Results => self.results,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub club_id: u64,
    pub lookforward_hours: u32,
    /// Events starting within this many minutes go to the near tier.
    pub near_event_threshold_minutes: u32,
    pub results_days_back: u32,
    pub recent_run_threshold: Duration,
    /// Horizon smart sync uses to decide whether events are imminent.
    pub near_event_hours: u32,
    pub peak: PeakWindow,
    pub riders_tier: Tier,
    pub near_event_tier: Tier,
    pub far_event_tier: Tier,
    pub results_tier: Tier,
    pub cooldowns: PhaseCooldowns,
    pub adhoc_attempts: u32,
    pub adhoc_backoff: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            club_id: 0,
            lookforward_hours: 48,
            near_event_threshold_minutes: 120,
            results_days_back: 7,
            recent_run_threshold: Duration::from_secs(30 * 60),
            near_event_hours: 24,
            peak: PeakWindow::default(),
            riders_tier: 2,
            near_event_tier: 1,
            far_event_tier: 3,
            results_tier: 2,
            cooldowns: PhaseCooldowns::default(),
            adhoc_attempts: 3,
            adhoc_backoff: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted { phase: Phase },
    Busy,
    RateLimitedUntil { until: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub minutes_since_last_run: Option<i64>,
}

/// What smart sync decided and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmartPlan {
    pub peak: bool,
    pub minutes_since_last: Option<i64>,
    pub near_events: usize,
    pub options: BatchOptions,
}

// ---------------------------------------------------------------------------
// BatchCoordinator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CoordinatorState {
    last_completed: Option<DateTime<Utc>>,
    last_run: Option<BatchRun>,
    manual: HashMap<Phase, Instant>,
}

/// Clears the running flag on every exit path, panics included.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        take_flag(flag).then(|| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owned form of [`RunGuard`] for batches handed to a background task. The
/// flag is held from the moment a trigger is accepted until the task ends
/// or is dropped unpolled.
struct BackgroundRun(Arc<BatchCoordinator>);

impl BackgroundRun {
    fn acquire(coordinator: &Arc<BatchCoordinator>) -> Option<Self> {
        take_flag(&coordinator.running).then(|| Self(Arc::clone(coordinator)))
    }
}

impl Drop for BackgroundRun {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

fn take_flag(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

pub struct BatchCoordinator {
    client: Arc<RateBudgetedClient>,
    queue: WorkQueue,
    store: Arc<dyn EntityStore>,
    log: Arc<dyn SyncLog>,
    discovery: Arc<dyn ResultDiscovery>,
    clock: Arc<dyn Clock>,
    options: CoordinatorOptions,
    running: AtomicBool,
    state: Mutex<CoordinatorState>,
}

impl BatchCoordinator {
    /// Restores the last completion time from `log`.
    pub fn new(
        client: Arc<RateBudgetedClient>,
        queue: WorkQueue,
        store: Arc<dyn EntityStore>,
        log: Arc<dyn SyncLog>,
        clock: Arc<dyn Clock>,
        options: CoordinatorOptions,
    ) -> Self {
        let last_completed = match log.last_completed() {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "could not read sync log, starting without history");
                None
            }
        };
        if let Some(at) = last_completed {
            info!(last_completed = %at, "restored last sync time");
        }
        let discovery = Arc::new(RecentEventsWithoutResults {
            days_back: options.results_days_back,
        });
        Self {
            client,
            queue,
            store,
            log,
            discovery,
            clock,
            options,
            running: AtomicBool::new(false),
            state: Mutex::new(CoordinatorState {
                last_completed,
                ..CoordinatorState::default()
            }),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn ResultDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn client(&self) -> &Arc<RateBudgetedClient> {
        &self.client
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.clock.wall_now().with_timezone(&Utc)
    }

    fn elapsed_ms(&self, since: Instant) -> u64 {
        let ms = self.clock.now().saturating_duration_since(since).as_millis();
        u64::try_from(ms).unwrap_or(u64::MAX)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let last_completed_at = self.lock().last_completed;
        let now = self.wall_now();
        CoordinatorStatus {
            running: self.is_running(),
            last_completed_at,
            minutes_since_last_run: last_completed_at.map(|t| (now - t).num_minutes()),
        }
    }

    pub fn last_batch(&self) -> Option<BatchRun> {
        self.lock().last_run.clone()
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Run the phases `options` does not skip, in order.
    ///
    /// Fails only with `Busy` when another batch is in flight, or with
    /// `RecentlyRun` when not forced and the previous completion is too
    /// recent. Phase failures are reported inside the returned [`BatchRun`].
    pub async fn execute_batch(&self, options: BatchOptions, requested_by: &str) -> Result<BatchRun> {
        let _guard = RunGuard::acquire(&self.running).ok_or(SyncError::Busy)?;
        self.run_batch(options, requested_by).await
    }

    /// Batch body. The caller holds the running flag.
    async fn run_batch(&self, options: BatchOptions, requested_by: &str) -> Result<BatchRun> {
        if !options.force {
            if let Some(until) = self.recent_run_until() {
                return Err(SyncError::RecentlyRun { until });
            }
        }

        let started = self.clock.now();
        let mut run = BatchInProgress::start(requested_by, self.wall_now());
        info!(batch_id = %run.id(), requested_by, "batch started");

        for phase in Phase::ALL {
            if options.skips(phase) {
                debug!(%phase, "phase skipped");
                run.push(PhaseResult::skipped(phase));
                continue;
            }
            let result = self.execute_phase(phase).await;
            self.append_log(run.id(), &result);
            run.push(result);
        }

        let batch = run.finish(self.wall_now(), self.elapsed_ms(started));
        info!(
            batch_id = %batch.id,
            status = ?batch.status,
            duration_ms = batch.duration_ms,
            "batch finished: {}",
            batch.summary
        );
        {
            let mut state = self.lock();
            let completed = batch
                .phases
                .iter()
                .any(|p| matches!(p.status, PhaseStatus::Success | PhaseStatus::Partial));
            if completed {
                state.last_completed = Some(batch.completed_at);
            }
            state.last_run = Some(batch.clone());
        }
        Ok(batch)
    }

    fn recent_run_until(&self) -> Option<DateTime<Utc>> {
        let last = self.lock().last_completed?;
        let threshold = chrono::Duration::from_std(self.options.recent_run_threshold).ok()?;
        let until = last + threshold;
        (self.wall_now() < until).then_some(until)
    }

    fn append_log(&self, batch_id: Uuid, result: &PhaseResult) {
        let entry = SyncLogEntry::from_phase(batch_id, result, self.wall_now());
        if let Err(e) = self.log.append(&entry) {
            warn!(phase = %result.phase, error = %e, "failed to write sync log");
        }
    }

    /// Decide which phases are worth running right now.
    pub fn plan_smart_sync(&self) -> SmartPlan {
        let wall = self.clock.wall_now();
        let now = wall.with_timezone(&Utc);
        let peak = self.options.peak.contains(wall.hour());
        let minutes_since_last = self.lock().last_completed.map(|t| (now - t).num_minutes());
        let horizon = chrono::Duration::hours(i64::from(self.options.near_event_hours));
        let near_events = match self.store.upcoming_events(now, horizon) {
            Ok(events) => events.len(),
            Err(e) => {
                warn!(error = %e, "could not read upcoming events");
                0
            }
        };
        let older_than = |minutes: i64| minutes_since_last.map_or(true, |m| m > minutes);
        SmartPlan {
            peak,
            minutes_since_last,
            near_events,
            options: BatchOptions {
                skip_riders: !(peak || older_than(SMART_RIDERS_AFTER_MINUTES)),
                skip_events: !(near_events > 0 || older_than(SMART_EVENTS_AFTER_MINUTES)),
                skip_results: !older_than(SMART_RESULTS_AFTER_MINUTES),
                force: true,
            },
        }
    }

    pub async fn execute_smart_sync(&self) -> Result<BatchRun> {
        let _guard = RunGuard::acquire(&self.running).ok_or(SyncError::Busy)?;
        let plan = self.plan_smart_sync();
        log_plan(&plan);
        self.run_batch(plan.options, "smart").await
    }

    // -----------------------------------------------------------------------
    // Manual triggers
    // -----------------------------------------------------------------------

    /// Start a single-phase batch in the background.
    ///
    /// The running flag is taken before replying and handed to the spawned
    /// task, so `Accepted` means the batch will run. The phase cooldown is
    /// only recorded for accepted triggers.
    pub fn trigger_phase(self: &Arc<Self>, phase: Phase) -> TriggerOutcome {
        let Some(handle) = runtime_handle() else {
            return TriggerOutcome::Busy;
        };
        let run = {
            let mut state = self.lock();
            let now = self.clock.now();
            let cooldown = self.options.cooldowns.for_phase(phase);
            if let Some(last) = state.manual.get(&phase) {
                let elapsed = now.saturating_duration_since(*last);
                if elapsed < cooldown {
                    let remaining = chrono::Duration::from_std(cooldown - elapsed)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    return TriggerOutcome::RateLimitedUntil {
                        until: self.wall_now() + remaining,
                    };
                }
            }
            let Some(run) = BackgroundRun::acquire(self) else {
                return TriggerOutcome::Busy;
            };
            state.manual.insert(phase, now);
            run
        };
        let requested_by = format!("manual:{phase}");
        spawn_run(&handle, run, BatchOptions::only(phase), requested_by);
        TriggerOutcome::Accepted { phase }
    }

    /// Start a smart sync in the background and return the plan it runs.
    /// `None` if a batch is already running.
    pub fn trigger_smart(self: &Arc<Self>) -> Option<SmartPlan> {
        let handle = runtime_handle()?;
        let run = BackgroundRun::acquire(self)?;
        let plan = self.plan_smart_sync();
        log_plan(&plan);
        spawn_run(&handle, run, plan.options.clone(), "smart".to_string());
        Some(plan)
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn execute_phase(&self, phase: Phase) -> PhaseResult {
        let started = self.clock.now();
        info!(%phase, "phase started");
        let outcome = AssertUnwindSafe(self.run_phase(phase)).catch_unwind().await;
        let ms = self.elapsed_ms(started);
        let result = match outcome {
            Ok(Ok(tally)) => tally.into_result(phase, ms),
            Ok(Err(e)) => {
                error!(%phase, error = %e, "phase failed");
                PhaseResult::failed(phase, e.to_string(), ms)
            }
            Err(_) => {
                error!(%phase, "phase panicked");
                PhaseResult::failed(phase, "phase panicked", ms)
            }
        };
        info!(
            %phase,
            status = ?result.status,
            processed = result.items_processed,
            new = result.items_new,
            updated = result.items_updated,
            failed = result.items_failed,
            duration_ms = ms,
            "phase finished"
        );
        result
    }

    async fn run_phase(&self, phase: Phase) -> Result<PhaseTally> {
        match phase {
            Phase::Riders => self.sync_riders().await,
            Phase::Events => self.sync_events().await,
            Phase::Results => self.sync_results().await,
        }
    }

    /// Roster, then one bulk fetch, then per-rider items for whatever the
    /// bulk response did not cover.
    async fn sync_riders(&self) -> Result<PhaseTally> {
        let club_id = self.options.club_id;
        let roster = self
            .adhoc("club roster", || self.client.fetch_club_members(club_id))
            .await?;
        let mut missing: BTreeSet<u64> = roster
            .iter()
            .filter_map(|r| record_id(r, RIDER_ID_FIELDS))
            .collect();
        let mut tally = PhaseTally::default();
        if missing.is_empty() {
            warn!(club_id, "club roster is empty");
            return Ok(tally);
        }

        let wanted: Vec<u64> = missing.iter().copied().collect();
        match self
            .adhoc("rider bulk", || self.client.fetch_riders_bulk(&wanted))
            .await
        {
            Ok(records) => match self.store.upsert_riders(&records) {
                Ok(summary) => {
                    for id in records.iter().filter_map(|r| record_id(r, RIDER_ID_FIELDS)) {
                        if missing.remove(&id) {
                            tally.processed += 1;
                        }
                    }
                    tally.upserts += summary;
                }
                Err(e) => warn!(error = %e, "bulk upsert failed, queueing riders individually"),
            },
            Err(e) => warn!(
                error = %e,
                riders = wanted.len(),
                "bulk fetch failed, queueing riders individually"
            ),
        }

        if !missing.is_empty() {
            debug!(count = missing.len(), "riders left for the queue");
            let tier = self.options.riders_tier;
            let entries = missing.into_iter().map(|id| (EntityKey::rider(id), tier));
            self.drain(entries, "batch:riders", &mut tally).await;
        }
        Ok(tally)
    }

    async fn sync_events(&self) -> Result<PhaseTally> {
        let hours = self.options.lookforward_hours;
        let upcoming = self
            .adhoc("upcoming events", || self.client.fetch_upcoming_events(hours))
            .await?;
        let now = self.wall_now();
        let threshold = chrono::Duration::minutes(i64::from(self.options.near_event_threshold_minutes));

        let mut entries = Vec::with_capacity(upcoming.len());
        let mut near = 0usize;
        for record in &upcoming {
            let Some(id) = record_id(record, EVENT_ID_FIELDS) else {
                warn!("upcoming event without an id");
                continue;
            };
            let tier = if event_start(record).is_some_and(|t| t - now <= threshold) {
                near += 1;
                self.options.near_event_tier
            } else {
                self.options.far_event_tier
            };
            entries.push((EntityKey::event(id), tier));
        }
        info!(events = entries.len(), near, "upcoming events");

        let mut tally = PhaseTally::default();
        self.drain(entries, "batch:events", &mut tally).await;
        Ok(tally)
    }

    async fn sync_results(&self) -> Result<PhaseTally> {
        let ctx = DiscoveryContext {
            now: self.wall_now(),
            store: self.store.as_ref(),
        };
        let event_ids = self.discovery.discover(ctx).await?;
        info!(
            strategy = self.discovery.name(),
            events = event_ids.len(),
            "events awaiting results"
        );
        let tier = self.options.results_tier;
        let mut tally = PhaseTally::default();
        self.drain(
            event_ids.into_iter().map(|id| (EntityKey::result(id), tier)),
            "batch:results",
            &mut tally,
        )
        .await;
        Ok(tally)
    }

    /// Enqueue `entries` and wait for exactly those items to finish.
    async fn drain(
        &self,
        entries: impl IntoIterator<Item = (EntityKey, Tier)>,
        requested_by: &str,
        tally: &mut PhaseTally,
    ) {
        let ids = self.queue.enqueue_bulk(entries, requested_by);
        if ids.is_empty() {
            return;
        }
        for item in self.queue.wait_for(&ids).await {
            tally_item(tally, item);
        }
    }

    /// Direct call with bounded retries for retryable failures.
    async fn adhoc<T, F, Fut>(&self, what: &str, mut call: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let attempts = self.options.adhoc_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(what, attempt, error = %e, "call failed, retrying");
                    self.clock.sleep(self.options.adhoc_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn log_plan(plan: &SmartPlan) {
    info!(
        peak = plan.peak,
        minutes_since_last = ?plan.minutes_since_last,
        near_events = plan.near_events,
        riders = !plan.options.skip_riders,
        events = !plan.options.skip_events,
        results = !plan.options.skip_results,
        "smart sync plan"
    );
}

fn runtime_handle() -> Option<tokio::runtime::Handle> {
    let handle = tokio::runtime::Handle::try_current().ok();
    if handle.is_none() {
        warn!("no tokio runtime, background sync not started");
    }
    handle
}

fn spawn_run(
    handle: &tokio::runtime::Handle,
    run: BackgroundRun,
    options: BatchOptions,
    requested_by: String,
) {
    handle.spawn(async move {
        match run.0.run_batch(options, &requested_by).await {
            Ok(batch) => debug!(batch_id = %batch.id, "background batch done"),
            Err(e) => error!(error = %e, "background batch failed"),
        }
        drop(run);
    });
}

fn tally_item(tally: &mut PhaseTally, item: WorkItem) {
    match item.status {
        ItemStatus::Completed => tally.record_ok(item.outcome.unwrap_or_default()),
        ItemStatus::Failed => tally.record_err(format!(
            "{}: {}",
            item.key,
            item.last_error.as_deref().unwrap_or("failed")
        )),
        ItemStatus::Pending | ItemStatus::Processing => {}
    }
}

impl TriggerHandler for BatchCoordinator {
    fn run(&self, action: TriggerAction, trigger: &str) -> BoxFuture<'_, Result<()>> {
        let requested_by = format!("schedule:{trigger}");
        Box::pin(async move {
            let run = match action {
                TriggerAction::Riders => BatchOptions::only(Phase::Riders),
                TriggerAction::Events => BatchOptions::only(Phase::Events),
                TriggerAction::Results => BatchOptions::only(Phase::Results),
                TriggerAction::Full => BatchOptions::default(),
                TriggerAction::Smart => {
                    self.execute_smart_sync().await?;
                    return Ok(());
                }
            };
            self.execute_batch(run, &requested_by).await.map(|_| ())
        })
    }
}
