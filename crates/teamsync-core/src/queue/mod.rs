//! Priority work queue with a single background worker.
//!
//! `enqueue` is instant and never performs I/O; the worker drains items one at
//! a time through an injected [`ItemSyncer`], which is expected to route its
//! remote calls through the rate-budgeted client and may therefore block.
//!
//! Ordering is `(tier, seq)`: lower tier first, FIFO within a tier. A retry
//! takes a fresh `seq`, so it goes to the tail of its own tier.

mod item;

pub use item::{
    EntityKey, EntityKind, ItemId, ItemStatus, QueueEvent, QueueEventKind, QueueStatus, Tier,
    WorkItem,
};

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use racing_api::{CallError, Clock};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::store::UpsertSummary;

// ---------------------------------------------------------------------------
// ItemSyncer
// ---------------------------------------------------------------------------

/// Performs the actual sync of one entity.
pub trait ItemSyncer: Send + Sync {
    fn sync(&self, key: EntityKey) -> BoxFuture<'_, std::result::Result<UpsertSummary, CallError>>;
}

// ---------------------------------------------------------------------------
// QueueOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Attempts before an item is marked failed.
    pub max_retries: u32,
    /// How long completed items stay visible.
    pub retention: Duration,
    /// Pause between successive items.
    pub inter_item_delay: Duration,
    pub event_capacity: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retention: Duration::from_secs(600),
            inter_item_delay: Duration::ZERO,
            event_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Slot {
    item: WorkItem,
    seq: u64,
    finished: Option<Instant>,
    observed: bool,
}

#[derive(Default)]
struct QueueState {
    items: HashMap<ItemId, Slot>,
    order: BTreeMap<(Tier, u64), ItemId>,
    /// Non-terminal items only.
    by_key: HashMap<EntityKey, ItemId>,
    next_seq: u64,
    processing: Option<ItemId>,
    worker_running: bool,
}

impl QueueState {
    fn schedule(&mut self, id: ItemId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(slot) = self.items.get_mut(&id) {
            slot.seq = seq;
            self.order.insert((slot.item.tier, seq), id);
        }
    }

    /// Drop completed items past retention or already seen by a waiter.
    fn collect_garbage(&mut self, now: Instant, retention: Duration) {
        self.items.retain(|_, slot| {
            if slot.item.status != ItemStatus::Completed {
                return true;
            }
            let expired = slot.finished.is_some_and(|t| now >= t + retention);
            !(expired || slot.observed)
        });
    }
}

struct Inner {
    state: Mutex<QueueState>,
    syncer: Arc<dyn ItemSyncer>,
    clock: Arc<dyn Clock>,
    options: QueueOptions,
    events: broadcast::Sender<QueueEvent>,
    changed: watch::Sender<u64>,
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// Cheap to clone; all clones share one queue and one worker.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(syncer: Arc<dyn ItemSyncer>, clock: Arc<dyn Clock>, options: QueueOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                syncer,
                clock,
                options,
                events,
                changed,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.inner.clock.wall_now().with_timezone(&Utc)
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
        self.inner.changed.send_modify(|g| *g = g.wrapping_add(1));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Add work for `key`. Returns the existing id if `key` already has a
    /// pending or processing item.
    pub fn enqueue(&self, key: EntityKey, tier: Tier, requested_by: &str) -> ItemId {
        let event = {
            let mut st = self.lock();
            if let Some(existing) = st.by_key.get(&key) {
                debug!(%key, item_id = %existing, "already queued");
                return *existing;
            }
            let id = Uuid::new_v4();
            let item = WorkItem {
                id,
                key,
                tier,
                status: ItemStatus::Pending,
                retry_count: 0,
                last_error: None,
                requested_by: requested_by.to_string(),
                enqueued_at: self.wall_now(),
                started_at: None,
                completed_at: None,
                outcome: None,
            };
            let event = QueueEvent::of(QueueEventKind::Enqueued, &item);
            st.items.insert(
                id,
                Slot {
                    item,
                    seq: 0,
                    finished: None,
                    observed: false,
                },
            );
            st.by_key.insert(key, id);
            st.schedule(id);
            event
        };
        debug!(key = %event.key, tier, item_id = %event.item_id, "enqueued");
        let id = event.item_id;
        self.emit(event);
        self.ensure_worker();
        id
    }

    pub fn enqueue_bulk(
        &self,
        entries: impl IntoIterator<Item = (EntityKey, Tier)>,
        requested_by: &str,
    ) -> Vec<ItemId> {
        entries
            .into_iter()
            .map(|(key, tier)| self.enqueue(key, tier, requested_by))
            .collect()
    }

    /// Remove a pending item. `Ok(false)` if it is processing or terminal.
    pub fn cancel(&self, id: ItemId) -> Result<bool> {
        let event = {
            let mut st = self.lock();
            let slot = st
                .items
                .get(&id)
                .ok_or_else(|| SyncError::ItemNotFound(id.to_string()))?;
            if slot.item.status != ItemStatus::Pending {
                return Ok(false);
            }
            let order_key = (slot.item.tier, slot.seq);
            let key = slot.item.key;
            st.order.remove(&order_key);
            st.by_key.remove(&key);
            match st.items.remove(&id) {
                Some(slot) => QueueEvent::of(QueueEventKind::Cancelled, &slot.item),
                None => return Ok(false),
            }
        };
        info!(key = %event.key, item_id = %id, "cancelled");
        self.emit(event);
        Ok(true)
    }

    /// Reset a failed item to pending with a fresh retry budget.
    pub fn retry(&self, id: ItemId) -> Result<bool> {
        let retried = {
            let mut st = self.lock();
            let key = st
                .items
                .get(&id)
                .ok_or_else(|| SyncError::ItemNotFound(id.to_string()))?
                .item
                .key;
            self.reset_failed(&mut st, id, key)
        };
        if let Some(event) = retried {
            self.emit(event);
            self.ensure_worker();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn retry_all_failed(&self) -> usize {
        let events: Vec<QueueEvent> = {
            let mut st = self.lock();
            let mut failed: Vec<(DateTime<Utc>, ItemId, EntityKey)> = st
                .items
                .values()
                .filter(|s| s.item.status == ItemStatus::Failed)
                .map(|s| (s.item.completed_at.unwrap_or(s.item.enqueued_at), s.item.id, s.item.key))
                .collect();
            failed.sort();
            failed
                .into_iter()
                .filter_map(|(_, id, key)| self.reset_failed(&mut st, id, key))
                .collect()
        };
        let count = events.len();
        if count > 0 {
            info!(count, "retrying failed items");
            for event in events {
                self.emit(event);
            }
            self.ensure_worker();
        }
        count
    }

    fn reset_failed(&self, st: &mut QueueState, id: ItemId, key: EntityKey) -> Option<QueueEvent> {
        if st.by_key.contains_key(&key) {
            // A newer item for the same entity is already in flight.
            return None;
        }
        let slot = st.items.get_mut(&id)?;
        if slot.item.status != ItemStatus::Failed {
            return None;
        }
        slot.item.status = ItemStatus::Pending;
        slot.item.retry_count = 0;
        slot.item.last_error = None;
        slot.item.started_at = None;
        slot.item.completed_at = None;
        slot.finished = None;
        let event = QueueEvent::of(QueueEventKind::Retry, &slot.item);
        st.by_key.insert(key, id);
        st.schedule(id);
        Some(event)
    }

    /// Drop every retained completed item. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let mut st = self.lock();
        let before = st.items.len();
        st.items
            .retain(|_, slot| slot.item.status != ItemStatus::Completed);
        before - st.items.len()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_status(&self) -> QueueStatus {
        let now = self.inner.clock.now();
        let mut st = self.lock();
        st.collect_garbage(now, self.inner.options.retention);

        let pending: Vec<WorkItem> = st
            .order
            .values()
            .filter_map(|id| st.items.get(id).map(|s| s.item.clone()))
            .collect();
        let mut failed: Vec<WorkItem> = st
            .items
            .values()
            .filter(|s| s.item.status == ItemStatus::Failed)
            .map(|s| s.item.clone())
            .collect();
        failed.sort_by_key(|i| i.completed_at);
        let completed_count = st
            .items
            .values()
            .filter(|s| s.item.status == ItemStatus::Completed)
            .count();
        let processing = st
            .processing
            .and_then(|id| st.items.get(&id))
            .map(|s| s.item.clone());

        QueueStatus {
            queue_depth: pending.len(),
            processing,
            pending,
            failed,
            completed_count,
            worker_running: st.worker_running,
        }
    }

    /// Current state of one item. Observing a completed item releases it.
    pub fn get_item(&self, id: ItemId) -> Option<WorkItem> {
        let now = self.inner.clock.now();
        let mut st = self.lock();
        st.collect_garbage(now, self.inner.options.retention);
        let slot = st.items.get_mut(&id)?;
        if slot.item.status == ItemStatus::Completed {
            slot.observed = true;
        }
        Some(slot.item.clone())
    }

    /// Wait until every id is terminal, then return their final states.
    /// Ids the queue no longer knows (cancelled or collected) are skipped.
    pub async fn wait_for(&self, ids: &[ItemId]) -> Vec<WorkItem> {
        let mut changed = self.inner.changed.subscribe();
        loop {
            {
                let mut st = self.lock();
                let done = ids.iter().all(|id| {
                    st.items
                        .get(id)
                        .map_or(true, |s| s.item.status.is_terminal())
                });
                if done {
                    return ids
                        .iter()
                        .filter_map(|id| {
                            let slot = st.items.get_mut(id)?;
                            slot.observed = true;
                            Some(slot.item.clone())
                        })
                        .collect();
                }
            }
            if changed.changed().await.is_err() {
                return Vec::new();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    fn ensure_worker(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, queue worker not started");
            return;
        };
        {
            let mut st = self.lock();
            if st.worker_running {
                return;
            }
            st.worker_running = true;
        }
        let queue = self.clone();
        handle.spawn(async move { queue.run_worker().await });
    }

    async fn run_worker(self) {
        info!("queue worker started");
        let mut first = true;
        loop {
            if !first && !self.inner.options.inter_item_delay.is_zero() {
                self.inner
                    .clock
                    .sleep(self.inner.options.inter_item_delay)
                    .await;
            }
            first = false;

            let Some(event) = self.take_next() else {
                info!("queue drained, worker idle");
                self.inner.changed.send_modify(|g| *g = g.wrapping_add(1));
                return;
            };
            debug!(key = %event.key, item_id = %event.item_id, attempt = event.retry_count + 1, "processing");
            let (id, key) = (event.item_id, event.key);
            self.emit(event);

            let outcome = AssertUnwindSafe(self.inner.syncer.sync(key))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(CallError::Transient(panic_message(panic))));
            self.finish(id, outcome);
        }
    }

    fn take_next(&self) -> Option<QueueEvent> {
        let now = self.wall_now();
        let mut st = self.lock();
        loop {
            let Some((_, id)) = st.order.pop_first() else {
                st.worker_running = false;
                return None;
            };
            let Some(slot) = st.items.get_mut(&id) else {
                continue;
            };
            slot.item.status = ItemStatus::Processing;
            slot.item.started_at = Some(now);
            let event = QueueEvent::of(QueueEventKind::Processing, &slot.item);
            st.processing = Some(id);
            return Some(event);
        }
    }

    fn finish(&self, id: ItemId, outcome: std::result::Result<UpsertSummary, CallError>) {
        let wall = self.wall_now();
        let mono = self.inner.clock.now();
        let max_retries = self.inner.options.max_retries;

        let event = {
            let mut st = self.lock();
            st.processing = None;
            let QueueState {
                items,
                order,
                by_key,
                next_seq,
                ..
            } = &mut *st;
            let Some(slot) = items.get_mut(&id) else {
                return;
            };
            let item = &mut slot.item;

            let kind = match outcome {
                Ok(summary) => {
                    item.status = ItemStatus::Completed;
                    item.outcome = Some(summary);
                    item.last_error = None;
                    QueueEventKind::Completed
                }
                Err(err) if !err.is_retryable() => {
                    info!(key = %item.key, error = %err, "skipping item");
                    item.status = ItemStatus::Failed;
                    item.last_error = Some(err.to_string());
                    QueueEventKind::Failed
                }
                Err(err) => {
                    item.retry_count += 1;
                    item.last_error = Some(err.to_string());
                    if item.retry_count < max_retries {
                        warn!(key = %item.key, retry_count = item.retry_count, error = %err, "sync failed, requeueing");
                        item.status = ItemStatus::Pending;
                        slot.seq = *next_seq;
                        *next_seq += 1;
                        order.insert((item.tier, slot.seq), id);
                        QueueEventKind::Retry
                    } else {
                        error!(key = %item.key, retry_count = item.retry_count, error = %err, "sync failed, giving up");
                        item.status = ItemStatus::Failed;
                        QueueEventKind::Failed
                    }
                }
            };
            if item.status.is_terminal() {
                item.completed_at = Some(wall);
                slot.finished = Some(mono);
                by_key.remove(&item.key);
            }
            QueueEvent::of(kind, item)
        };
        if event.kind == QueueEventKind::Completed {
            debug!(key = %event.key, item_id = %id, "completed");
        }
        self.emit(event);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("sync task panicked: {detail}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use racing_api::SystemClock;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    enum Step {
        Ok,
        Fail(CallError),
        Panic,
    }

    #[derive(Default)]
    struct ScriptedSyncer {
        scripts: Mutex<HashMap<EntityKey, VecDeque<Step>>>,
        log: Mutex<Vec<EntityKey>>,
        hold: Mutex<Option<(EntityKey, Arc<Notify>)>>,
    }

    impl ScriptedSyncer {
        fn script(&self, key: EntityKey, steps: Vec<Step>) {
            self.scripts.lock().unwrap().insert(key, steps.into());
        }

        fn hold(&self, key: EntityKey) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.hold.lock().unwrap() = Some((key, Arc::clone(&gate)));
            gate
        }

        fn log(&self) -> Vec<EntityKey> {
            self.log.lock().unwrap().clone()
        }
    }

    impl ItemSyncer for ScriptedSyncer {
        fn sync(&self, key: EntityKey) -> BoxFuture<'_, std::result::Result<UpsertSummary, CallError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(key);
                let gate = self
                    .hold
                    .lock()
                    .unwrap()
                    .as_ref()
                    .filter(|(k, _)| *k == key)
                    .map(|(_, g)| Arc::clone(g));
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                let step = self
                    .scripts
                    .lock()
                    .unwrap()
                    .get_mut(&key)
                    .and_then(|s| s.pop_front())
                    .unwrap_or(Step::Ok);
                match step {
                    Step::Ok => Ok(UpsertSummary { new: 1, updated: 0 }),
                    Step::Fail(e) => Err(e),
                    Step::Panic => panic!("boom"),
                }
            })
        }
    }

    fn queue(syncer: &Arc<ScriptedSyncer>) -> WorkQueue {
        WorkQueue::new(
            Arc::clone(syncer) as Arc<dyn ItemSyncer>,
            Arc::new(SystemClock),
            QueueOptions::default(),
        )
    }

    fn transient() -> Step {
        Step::Fail(CallError::Transient("connection reset".into()))
    }

    async fn wait_processing(rx: &mut broadcast::Receiver<QueueEvent>, key: EntityKey) {
        loop {
            let ev = rx.recv().await.unwrap();
            if ev.kind == QueueEventKind::Processing && ev.key == key {
                return;
            }
        }
    }

    #[tokio::test]
    async fn duplicate_enqueue_returns_existing_id() {
        let syncer = Arc::new(ScriptedSyncer::default());
        let q = queue(&syncer);
        let a = q.enqueue(EntityKey::rider(1), 2, "test");
        let b = q.enqueue(EntityKey::rider(1), 1, "test");
        assert_eq!(a, b);
        assert_eq!(q.get_status().queue_depth, 1);

        q.wait_for(&[a]).await;
        assert_eq!(syncer.log(), vec![EntityKey::rider(1)]);
    }

    #[tokio::test]
    async fn drains_by_tier_then_fifo() {
        let syncer = Arc::new(ScriptedSyncer::default());
        let q = queue(&syncer);
        let a = q.enqueue(EntityKey::rider(1), 1, "test");
        let b = q.enqueue(EntityKey::rider(2), 2, "test");
        let c = q.enqueue(EntityKey::rider(3), 1, "test");

        q.wait_for(&[a, b, c]).await;
        assert_eq!(
            syncer.log(),
            vec![EntityKey::rider(1), EntityKey::rider(3), EntityKey::rider(2)]
        );
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds() {
        let syncer = Arc::new(ScriptedSyncer::default());
        syncer.script(EntityKey::rider(7), vec![transient(), transient(), Step::Ok]);
        let q = queue(&syncer);
        let id = q.enqueue(EntityKey::rider(7), 1, "test");

        let done = q.wait_for(&[id]).await;
        assert_eq!(done[0].status, ItemStatus::Completed);
        assert_eq!(done[0].retry_count, 2);
        assert_eq!(syncer.log().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_then_retry_all_reprocesses() {
        let syncer = Arc::new(ScriptedSyncer::default());
        syncer.script(
            EntityKey::rider(7),
            vec![transient(), transient(), transient()],
        );
        let q = queue(&syncer);
        let id = q.enqueue(EntityKey::rider(7), 1, "test");

        let done = q.wait_for(&[id]).await;
        assert_eq!(done[0].status, ItemStatus::Failed);
        assert_eq!(done[0].retry_count, 3);
        assert_eq!(syncer.log().len(), 3);
        let status = q.get_status();
        assert_eq!(status.failed.len(), 1);
        assert_eq!(status.failed[0].id, id);

        assert_eq!(q.retry_all_failed(), 1);
        let item = q.get_item(id).unwrap();
        assert!(matches!(item.status, ItemStatus::Pending | ItemStatus::Processing));
        assert_eq!(item.retry_count, 0);

        let done = q.wait_for(&[id]).await;
        assert_eq!(done[0].status, ItemStatus::Completed);
        assert_eq!(syncer.log().len(), 4);
    }

    #[tokio::test]
    async fn not_found_is_terminal_without_retry() {
        let syncer = Arc::new(ScriptedSyncer::default());
        syncer.script(EntityKey::event(5), vec![Step::Fail(CallError::NotFound)]);
        let q = queue(&syncer);
        let id = q.enqueue(EntityKey::event(5), 1, "test");

        let done = q.wait_for(&[id]).await;
        assert_eq!(done[0].status, ItemStatus::Failed);
        assert_eq!(done[0].retry_count, 0);
        assert_eq!(done[0].last_error.as_deref(), Some("entity not found"));
        assert_eq!(syncer.log().len(), 1);
    }

    #[tokio::test]
    async fn panic_in_syncer_is_retried_like_transient() {
        let syncer = Arc::new(ScriptedSyncer::default());
        syncer.script(EntityKey::rider(3), vec![Step::Panic, Step::Ok]);
        let q = queue(&syncer);
        let id = q.enqueue(EntityKey::rider(3), 1, "test");

        let done = q.wait_for(&[id]).await;
        assert_eq!(done[0].status, ItemStatus::Completed);
        assert_eq!(done[0].retry_count, 1);

        // The worker survived and keeps serving.
        let next = q.enqueue(EntityKey::rider(4), 1, "test");
        assert_eq!(q.wait_for(&[next]).await[0].status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn retry_goes_to_tail_of_tier() {
        let syncer = Arc::new(ScriptedSyncer::default());
        syncer.script(EntityKey::rider(1), vec![transient()]);
        let gate = syncer.hold(EntityKey::rider(1));
        let q = queue(&syncer);
        let mut rx = q.subscribe();

        let a = q.enqueue(EntityKey::rider(1), 1, "test");
        wait_processing(&mut rx, EntityKey::rider(1)).await;
        let b = q.enqueue(EntityKey::rider(2), 1, "test");
        gate.notify_one();
        // Second attempt of rider 1 must not block on the gate.
        *syncer.hold.lock().unwrap() = None;

        q.wait_for(&[a, b]).await;
        assert_eq!(
            syncer.log(),
            vec![EntityKey::rider(1), EntityKey::rider(2), EntityKey::rider(1)]
        );
    }

    #[tokio::test]
    async fn cancel_only_affects_pending_items() {
        let syncer = Arc::new(ScriptedSyncer::default());
        let gate = syncer.hold(EntityKey::rider(1));
        let q = queue(&syncer);
        let mut rx = q.subscribe();

        let a = q.enqueue(EntityKey::rider(1), 1, "test");
        wait_processing(&mut rx, EntityKey::rider(1)).await;
        let b = q.enqueue(EntityKey::rider(2), 1, "test");

        assert!(!q.cancel(a).unwrap());
        assert!(q.cancel(b).unwrap());
        assert!(q.get_item(b).is_none());
        assert!(matches!(q.cancel(Uuid::new_v4()), Err(SyncError::ItemNotFound(_))));

        // The key is free again once cancelled.
        let b2 = q.enqueue(EntityKey::rider(2), 1, "test");
        assert_ne!(b, b2);

        gate.notify_one();
        q.wait_for(&[a, b2]).await;
        assert_eq!(syncer.log(), vec![EntityKey::rider(1), EntityKey::rider(2)]);
    }

    #[tokio::test]
    async fn status_snapshot_shows_processing_and_pending() {
        let syncer = Arc::new(ScriptedSyncer::default());
        let gate = syncer.hold(EntityKey::rider(1));
        let q = queue(&syncer);
        let mut rx = q.subscribe();

        let a = q.enqueue(EntityKey::rider(1), 2, "test");
        wait_processing(&mut rx, EntityKey::rider(1)).await;
        q.enqueue(EntityKey::event(9), 3, "test");
        q.enqueue(EntityKey::event(8), 1, "test");

        let status = q.get_status();
        assert!(status.worker_running);
        assert_eq!(status.processing.as_ref().map(|i| i.id), Some(a));
        assert_eq!(status.queue_depth, 2);
        assert_eq!(status.pending[0].key, EntityKey::event(8));
        assert_eq!(status.pending[1].key, EntityKey::event(9));

        gate.notify_one();
    }

    #[tokio::test]
    async fn events_follow_item_lifecycle() {
        let syncer = Arc::new(ScriptedSyncer::default());
        syncer.script(EntityKey::result(4), vec![transient()]);
        let q = queue(&syncer);
        let mut rx = q.subscribe();

        let id = q.enqueue(EntityKey::result(4), 1, "test");
        q.wait_for(&[id]).await;

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(ev.kind);
        }
        assert_eq!(
            kinds,
            vec![
                QueueEventKind::Enqueued,
                QueueEventKind::Processing,
                QueueEventKind::Retry,
                QueueEventKind::Processing,
                QueueEventKind::Completed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completed_items_expire_after_retention() {
        let syncer = Arc::new(ScriptedSyncer::default());
        let q = queue(&syncer);
        let id = q.enqueue(EntityKey::rider(1), 1, "test");
        let mut rx = q.subscribe();
        loop {
            if rx.recv().await.unwrap().kind == QueueEventKind::Completed {
                break;
            }
        }
        assert_eq!(q.get_status().completed_count, 1);

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(q.get_status().completed_count, 0);
        assert!(q.get_item(id).is_none());
    }

    #[tokio::test]
    async fn re_enqueue_after_completion_creates_new_item() {
        let syncer = Arc::new(ScriptedSyncer::default());
        let q = queue(&syncer);
        let first = q.enqueue(EntityKey::rider(1), 1, "test");
        q.wait_for(&[first]).await;
        let second = q.enqueue(EntityKey::rider(1), 1, "test");
        assert_ne!(first, second);
        q.wait_for(&[second]).await;
        assert_eq!(syncer.log().len(), 2);
    }

    #[tokio::test]
    async fn clear_completed_counts_removed() {
        let syncer = Arc::new(ScriptedSyncer::default());
        let q = queue(&syncer);
        let ids = q.enqueue_bulk(
            [(EntityKey::rider(1), 1), (EntityKey::rider(2), 1)],
            "test",
        );
        let mut rx = q.subscribe();
        let mut completed = 0;
        while completed < 2 {
            if rx.recv().await.unwrap().kind == QueueEventKind::Completed {
                completed += 1;
            }
        }
        assert_eq!(ids.len(), 2);
        assert_eq!(q.clear_completed(), 2);
        assert_eq!(q.get_status().completed_count, 0);
    }
}
