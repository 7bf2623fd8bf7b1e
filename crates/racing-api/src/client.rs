use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::{ApiResult, RacingApi, Record};
use crate::budget::{BudgetLimit, BudgetStatus, OperationCategory, Permit, RateBudget};
use crate::clock::Clock;
use crate::error::CallError;

// ─── ClientConfig ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on a single remote call; expiry is reported as `Transient`.
    pub request_timeout: Duration,
    /// Back-off used when the remote throttles without a `Retry-After`.
    pub throttle_fallback: Duration,
    /// Per-category overrides of the documented ceilings.
    pub limits: HashMap<OperationCategory, BudgetLimit>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            throttle_fallback: Duration::from_secs(120),
            limits: HashMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn limit_for(&self, category: OperationCategory) -> BudgetLimit {
        self.limits
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_limit())
    }
}

// ─── RateBudgetedClient ───────────────────────────────────────────────────

/// Budget state for one category.
///
/// `turnstile` is held by the caller waiting for the next free slot, so
/// waiters of one category are served in arrival order. `state` is only ever
/// locked for a check or an update, never across an await.
struct CategoryBudget {
    turnstile: tokio::sync::Mutex<()>,
    state: Mutex<RateBudget>,
}

impl CategoryBudget {
    fn new(budget: RateBudget) -> Self {
        Self {
            turnstile: tokio::sync::Mutex::new(()),
            state: Mutex::new(budget),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateBudget> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single chokepoint for outbound calls.
///
/// Every attempt takes its slot from its category budget: concurrent
/// callers of the same category can never both observe the last free slot,
/// and monitoring reads stay instant while a caller is blocked.
pub struct RateBudgetedClient {
    api: Arc<dyn RacingApi>,
    clock: Arc<dyn Clock>,
    budgets: [CategoryBudget; OperationCategory::ALL.len()],
    request_timeout: Duration,
    throttle_fallback: Duration,
}

impl RateBudgetedClient {
    pub fn new(api: Arc<dyn RacingApi>, clock: Arc<dyn Clock>, config: &ClientConfig) -> Self {
        let now = clock.now();
        let budgets =
            OperationCategory::ALL.map(|c| CategoryBudget::new(RateBudget::new(config.limit_for(c), now)));
        Self {
            api,
            clock,
            budgets,
            request_timeout: config.request_timeout,
            throttle_fallback: config.throttle_fallback,
        }
    }

    fn budget(&self, category: OperationCategory) -> &CategoryBudget {
        &self.budgets[category as usize]
    }

    /// Block until `category` has a free slot, then take it.
    async fn acquire(&self, category: OperationCategory) -> Permit {
        let budget = self.budget(category);
        let _turn = budget.turnstile.lock().await;
        loop {
            let attempt = {
                let mut state = budget.lock();
                state
                    .try_consume(self.clock.now())
                    .map_err(|wait| (wait, state.max_calls()))
            };
            match attempt {
                Ok(permit) => return permit,
                Err((wait, max_calls)) => {
                    info!(
                        %category,
                        max_calls,
                        wait_ms = wait.as_millis() as u64,
                        "rate budget exhausted, waiting for window reset"
                    );
                    self.clock.sleep(wait).await;
                }
            }
        }
    }

    /// Run `request` under the budget for `category`.
    ///
    /// Exhausted budgets block the caller rather than failing. A remote
    /// "too many requests" is refunded, waited out, and retried once.
    pub async fn call<T, F, Fut>(&self, category: OperationCategory, mut request: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut throttled = false;
        loop {
            let permit = self.acquire(category).await;
            debug!(%category, "dispatching remote call");
            let outcome = match tokio::time::timeout(self.request_timeout, request()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CallError::Transient(format!(
                    "{category} call timed out after {}s",
                    self.request_timeout.as_secs()
                ))),
            };

            let retry_after = match outcome {
                Err(CallError::RateLimited { retry_after }) => retry_after,
                other => return other,
            };

            // The remote counted this call even though our window had room,
            // so it must not also eat into the local budget.
            self.budget(category).lock().refund(permit);
            let delay = retry_after.unwrap_or(self.throttle_fallback);
            if throttled {
                warn!(%category, "still throttled after back-off, giving up");
                return Err(CallError::RateLimited {
                    retry_after: Some(delay),
                });
            }
            throttled = true;
            warn!(
                %category,
                delay_secs = delay.as_secs(),
                "throttled by remote, retrying once after back-off"
            );
            self.clock.sleep(delay).await;
        }
    }

    /// Snapshot of every category's budget. Never waits on blocked callers.
    pub fn budget_status(&self) -> Vec<BudgetStatus> {
        let now = self.clock.now();
        OperationCategory::ALL
            .into_iter()
            .map(|category| self.budget(category).lock().status(category, now))
            .collect()
    }

    /// Calls consumed in the current window of `category`.
    pub fn consumed(&self, category: OperationCategory) -> u32 {
        self.budget(category).lock().consumed()
    }

    // ── Typed fetch operations ───────────────────────────────────────────

    pub async fn fetch_club_members(&self, club_id: u64) -> ApiResult<Vec<Record>> {
        self.call(OperationCategory::ClubMembers, || {
            self.api.club_members(club_id)
        })
        .await
    }

    pub async fn fetch_rider(&self, rider_id: u64) -> ApiResult<Record> {
        self.call(OperationCategory::Rider, || self.api.rider(rider_id))
            .await
    }

    pub async fn fetch_riders_bulk(&self, rider_ids: &[u64]) -> ApiResult<Vec<Record>> {
        self.call(OperationCategory::RiderBulk, || {
            self.api.riders_bulk(rider_ids.to_vec())
        })
        .await
    }

    pub async fn fetch_event(&self, event_id: u64) -> ApiResult<Record> {
        self.call(OperationCategory::EventDetails, || self.api.event(event_id))
            .await
    }

    pub async fn fetch_event_signups(&self, event_id: u64) -> ApiResult<Vec<Record>> {
        self.call(OperationCategory::EventSignups, || {
            self.api.event_signups(event_id)
        })
        .await
    }

    pub async fn fetch_event_results(&self, event_id: u64) -> ApiResult<Vec<Record>> {
        self.call(OperationCategory::EventResults, || {
            self.api.event_results(event_id)
        })
        .await
    }

    pub async fn fetch_upcoming_events(&self, hours: u32) -> ApiResult<Vec<Record>> {
        self.call(OperationCategory::UpcomingEvents, || {
            self.api.upcoming_events(hours)
        })
        .await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
