use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use tracing::debug;

use crate::error::Result;
use crate::store::EntityStore;

/// What a discovery strategy may look at.
pub struct DiscoveryContext<'a> {
    pub now: DateTime<Utc>,
    pub store: &'a dyn EntityStore,
}

/// Decides which events the results phase should fetch.
pub trait ResultDiscovery: Send + Sync {
    fn name(&self) -> &'static str;
    fn discover<'a>(&'a self, ctx: DiscoveryContext<'a>) -> BoxFuture<'a, Result<Vec<u64>>>;
}

/// Events that started within the last `days_back` days and have no results.
#[derive(Debug, Clone)]
pub struct RecentEventsWithoutResults {
    pub days_back: u32,
}

impl ResultDiscovery for RecentEventsWithoutResults {
    fn name(&self) -> &'static str {
        "recent-without-results"
    }

    fn discover<'a>(&'a self, ctx: DiscoveryContext<'a>) -> BoxFuture<'a, Result<Vec<u64>>> {
        Box::pin(async move {
            let since = ctx.now - Duration::days(i64::from(self.days_back));
            let mut out = Vec::new();
            for event in ctx.store.events_since(since)? {
                if event.starts_at > ctx.now {
                    continue;
                }
                if !ctx.store.has_results(event.event_id)? {
                    out.push(event.event_id);
                }
            }
            debug!(strategy = self.name(), found = out.len(), "result discovery");
            Ok(out)
        })
    }
}

/// A fixed list of event ids, e.g. for a one-off backfill.
#[derive(Debug, Clone)]
pub struct ExplicitEvents(pub Vec<u64>);

impl ResultDiscovery for ExplicitEvents {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn discover<'a>(&'a self, _ctx: DiscoveryContext<'a>) -> BoxFuture<'a, Result<Vec<u64>>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    #[tokio::test]
    async fn recent_strategy_skips_future_old_and_already_synced() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let ts = |d: Duration| (now + d).timestamp();
        store.upsert_event(&json!({"eventId": 1, "time": ts(Duration::hours(-2))})).unwrap();
        store.upsert_event(&json!({"eventId": 2, "time": ts(Duration::days(-3))})).unwrap();
        store.upsert_event(&json!({"eventId": 3, "time": ts(Duration::days(-9))})).unwrap();
        store.upsert_event(&json!({"eventId": 4, "time": ts(Duration::hours(5))})).unwrap();
        store.upsert_results(2, &[json!({"riderId": 8})]).unwrap();

        let strategy = RecentEventsWithoutResults { days_back: 7 };
        let ids = strategy
            .discover(DiscoveryContext { now, store: &store })
            .await
            .unwrap();
        assert_eq!(ids, vec![1]);
    }
}
