use std::sync::Arc;

use futures::future::BoxFuture;
use racing_api::{CallError, RateBudgetedClient};
use tracing::debug;

use crate::error::SyncError;
use crate::queue::{EntityKey, EntityKind, ItemSyncer};
use crate::store::{EntityStore, UpsertSummary};

/// Queue worker body: fetch one entity through the budgeted client and
/// upsert it.
pub struct EntitySyncer {
    client: Arc<RateBudgetedClient>,
    store: Arc<dyn EntityStore>,
}

impl EntitySyncer {
    pub fn new(client: Arc<RateBudgetedClient>, store: Arc<dyn EntityStore>) -> Self {
        Self { client, store }
    }

    async fn sync_key(&self, key: EntityKey) -> Result<UpsertSummary, CallError> {
        match key.kind {
            EntityKind::Rider => {
                let record = self.client.fetch_rider(key.id).await?;
                self.store
                    .upsert_riders(std::slice::from_ref(&record))
                    .map_err(store_failure)
            }
            EntityKind::Event => {
                let record = self.client.fetch_event(key.id).await?;
                let summary = self.store.upsert_event(&record).map_err(store_failure)?;
                let signups = self.client.fetch_event_signups(key.id).await?;
                let s = self
                    .store
                    .upsert_signups(key.id, &signups)
                    .map_err(store_failure)?;
                debug!(%key, signups = s.total(), "event signups stored");
                Ok(summary)
            }
            EntityKind::Result => {
                let results = self.client.fetch_event_results(key.id).await?;
                self.store
                    .upsert_results(key.id, &results)
                    .map_err(store_failure)
            }
        }
    }
}

/// Storage hiccups are worth another attempt.
fn store_failure(err: SyncError) -> CallError {
    CallError::Transient(format!("store: {err}"))
}

impl ItemSyncer for EntitySyncer {
    fn sync(&self, key: EntityKey) -> BoxFuture<'_, Result<UpsertSummary, CallError>> {
        Box::pin(self.sync_key(key))
    }
}
