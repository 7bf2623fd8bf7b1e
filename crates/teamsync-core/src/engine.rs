//! Wiring of client, queue, coordinator and scheduler from a [`SyncConfig`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use racing_api::{Clock, HttpRacingApi, RacingApi, RateBudgetedClient};
use tracing::info;

use crate::config::{ApiConfig, SyncConfig};
use crate::coordinator::{BatchCoordinator, EntitySyncer};
use crate::error::Result;
use crate::paths;
use crate::queue::WorkQueue;
use crate::schedule::{Scheduler, TriggerHandler};
use crate::store::{EntityStore, MemoryStore};
use crate::sync_log::{SyncLog, SyncLogDb};

/// Everything a process needs to sync: one client, one queue, one
/// coordinator and the scheduler driving it.
#[derive(Clone)]
pub struct Engine {
    pub coordinator: Arc<BatchCoordinator>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn EntityStore>,
}

impl Engine {
    pub fn build(
        config: &SyncConfig,
        api: Arc<dyn RacingApi>,
        store: Arc<dyn EntityStore>,
        log: Arc<dyn SyncLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Arc::new(RateBudgetedClient::new(
            api,
            Arc::clone(&clock),
            &config.client_config(),
        ));
        let syncer = Arc::new(EntitySyncer::new(Arc::clone(&client), Arc::clone(&store)));
        let queue = WorkQueue::new(syncer, Arc::clone(&clock), config.queue_options());
        let coordinator = Arc::new(BatchCoordinator::new(
            client,
            queue,
            Arc::clone(&store),
            log,
            Arc::clone(&clock),
            config.coordinator_options(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.schedule.clone(),
            config.validator(),
            Arc::clone(&coordinator) as Arc<dyn TriggerHandler>,
            clock,
        )?);
        Ok(Self {
            coordinator,
            scheduler,
            store,
        })
    }

    /// Production wiring under `root`: HTTP API, persistent sync log,
    /// in-memory entity store.
    pub fn open(root: &Path, config: &SyncConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let api = Arc::new(http_api(&config.api)?);
        let log = Arc::new(SyncLogDb::open(&paths::sync_log_path(root))?);
        info!(base_url = %config.api.base_url, club_id = config.api.club_id, "engine ready");
        Self::build(config, api, Arc::new(MemoryStore::new()), log, clock)
    }
}

pub fn http_api(api: &ApiConfig) -> Result<HttpRacingApi> {
    Ok(HttpRacingApi::new(
        api.base_url.clone(),
        api.api_key(),
        Duration::from_secs(api.request_timeout_secs),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_log::MemorySyncLog;
    use racing_api::SystemClock;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_creates_sync_log_under_root() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), &SyncConfig::new(), Arc::new(SystemClock)).unwrap();
        assert!(paths::sync_log_path(dir.path()).exists());
        assert!(!engine.scheduler.is_running());
        assert!(!engine.coordinator.status().running);
    }

    #[tokio::test]
    async fn invalid_schedule_is_refused() {
        let mut config = SyncConfig::new();
        config.schedule.triggers[0].base_interval_minutes = 1;
        let api = Arc::new(http_api(&config.api).unwrap());
        let built = Engine::build(
            &config,
            api,
            Arc::new(MemoryStore::new()),
            Arc::new(MemorySyncLog::new()),
            Arc::new(SystemClock),
        );
        assert!(built.is_err());
    }
}
