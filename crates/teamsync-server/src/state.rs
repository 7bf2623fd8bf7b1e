use std::sync::Arc;

use teamsync_core::coordinator::BatchCoordinator;
use teamsync_core::queue::WorkQueue;
use teamsync_core::{Engine, Scheduler};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<BatchCoordinator>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            coordinator: engine.coordinator,
            scheduler: engine.scheduler,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        self.coordinator.queue()
    }
}
