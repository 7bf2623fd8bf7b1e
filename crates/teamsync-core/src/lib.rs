pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod io;
pub mod paths;
pub mod queue;
pub mod schedule;
pub mod store;
pub mod sync_log;

pub use config::SyncConfig;
pub use coordinator::{BatchCoordinator, BatchOptions, BatchRun, Phase, TriggerOutcome};
pub use engine::Engine;
pub use error::{Result, SyncError};
pub use queue::WorkQueue;
pub use schedule::Scheduler;
