pub mod events;
pub mod queue;
pub mod scheduler;
pub mod sync;
