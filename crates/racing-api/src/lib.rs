//! `racing-api`: rate-budgeted access to the racing data API.
//!
//! Every outbound request goes through one [`RateBudgetedClient`]. The client
//! owns a [`RateBudget`] per [`OperationCategory`], blocks callers while a
//! category's window is exhausted, and classifies every outcome into a
//! [`CallError`] once so upstream code never inspects raw HTTP.
//!
//! # Architecture
//!
//! ```text
//! WorkQueue / BatchCoordinator
//!     │
//!     ▼
//! RateBudgetedClient   ← per-category budgets, timeout, one 429 retry
//!     │
//!     ▼
//! dyn RacingApi        ← HttpRacingApi (reqwest) or a test double
//! ```
//!
//! Time flows through [`Clock`] so rate windows, back-off and peak-hour
//! decisions are deterministic under `tokio::time::pause`.

pub mod api;
pub mod budget;
pub mod client;
pub mod clock;
pub mod error;

pub use api::{classify_status, ApiResult, HttpRacingApi, RacingApi, Record};
pub use budget::{BudgetLimit, BudgetStatus, OperationCategory, Permit, RateBudget};
pub use client::{ClientConfig, RateBudgetedClient};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::CallError;
