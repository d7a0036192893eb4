//! Stratus Core Resilience: Pure-logic retry primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the Stratus request executor uses
//! to retry work without tying itself to any particular protocol:
//!
//! - **Backoff Policy**: Bounded fixed/linear/exponential delays with optional jitter
//! - **Retry Budget**: A counted allowance; independent failure families keep separate budgets
//! - **Clock**: Injectable wall-clock and sleep source, with a deterministic test clock
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Storage providers or request signing
//! - Network protocols (S3, HTTP)
//! - Application-specific error types
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Retry loop (caller)             │
//! └─────────────┬───────────────────────────┘
//!               │ failure of family F
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       RetryBudget[F]                    │  ← May we retry at all?
//! └─────────────┬───────────────────────────┘
//!               │ yes
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       BackoffPolicy                     │  ← How long to wait?
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Clock::sleep                      │  ← Tokio timer or ManualClock
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```
//! use stratus_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let policy = BackoffPolicy::default();
//! let clock = ManualClock::default();
//! let mut budget = RetryBudget::new(policy.max_retries);
//!
//! let mut failures = 0;
//! while budget.try_consume() {
//!     failures += 1;
//!     clock.sleep(policy.delay_for(budget.used())).await;
//! }
//!
//! assert_eq!(failures, 3);
//! assert_eq!(clock.recorded_sleeps().len(), 3);
//! assert!(clock.total_slept() >= Duration::from_millis(700));
//! # }
//! ```

pub mod backoff;
pub mod budget;
pub mod clock;

// Re-export main types for convenience
pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use budget::RetryBudget;
pub use clock::{Clock, ManualClock, TokioClock};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use stratus_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::{BackoffPolicy, BackoffStrategy};
    pub use super::budget::RetryBudget;
    pub use super::clock::{Clock, ManualClock, TokioClock};
}
