//! # Consume Dedup Library
//!
//! Guards message consumers against processing the same message twice at the
//! same time, and against reprocessing a message that already succeeded
//! recently. Before handling a delivery the consumer asks the guard for a
//! [`Decision`]; the answer tells it to process, defer, or skip.
//!
//! ## Problem
//!
//! Brokers deliver at least once:
//! - **Redelivery**: a slow ack makes the broker hand the same message to a
//!   second consumer while the first is still working
//! - **Rebalances / restarts**: a message processed just before a crash is
//!   delivered again
//! - **Crashed consumers**: a naive "in progress" marker left by a dead
//!   consumer blocks the message forever
//!
//! ## Solution
//!
//! Track a record per (application, message key) in a shared backend:
//! - **Atomic claim**: exactly one consumer moves a key to PROCESSING
//! - **Consume later**: duplicates of an in-flight message are deferred, not
//!   dropped, because the in-flight attempt may still fail
//! - **Processing expiry**: a PROCESSING claim older than the configured window
//!   is reclaimable, so a crashed consumer cannot block a key forever
//! - **Retention**: a SUCCEEDED record skips duplicates for a bounded window,
//!   then decays
//!
//! ## Architecture
//!
//! ```text
//! Broker → Consumer → DedupGuard::evaluate(key)
//!                        │
//!          ┌─────────────┼──────────────┐
//!        ACCEPT      ACCEPT_LATER      SKIP
//!          │             │              │
//!       handler      redeliver         ack
//!          │
//!    mark_outcome(Success | Failure)
//!                        ↓
//!                   DedupStore
//!          (in-memory | Redis | PostgreSQL)
//! ```
//!
//! ## State Machine
//!
//! ```text
//! NEW ----claim----------------> PROCESSING ----success----> SUCCEEDED
//! NEW <---processing expiry----- PROCESSING
//! NEW <---failure (release)----- PROCESSING
//! NEW <---retention expiry------------------------------- SUCCEEDED
//! ```
//!
//! ## Usage Example
//!
//! ### Guarded processing
//!
//! ```ignore
//! use consume_dedup::{DedupConfig, DedupGuard, ProcessingResult};
//! use std::time::Duration;
//!
//! # async fn example(redis: consume_dedup::SharedConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
//! let config = DedupConfig::consume_later("notification-consumer")?
//!     .with_processing_expiry(Duration::from_secs(60))?
//!     .with_record_reserve_minutes(60 * 24)?;
//! let guard = DedupGuard::redis(config, redis);
//!
//! match guard.process("msg-123", || async {
//!     send_notification().await?;
//!     Ok(())
//! }).await {
//!     Ok(ProcessingResult::Processed) | Ok(ProcessingResult::Skipped) => { /* ack */ }
//!     Ok(ProcessingResult::Deferred) | Ok(ProcessingResult::Failed(_)) => { /* retry later */ }
//!     Err(e) if e.is_transient() => { /* backend unreachable: retry later */ }
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! # async fn send_notification() -> anyhow::Result<()> { Ok(()) }
//! ```
//!
//! ### Configuration from the environment
//!
//! ```ignore
//! use consume_dedup::{DedupGuard, DedupSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // DEDUP_APPLICATION_NAME=billing DEDUP_STRATEGY=consume-later
//! // DEDUP_BACKEND=postgres DEDUP_DATABASE_URL=postgresql://...
//! let guard = DedupGuard::from_settings(&DedupSettings::from_env()?).await?;
//! let _reaper = guard.spawn_reaper(std::time::Duration::from_secs(3600));
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Policy
//!
//! A backend failure or timeout means the claim state is unknown. The guard
//! returns the error instead of guessing; hosts should defer the message.
//! SKIP is only ever returned for a confirmed, unexpired SUCCEEDED record.
//!
//! ## Design Trade-offs
//!
//! - The processing expiry is a liveness valve, not a lock lease. Too short
//!   and a slow handler can be duplicated; too long and a crashed consumer
//!   stalls the key. Tune it above the handler's worst-case latency.
//! - Expiry comparisons use each caller's clock against stored timestamps;
//!   clock skew between consumers is not corrected.
//! - This is not exactly-once delivery. Business handlers should still be
//!   idempotent.

mod clock;
mod config;
mod error;
mod guard;
mod key;
pub mod metrics;
mod record;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BackendKind, DedupConfig, DedupSettings, DedupStrategy, DEFAULT_BACKEND_TIMEOUT_MS,
    DEFAULT_PROCESSING_EXPIRE_MS, DEFAULT_RECORD_RESERVE_MINUTES,
};
pub use error::{DedupError, DedupResult};
pub use guard::{Admission, Decision, DedupGuard, Outcome, ProcessingResult};
pub use key::{default_message_key, validate_key, DedupMessage, KeyExtractor, MAX_KEY_LEN};
pub use record::{ClaimOutcome, DedupRecord, DedupStatus, ExpiryPolicy};
pub use store::{
    DedupStore, InMemoryDedupStore, PostgresDedupStore, RedisDedupStore, SharedConnectionManager,
};
