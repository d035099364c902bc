//! Persistence port for dedup records.
//!
//! Every backend must make [`DedupStore::try_claim_processing`] atomic per
//! (scope, key): among concurrent callers for the same key generation, exactly
//! one observes [`ClaimOutcome::Claimed`]. Backends also apply the shared
//! [`ExpiryPolicy`] on every read, so logically expired records behave as
//! absent whether or not they have been physically removed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DedupResult;
use crate::record::{ClaimOutcome, DedupRecord, ExpiryPolicy};

pub mod memory;
pub mod postgres_store;
pub mod redis_store;

pub use memory::InMemoryDedupStore;
pub use postgres_store::PostgresDedupStore;
pub use redis_store::{RedisDedupStore, SharedConnectionManager};

/// Atomic operations a dedup backend provides.
///
/// Implementations must be safe to share across tasks and processes.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically claim `key` for processing.
    ///
    /// Succeeds when no live record exists, writing a PROCESSING record with
    /// `claimed_at = now`. Otherwise reports the record that blocks the key.
    async fn try_claim_processing(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<ClaimOutcome>;

    /// Record a successful outcome with `succeeded_at = now`.
    ///
    /// Idempotent: repeating the call keeps the key SUCCEEDED.
    async fn mark_succeeded(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<()>;

    /// Remove a PROCESSING claim so the key can be re-claimed.
    ///
    /// Idempotent; a SUCCEEDED record is left untouched. Returns whether a
    /// claim was removed.
    async fn release(&self, scope: &str, key: &str) -> DedupResult<bool>;

    /// Remove the PROCESSING claim made at `claimed_at`, and nothing else.
    ///
    /// Claim times compare at millisecond precision. A record re-claimed by
    /// another consumer after expiry carries a newer claim time and is left
    /// untouched. Returns whether the claim was removed.
    async fn release_claim(
        &self,
        scope: &str,
        key: &str,
        claimed_at: DateTime<Utc>,
    ) -> DedupResult<bool>;

    /// Read the live record for `key`, if any.
    async fn lookup(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<Option<DedupRecord>>;

    /// Physically delete records that are logically expired at `now`.
    ///
    /// Returns the number of records removed. Backends with native expiry
    /// may return 0.
    async fn purge_expired(&self, now: DateTime<Utc>, policy: &ExpiryPolicy) -> DedupResult<u64>;
}
