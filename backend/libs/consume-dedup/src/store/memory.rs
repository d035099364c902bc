//! In-memory dedup store.
//!
//! Records live in a single map guarded by a mutex. The lock is held only
//! for the check-and-set of one operation and never across an await point,
//! which makes claims atomic within one process. Intended for tests and
//! single-instance consumers; records are lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::error::DedupResult;
use crate::record::{ClaimOutcome, DedupRecord, DedupStatus, ExpiryPolicy};
use crate::store::DedupStore;

type RecordKey = (String, String);

/// Mutex-guarded map of dedup records
#[derive(Default)]
pub struct InMemoryDedupStore {
    records: Mutex<HashMap<RecordKey, DedupRecord>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically stored records, expired or not
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn record_key(scope: &str, key: &str) -> RecordKey {
        (scope.to_string(), key.to_string())
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn try_claim_processing(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<ClaimOutcome> {
        let mut records = self.records.lock();
        let record_key = Self::record_key(scope, key);

        if let Some(existing) = records.get(&record_key) {
            if policy.is_live(existing, now) {
                return Ok(ClaimOutcome::blocked_by(existing));
            }
            debug!(
                scope = %scope,
                key = %key,
                status = %existing.status,
                "Replacing expired dedup record"
            );
        }

        records.insert(record_key, DedupRecord::processing(scope, key, now));
        Ok(ClaimOutcome::Claimed)
    }

    async fn mark_succeeded(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        _policy: &ExpiryPolicy,
    ) -> DedupResult<()> {
        let mut records = self.records.lock();
        records
            .entry(Self::record_key(scope, key))
            .or_insert_with(|| DedupRecord::processing(scope, key, now))
            .succeed(now);
        Ok(())
    }

    async fn release(&self, scope: &str, key: &str) -> DedupResult<bool> {
        let mut records = self.records.lock();
        let record_key = Self::record_key(scope, key);

        match records.get(&record_key) {
            Some(record) if record.status == DedupStatus::Processing => {
                records.remove(&record_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(
        &self,
        scope: &str,
        key: &str,
        claimed_at: DateTime<Utc>,
    ) -> DedupResult<bool> {
        let mut records = self.records.lock();
        let record_key = Self::record_key(scope, key);

        match records.get(&record_key) {
            Some(record)
                if record.status == DedupStatus::Processing
                    && record.claimed_at.timestamp_millis() == claimed_at.timestamp_millis() =>
            {
                records.remove(&record_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lookup(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<Option<DedupRecord>> {
        let records = self.records.lock();
        Ok(records
            .get(&Self::record_key(scope, key))
            .filter(|record| policy.is_live(record, now))
            .cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>, policy: &ExpiryPolicy) -> DedupResult<u64> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| policy.is_live(record, now));
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn policy() -> ExpiryPolicy {
        ExpiryPolicy::new(Duration::from_millis(5_000), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_claim_then_in_flight() {
        let store = InMemoryDedupStore::new();

        let first = store.try_claim_processing("app", "k", at(0), &policy()).await.unwrap();
        let second = store.try_claim_processing("app", "k", at(10), &policy()).await.unwrap();

        assert_eq!(first, ClaimOutcome::Claimed);
        assert_eq!(second, ClaimOutcome::InFlight { claimed_at: at(0) });
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let store = InMemoryDedupStore::new();

        store.try_claim_processing("app-a", "k", at(0), &policy()).await.unwrap();
        let other = store.try_claim_processing("app-b", "k", at(0), &policy()).await.unwrap();

        assert!(other.is_claimed());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_release_keeps_succeeded_record() {
        let store = InMemoryDedupStore::new();

        store.try_claim_processing("app", "k", at(0), &policy()).await.unwrap();
        store.mark_succeeded("app", "k", at(1), &policy()).await.unwrap();

        assert!(!store.release("app", "k").await.unwrap());
        let record = store.lookup("app", "k", at(2), &policy()).await.unwrap().unwrap();
        assert_eq!(record.status, DedupStatus::Succeeded);
        assert_eq!(record.succeeded_at, Some(at(1)));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = InMemoryDedupStore::new();

        store.try_claim_processing("app", "k", at(0), &policy()).await.unwrap();
        assert!(store.release("app", "k").await.unwrap());
        assert!(!store.release("app", "k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_release_claim_spares_newer_claim() {
        let store = InMemoryDedupStore::new();

        store.try_claim_processing("app", "k", at(0), &policy()).await.unwrap();
        let reclaimed = store.try_claim_processing("app", "k", at(5_001), &policy()).await.unwrap();
        assert!(reclaimed.is_claimed());

        // The stale owner's release must not drop the live claim
        assert!(!store.release_claim("app", "k", at(0)).await.unwrap());
        let record = store.lookup("app", "k", at(5_100), &policy()).await.unwrap().unwrap();
        assert_eq!(record.claimed_at, at(5_001));

        assert!(store.release_claim("app", "k", at(5_001)).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_hides_expired_record() {
        let store = InMemoryDedupStore::new();

        store.try_claim_processing("app", "k", at(0), &policy()).await.unwrap();

        assert!(store.lookup("app", "k", at(4_999), &policy()).await.unwrap().is_some());
        assert!(store.lookup("app", "k", at(5_000), &policy()).await.unwrap().is_none());
        // Still physically present until purged
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryDedupStore::new();

        store.try_claim_processing("app", "stuck", at(0), &policy()).await.unwrap();
        store.try_claim_processing("app", "done", at(0), &policy()).await.unwrap();
        store.mark_succeeded("app", "done", at(100), &policy()).await.unwrap();

        let purged = store.purge_expired(at(10_000), &policy()).await.unwrap();

        assert_eq!(purged, 1);
        assert!(store.lookup("app", "done", at(10_000), &policy()).await.unwrap().is_some());
    }
}
