//! Deduplication engine.
//!
//! [`DedupGuard`] decides whether a delivered message is processed now,
//! deferred, or skipped, and drives record transitions on the configured
//! [`DedupStore`]. The guard itself holds no lock; every cross-consumer
//! ordering guarantee comes from the store's atomic claim.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, DedupConfig, DedupSettings};
use crate::error::{DedupError, DedupResult};
use crate::key::{validate_key, KeyExtractor};
use crate::metrics::DedupMetrics;
use crate::record::{ClaimOutcome, DedupRecord};
use crate::store::{
    DedupStore, InMemoryDedupStore, PostgresDedupStore, RedisDedupStore, SharedConnectionManager,
};

/// What the consumer should do with a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the business handler, then call [`DedupGuard::mark_outcome`]
    Accept,

    /// A duplicate is in flight; return "retry later" to the broker
    AcceptLater,

    /// Already processed within the retention window; ack without handling
    Skip,
}

impl Decision {
    pub fn as_label(&self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::AcceptLater => "accept_later",
            Decision::Skip => "skip",
        }
    }
}

/// Result of the business handler for an accepted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// A [`Decision`] together with the claim it created
///
/// Returned by [`DedupGuard::admit`]; hand it back to
/// [`DedupGuard::finish`] so a failure releases only this claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub decision: Decision,

    /// Claim time when `decision` is `Accept` with dedup enabled
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Result of guarded processing via [`DedupGuard::process`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Handler ran and succeeded
    Processed,

    /// Duplicate in flight; message must be redelivered later
    Deferred,

    /// Duplicate of a completed message; safe to ack
    Skipped,

    /// Handler ran and failed; the claim was released for retry
    Failed(String),
}

impl ProcessingResult {
    /// Check if the message can be acknowledged
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            ProcessingResult::Processed | ProcessingResult::Skipped
        )
    }

    /// Check if the broker should redeliver the message
    pub fn needs_retry(&self) -> bool {
        matches!(
            self,
            ProcessingResult::Deferred | ProcessingResult::Failed(_)
        )
    }
}

/// Deduplication guard for message consumers
///
/// Cheap to clone and safe to share across tasks; clones share the store.
///
/// # Example
///
/// ```ignore
/// use consume_dedup::{DedupConfig, DedupGuard, Decision, Outcome};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let guard = DedupGuard::in_memory(DedupConfig::consume_later("order-service")?);
///
/// match guard.evaluate("msg-42").await? {
///     Decision::Accept => {
///         let outcome = match handle().await {
///             Ok(()) => Outcome::Success,
///             Err(_) => Outcome::Failure,
///         };
///         guard.mark_outcome("msg-42", outcome).await?;
///     }
///     Decision::AcceptLater => { /* ask the broker to redeliver */ }
///     Decision::Skip => { /* ack */ }
/// }
/// # Ok(())
/// # }
/// # async fn handle() -> Result<(), ()> { Ok(()) }
/// ```
#[derive(Clone)]
pub struct DedupGuard {
    config: DedupConfig,
    store: Option<Arc<dyn DedupStore>>,
    clock: Arc<dyn Clock>,
    metrics: Option<DedupMetrics>,
}

impl DedupGuard {
    /// Create a guard over any store implementation
    ///
    /// With a disabled strategy the store is dropped and never called.
    pub fn with_store(config: DedupConfig, store: Arc<dyn DedupStore>) -> Self {
        if !config.is_enabled() {
            return Self::noop(config);
        }

        let metrics = DedupMetrics::new(config.application_name());
        info!(
            application = %config.application_name(),
            processing_expiry_ms = config.processing_expiry().as_millis() as u64,
            retention_secs = config.record_retention().as_secs(),
            "Dedup guard enabled"
        );

        Self {
            config,
            store: Some(store),
            clock: Arc::new(SystemClock),
            metrics: Some(metrics),
        }
    }

    /// Guard backed by an in-process map
    pub fn in_memory(config: DedupConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryDedupStore::new()))
    }

    /// Guard backed by Redis
    pub fn redis(config: DedupConfig, redis: SharedConnectionManager) -> Self {
        Self::with_store(config, Arc::new(RedisDedupStore::new(redis)))
    }

    /// Guard backed by PostgreSQL; the `message_dedup` table must exist
    pub fn postgres(config: DedupConfig, pool: PgPool) -> Self {
        Self::with_store(config, Arc::new(PostgresDedupStore::new(pool)))
    }

    /// Guard that accepts every message and never touches a backend
    pub fn disabled(application_name: impl Into<String>) -> DedupResult<Self> {
        Ok(Self::noop(DedupConfig::disabled(application_name)?))
    }

    /// Build a guard from environment settings, connecting the chosen backend
    pub async fn from_settings(settings: &DedupSettings) -> DedupResult<Self> {
        let config = settings.to_config()?;
        if !config.is_enabled() {
            return Ok(Self::noop(config));
        }

        let store: Arc<dyn DedupStore> = match settings.backend {
            BackendKind::Memory => Arc::new(InMemoryDedupStore::new()),
            BackendKind::Redis => {
                let url = settings.redis_url.as_deref().ok_or_else(|| {
                    DedupError::Config("DEDUP_REDIS_URL is required for the redis backend".into())
                })?;
                Arc::new(RedisDedupStore::connect(url).await?)
            }
            BackendKind::Postgres => {
                let url = settings.database_url.as_deref().ok_or_else(|| {
                    DedupError::Config(
                        "DEDUP_DATABASE_URL is required for the postgres backend".into(),
                    )
                })?;
                Arc::new(PostgresDedupStore::connect(url).await?)
            }
        };

        Ok(Self::with_store(config, store))
    }

    /// Replace the time source (tests, simulations)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn noop(config: DedupConfig) -> Self {
        debug!(
            application = %config.application_name(),
            "Dedup guard disabled"
        );
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Decide what to do with the message identified by `key`
    ///
    /// # Errors
    ///
    /// - `DedupError::InvalidKey` for an empty or oversized key
    /// - `DedupError::Timeout` or a backend error when the claim state is
    ///   unknown; the host should defer the message
    pub async fn evaluate(&self, key: &str) -> DedupResult<Decision> {
        Ok(self.admit(key).await?.decision)
    }

    /// Like [`evaluate`](Self::evaluate), but also returns the claim time
    /// so [`finish`](Self::finish) can fence the release to this claim
    pub async fn admit(&self, key: &str) -> DedupResult<Admission> {
        let store = match &self.store {
            Some(store) => store,
            None => {
                return Ok(Admission {
                    decision: Decision::Accept,
                    claimed_at: None,
                })
            }
        };
        validate_key(key)?;

        let scope = self.config.application_name();
        let policy = self.config.expiry_policy();
        let now = self.clock.now();

        let claim = self
            .call_backend(
                "try_claim_processing",
                key,
                store.try_claim_processing(scope, key, now, &policy),
            )
            .await?;

        let admission = match claim {
            ClaimOutcome::Claimed => {
                debug!(scope = %scope, key = %key, "Claimed message for processing");
                Admission {
                    decision: Decision::Accept,
                    claimed_at: Some(now),
                }
            }
            ClaimOutcome::InFlight { claimed_at } => {
                info!(
                    scope = %scope,
                    key = %key,
                    claimed_at = %claimed_at,
                    "Duplicate message in flight, deferring"
                );
                Admission {
                    decision: Decision::AcceptLater,
                    claimed_at: None,
                }
            }
            ClaimOutcome::Completed { succeeded_at } => {
                info!(
                    scope = %scope,
                    key = %key,
                    succeeded_at = %succeeded_at,
                    "Message already processed, skipping"
                );
                Admission {
                    decision: Decision::Skip,
                    claimed_at: None,
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_decision(admission.decision);
        }
        Ok(admission)
    }

    /// Record the business handler's outcome for an accepted message
    ///
    /// Success marks the key SUCCEEDED for the retention window; failure
    /// releases the claim so the next delivery can retry.
    ///
    /// The failure path is not fenced: if this consumer stalled past the
    /// processing expiry and another consumer re-claimed the key, a late
    /// `Failure` here deletes that newer claim. Prefer [`admit`](Self::admit)
    /// with [`finish`](Self::finish), or [`process`](Self::process).
    pub async fn mark_outcome(&self, key: &str, outcome: Outcome) -> DedupResult<()> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        validate_key(key)?;

        let scope = self.config.application_name();

        match outcome {
            Outcome::Success => {
                let policy = self.config.expiry_policy();
                let now = self.clock.now();
                self.call_backend(
                    "mark_succeeded",
                    key,
                    store.mark_succeeded(scope, key, now, &policy),
                )
                .await?;
                debug!(scope = %scope, key = %key, "Message marked succeeded");
            }
            Outcome::Failure => {
                let released = self
                    .call_backend("release", key, store.release(scope, key))
                    .await?;
                warn!(
                    scope = %scope,
                    key = %key,
                    released = released,
                    "Message processing failed, claim released"
                );
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(outcome);
        }
        Ok(())
    }

    /// Record the outcome of a message admitted by [`admit`](Self::admit)
    ///
    /// Failure releases only the claim carried by `admission`; a newer claim
    /// taken after this one expired is left in place. Nothing is released
    /// for an admission that did not claim.
    pub async fn finish(
        &self,
        key: &str,
        admission: &Admission,
        outcome: Outcome,
    ) -> DedupResult<()> {
        let (store, claimed_at) = match (&self.store, outcome, admission.claimed_at) {
            (None, _, _) => return Ok(()),
            (Some(_), Outcome::Success, _) => return self.mark_outcome(key, outcome).await,
            (Some(_), Outcome::Failure, None) => return Ok(()),
            (Some(store), Outcome::Failure, Some(claimed_at)) => (store, claimed_at),
        };
        validate_key(key)?;

        let scope = self.config.application_name();
        let released = self
            .call_backend(
                "release_claim",
                key,
                store.release_claim(scope, key, claimed_at),
            )
            .await?;

        if released {
            warn!(
                scope = %scope,
                key = %key,
                "Message processing failed, claim released"
            );
        } else {
            warn!(
                scope = %scope,
                key = %key,
                claimed_at = %claimed_at,
                "Message processing failed, claim already expired or taken over"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(outcome);
        }
        Ok(())
    }

    /// Process a message only if no duplicate is in flight or completed
    ///
    /// 1. Evaluate the key
    /// 2. On ACCEPT run `f` and record its outcome
    /// 3. Map the decision to a [`ProcessingResult`]
    ///
    /// A failed release after a handler error is logged, not returned: the
    /// claim still expires after the processing window.
    pub async fn process<F, Fut>(&self, key: &str, f: F) -> DedupResult<ProcessingResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), anyhow::Error>>,
    {
        let admission = self.admit(key).await?;
        match admission.decision {
            Decision::AcceptLater => Ok(ProcessingResult::Deferred),
            Decision::Skip => Ok(ProcessingResult::Skipped),
            Decision::Accept => match f().await {
                Ok(()) => {
                    self.finish(key, &admission, Outcome::Success).await?;
                    Ok(ProcessingResult::Processed)
                }
                Err(e) => {
                    warn!(key = %key, error = ?e, "Message handler failed");
                    if let Err(release_err) =
                        self.finish(key, &admission, Outcome::Failure).await
                    {
                        error!(
                            key = %key,
                            error = %release_err,
                            "Failed to release claim, waiting for expiry"
                        );
                    }
                    Ok(ProcessingResult::Failed(e.to_string()))
                }
            },
        }
    }

    /// Derive the key with `extractor`, then [`process`](Self::process)
    pub async fn process_message<M, F, Fut>(
        &self,
        extractor: &KeyExtractor<M>,
        message: &M,
        f: F,
    ) -> DedupResult<ProcessingResult>
    where
        M: ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), anyhow::Error>>,
    {
        if !self.config.is_enabled() {
            return self.process("", f).await;
        }
        let key = extractor.key_for(message)?;
        self.process(&key, f).await
    }

    /// Read the live record for `key` (diagnostics)
    pub async fn lookup(&self, key: &str) -> DedupResult<Option<DedupRecord>> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(None),
        };
        validate_key(key)?;

        let policy = self.config.expiry_policy();
        let now = self.clock.now();
        self.call_backend(
            "lookup",
            key,
            store.lookup(self.config.application_name(), key, now, &policy),
        )
        .await
    }

    /// Physically delete expired records; returns how many were removed
    pub async fn purge_expired(&self) -> DedupResult<u64> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(0),
        };

        let policy = self.config.expiry_policy();
        let now = self.clock.now();
        self.call_backend("purge_expired", "*", store.purge_expired(now, &policy))
            .await
    }

    /// Run [`purge_expired`](Self::purge_expired) every `period` on a
    /// background task
    pub fn spawn_reaper(&self, period: Duration) -> JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match guard.purge_expired().await {
                    Ok(count) if count > 0 => {
                        info!(purged = count, "Dedup reaper removed expired records");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Dedup reaper failed");
                    }
                }
            }
        })
    }

    async fn call_backend<T, Fut>(&self, op: &'static str, key: &str, fut: Fut) -> DedupResult<T>
    where
        Fut: Future<Output = DedupResult<T>>,
    {
        let deadline = self.config.backend_timeout();
        let result = match timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(DedupError::Timeout(deadline)),
        };

        if let Err(e) = &result {
            if let Some(metrics) = &self.metrics {
                metrics.backend_errors.inc();
            }
            error!(
                op = op,
                scope = %self.config.application_name(),
                key = %key,
                error = %e,
                transient = e.is_transient(),
                "Dedup backend call failed"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_result() {
        assert!(ProcessingResult::Processed.is_ack());
        assert!(ProcessingResult::Skipped.is_ack());
        assert!(!ProcessingResult::Deferred.is_ack());
        assert!(!ProcessingResult::Failed("error".to_string()).is_ack());

        assert!(ProcessingResult::Deferred.needs_retry());
        assert!(ProcessingResult::Failed("error".to_string()).needs_retry());
        assert!(!ProcessingResult::Processed.needs_retry());
    }

    #[test]
    fn test_decision_labels() {
        assert_eq!(Decision::Accept.as_label(), "accept");
        assert_eq!(Decision::AcceptLater.as_label(), "accept_later");
        assert_eq!(Decision::Skip.as_label(), "skip");
    }

    #[tokio::test]
    async fn test_disabled_guard_accepts_everything() {
        let guard = DedupGuard::disabled("app").unwrap();

        assert_eq!(guard.evaluate("m1").await.unwrap(), Decision::Accept);
        assert_eq!(guard.evaluate("m1").await.unwrap(), Decision::Accept);
        guard.mark_outcome("m1", Outcome::Success).await.unwrap();
        assert_eq!(guard.evaluate("m1").await.unwrap(), Decision::Accept);
        assert!(guard.lookup("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evaluate_rejects_empty_key() {
        let guard = DedupGuard::in_memory(DedupConfig::consume_later("app").unwrap());
        let err = guard.evaluate("").await.unwrap_err();
        assert!(matches!(err, DedupError::InvalidKey(_)));
    }
}
