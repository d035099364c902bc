//! Redis dedup store.
//!
//! Each record is a single string key `dedup:{scope_len}:{scope}:{key}`
//! holding `STATUS|claimed_ms|succeeded_ms`. The scope length prefix keeps
//! keys unambiguous when a scope or key contains `:`. Every transition that reads before it
//! writes runs as one Lua script, so Redis serializes concurrent claims.
//! Records carry a native `PX` expiry equal to the window of their state,
//! which physically reaps stuck claims and decayed successes.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{DedupError, DedupResult};
use crate::record::{ClaimOutcome, DedupRecord, DedupStatus, ExpiryPolicy};
use crate::store::DedupStore;

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

const KEY_PREFIX: &str = "dedup";

/// Returns nil when the caller claimed the key, otherwise the blocking value.
const CLAIM_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    local now = tonumber(ARGV[1])
    if current then
        local status, claimed, succeeded = string.match(current, '^(%u+)|(%-?%d+)|(%-?%d*)$')
        if status == 'PROCESSING' then
            if now - tonumber(claimed) < tonumber(ARGV[2]) then
                return current
            end
        elseif status == 'SUCCEEDED' then
            local finished = tonumber(succeeded) or tonumber(claimed)
            if now - finished < tonumber(ARGV[3]) then
                return current
            end
        end
    end
    redis.call('SET', KEYS[1], 'PROCESSING|' .. ARGV[1] .. '|', 'PX', ARGV[2])
    return false
"#;

/// Keeps the original claim time when one exists.
const SUCCEED_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    local claimed = ARGV[1]
    if current then
        local previous = string.match(current, '^%u+|(%-?%d+)|')
        if previous then
            claimed = previous
        end
    end
    redis.call('SET', KEYS[1], 'SUCCEEDED|' .. claimed .. '|' .. ARGV[1], 'PX', ARGV[2])
    return 1
"#;

/// Deletes the key only while it is still a PROCESSING claim.
const RELEASE_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if current and string.sub(current, 1, 11) == 'PROCESSING|' then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Deletes the key only while it is the PROCESSING claim made at ARGV[1].
const RELEASE_CLAIM_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if current then
        local claimed = string.match(current, '^PROCESSING|(%-?%d+)|')
        if claimed == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
    end
    return 0
"#;

/// Dedup store backed by Redis
#[derive(Clone)]
pub struct RedisDedupStore {
    redis: SharedConnectionManager,
    claim_script: redis::Script,
    succeed_script: redis::Script,
    release_script: redis::Script,
    release_claim_script: redis::Script,
}

impl RedisDedupStore {
    /// Create a store over an existing shared connection manager
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self {
            redis,
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            succeed_script: redis::Script::new(SUCCEED_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
            release_claim_script: redis::Script::new(RELEASE_CLAIM_SCRIPT),
        }
    }

    /// Connect to `redis_url` and create a store
    pub async fn connect(redis_url: &str) -> DedupResult<Self> {
        let client = Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Redis dedup store connected");
        Ok(Self::new(Arc::new(Mutex::new(manager))))
    }

    fn record_key(scope: &str, key: &str) -> String {
        format!("{}:{}:{}:{}", KEY_PREFIX, scope.len(), scope, key)
    }

    async fn connection(&self) -> ConnectionManager {
        self.redis.lock().await.clone()
    }

    fn decode(scope: &str, key: &str, value: &str) -> DedupResult<DedupRecord> {
        let mut parts = value.split('|');
        let corrupt = || DedupError::CorruptRecord(format!("{}: {}", key, value));

        let status: DedupStatus = parts.next().ok_or_else(corrupt)?.parse()?;
        let claimed_at = parts
            .next()
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(from_millis)
            .ok_or_else(corrupt)?;
        let succeeded_at = match parts.next() {
            Some("") | None => None,
            Some(raw) => Some(
                raw.parse::<i64>()
                    .ok()
                    .and_then(from_millis)
                    .ok_or_else(corrupt)?,
            ),
        };

        Ok(DedupRecord {
            scope: scope.to_string(),
            key: key.to_string(),
            status,
            claimed_at,
            succeeded_at,
        })
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// `PX` argument; Redis rejects a zero expiry
fn px(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn try_claim_processing(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<ClaimOutcome> {
        let record_key = Self::record_key(scope, key);
        let mut conn = self.connection().await;

        let blocking: Option<String> = self
            .claim_script
            .key(&record_key)
            .arg(now.timestamp_millis())
            .arg(px(policy.processing_expiry))
            .arg(px(policy.retention))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to claim dedup key {}: {}", record_key, e);
                DedupError::Redis(e)
            })?;

        match blocking {
            None => {
                debug!(scope = %scope, key = %key, "Claimed dedup key in Redis");
                Ok(ClaimOutcome::Claimed)
            }
            Some(value) => {
                let record = Self::decode(scope, key, &value)?;
                Ok(ClaimOutcome::blocked_by(&record))
            }
        }
    }

    async fn mark_succeeded(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<()> {
        let record_key = Self::record_key(scope, key);
        let mut conn = self.connection().await;

        self.succeed_script
            .key(&record_key)
            .arg(now.timestamp_millis())
            .arg(px(policy.retention))
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to mark dedup key {} succeeded: {}", record_key, e);
                DedupError::Redis(e)
            })?;

        debug!(
            scope = %scope,
            key = %key,
            retention_ms = px(policy.retention),
            "Marked dedup key succeeded in Redis"
        );
        Ok(())
    }

    async fn release(&self, scope: &str, key: &str) -> DedupResult<bool> {
        let record_key = Self::record_key(scope, key);
        let mut conn = self.connection().await;

        let deleted: i64 = self
            .release_script
            .key(&record_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to release dedup key {}: {}", record_key, e);
                DedupError::Redis(e)
            })?;

        if deleted == 0 {
            debug!(scope = %scope, key = %key, "No processing claim to release");
        }
        Ok(deleted > 0)
    }

    async fn release_claim(
        &self,
        scope: &str,
        key: &str,
        claimed_at: DateTime<Utc>,
    ) -> DedupResult<bool> {
        let record_key = Self::record_key(scope, key);
        let mut conn = self.connection().await;

        let deleted: i64 = self
            .release_claim_script
            .key(&record_key)
            .arg(claimed_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to release dedup claim {}: {}", record_key, e);
                DedupError::Redis(e)
            })?;

        if deleted == 0 {
            debug!(
                scope = %scope,
                key = %key,
                claimed_at = %claimed_at,
                "Claim no longer held, leaving record in place"
            );
        }
        Ok(deleted > 0)
    }

    async fn lookup(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<Option<DedupRecord>> {
        let record_key = Self::record_key(scope, key);
        let mut conn = self.connection().await;

        let value: Option<String> = conn.get(&record_key).await.map_err(|e| {
            error!("Failed to read dedup key {}: {}", record_key, e);
            DedupError::Redis(e)
        })?;

        match value {
            Some(value) => {
                let record = Self::decode(scope, key, &value)?;
                Ok(Some(record).filter(|record| policy.is_live(record, now)))
            }
            None => Ok(None),
        }
    }

    async fn purge_expired(&self, _now: DateTime<Utc>, _policy: &ExpiryPolicy) -> DedupResult<u64> {
        // PX expiry reaps records server-side
        debug!("Redis dedup records expire natively; nothing to purge");
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_is_scoped() {
        assert_eq!(
            RedisDedupStore::record_key("billing", "m1"),
            "dedup:7:billing:m1"
        );
    }

    #[test]
    fn test_record_key_separates_scopes_containing_colons() {
        assert_ne!(
            RedisDedupStore::record_key("billing", "x:y"),
            RedisDedupStore::record_key("billing:x", "y")
        );
        assert_eq!(
            RedisDedupStore::record_key("billing:x", "y"),
            "dedup:9:billing:x:y"
        );
    }

    #[test]
    fn test_decode_processing_value() {
        let record = RedisDedupStore::decode("app", "m1", "PROCESSING|1000|").unwrap();

        assert_eq!(record.status, DedupStatus::Processing);
        assert_eq!(record.claimed_at.timestamp_millis(), 1_000);
        assert!(record.succeeded_at.is_none());
    }

    #[test]
    fn test_decode_succeeded_value() {
        let record = RedisDedupStore::decode("app", "m1", "SUCCEEDED|1000|1200").unwrap();

        assert_eq!(record.status, DedupStatus::Succeeded);
        assert_eq!(record.succeeded_at.map(|t| t.timestamp_millis()), Some(1_200));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            RedisDedupStore::decode("app", "m1", "PROCESSING|soon|"),
            Err(DedupError::CorruptRecord(_))
        ));
        assert!(matches!(
            RedisDedupStore::decode("app", "m1", "DONE|1|2"),
            Err(DedupError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_px_never_zero() {
        assert_eq!(px(Duration::from_micros(10)), 1);
        assert_eq!(px(Duration::from_secs(5)), 5_000);
    }
}
