//! PostgreSQL dedup store.
//!
//! Records live in `message_dedup`, keyed by `(application, message_key)`.
//! A claim is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE` statement:
//! the row is only overwritten when the existing record has expired, and the
//! unique constraint plus row lock make exactly one concurrent claimer win.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use crate::error::DedupResult;
use crate::record::{ClaimOutcome, DedupRecord, ExpiryPolicy};
use crate::store::DedupStore;

/// Schema created by [`PostgresDedupStore::ensure_schema`]; mirrors
/// `migrations/001_create_message_dedup_table.sql`.
const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS message_dedup (
        application  VARCHAR(255) NOT NULL,
        message_key  VARCHAR(255) NOT NULL,
        status       VARCHAR(16)  NOT NULL,
        claimed_at   TIMESTAMPTZ  NOT NULL,
        succeeded_at TIMESTAMPTZ,
        PRIMARY KEY (application, message_key)
    )
"#;

const CREATE_CLAIMED_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_message_dedup_claimed_at
        ON message_dedup (claimed_at) WHERE status = 'PROCESSING'
"#;

const CREATE_SUCCEEDED_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_message_dedup_succeeded_at
        ON message_dedup (succeeded_at) WHERE status = 'SUCCEEDED'
"#;

/// Attempts before a claim that keeps losing to concurrent releases defers
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Dedup store backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresDedupStore {
    pool: PgPool,
}

impl PostgresDedupStore {
    /// Create a store over an existing pool; the table must already exist
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`, create the table if needed, and build a store
    pub async fn connect(database_url: &str) -> DedupResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to dedup database")?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        info!("PostgreSQL dedup store connected");
        Ok(store)
    }

    /// Create the `message_dedup` table and its reaper indexes
    pub async fn ensure_schema(&self) -> DedupResult<()> {
        for statement in [CREATE_TABLE, CREATE_CLAIMED_INDEX, CREATE_SUCCEEDED_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create message_dedup schema")?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_record(&self, scope: &str, key: &str) -> DedupResult<Option<DedupRecord>> {
        let row = sqlx::query(
            r#"
            SELECT status, claimed_at, succeeded_at
            FROM message_dedup
            WHERE application = $1 AND message_key = $2
            "#,
        )
        .bind(scope)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch dedup record")?;

        row.map(|row| -> DedupResult<DedupRecord> {
            let status: String = row.try_get("status")?;
            Ok(DedupRecord {
                scope: scope.to_string(),
                key: key.to_string(),
                status: status.parse()?,
                claimed_at: row.try_get("claimed_at")?,
                succeeded_at: row.try_get("succeeded_at")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl DedupStore for PostgresDedupStore {
    async fn try_claim_processing(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<ClaimOutcome> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            // Overwrite only rows that are logically expired
            let claimed = sqlx::query(
                r#"
                INSERT INTO message_dedup (application, message_key, status, claimed_at, succeeded_at)
                VALUES ($1, $2, 'PROCESSING', $3, NULL)
                ON CONFLICT (application, message_key) DO UPDATE
                SET status = 'PROCESSING',
                    claimed_at = EXCLUDED.claimed_at,
                    succeeded_at = NULL
                WHERE (message_dedup.status = 'PROCESSING' AND message_dedup.claimed_at <= $4)
                   OR (message_dedup.status = 'SUCCEEDED'
                       AND COALESCE(message_dedup.succeeded_at, message_dedup.claimed_at) <= $5)
                RETURNING message_key
                "#,
            )
            .bind(scope)
            .bind(key)
            .bind(now)
            .bind(policy.processing_cutoff(now))
            .bind(policy.retention_cutoff(now))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to claim dedup record")?;

            if claimed.is_some() {
                debug!(scope = %scope, key = %key, "Claimed dedup key in PostgreSQL");
                return Ok(ClaimOutcome::Claimed);
            }

            // Row was live at claim time; it may have been released since
            if let Some(record) = self.fetch_record(scope, key).await? {
                if policy.is_live(&record, now) {
                    return Ok(ClaimOutcome::blocked_by(&record));
                }
            }

            debug!(
                scope = %scope,
                key = %key,
                attempt = attempt,
                "Blocking dedup record vanished, retrying claim"
            );
        }

        warn!(
            scope = %scope,
            key = %key,
            "Dedup claim kept racing, deferring message"
        );
        Ok(ClaimOutcome::InFlight { claimed_at: now })
    }

    async fn mark_succeeded(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        _policy: &ExpiryPolicy,
    ) -> DedupResult<()> {
        sqlx::query(
            r#"
            INSERT INTO message_dedup (application, message_key, status, claimed_at, succeeded_at)
            VALUES ($1, $2, 'SUCCEEDED', $3, $3)
            ON CONFLICT (application, message_key) DO UPDATE
            SET status = 'SUCCEEDED',
                succeeded_at = EXCLUDED.succeeded_at
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to mark dedup record succeeded")?;

        debug!(scope = %scope, key = %key, "Marked dedup key succeeded in PostgreSQL");
        Ok(())
    }

    async fn release(&self, scope: &str, key: &str) -> DedupResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM message_dedup
            WHERE application = $1 AND message_key = $2 AND status = 'PROCESSING'
            "#,
        )
        .bind(scope)
        .bind(key)
        .execute(&self.pool)
        .await
        .context("Failed to release dedup record")?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_claim(
        &self,
        scope: &str,
        key: &str,
        claimed_at: DateTime<Utc>,
    ) -> DedupResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM message_dedup
            WHERE application = $1 AND message_key = $2 AND status = 'PROCESSING'
              AND date_trunc('milliseconds', claimed_at) = date_trunc('milliseconds', $3::timestamptz)
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(claimed_at)
        .execute(&self.pool)
        .await
        .context("Failed to release dedup claim")?;

        Ok(result.rows_affected() > 0)
    }

    async fn lookup(
        &self,
        scope: &str,
        key: &str,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
    ) -> DedupResult<Option<DedupRecord>> {
        Ok(self
            .fetch_record(scope, key)
            .await?
            .filter(|record| policy.is_live(record, now)))
    }

    async fn purge_expired(&self, now: DateTime<Utc>, policy: &ExpiryPolicy) -> DedupResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM message_dedup
            WHERE (status = 'PROCESSING' AND claimed_at <= $1)
               OR (status = 'SUCCEEDED' AND COALESCE(succeeded_at, claimed_at) <= $2)
            "#,
        )
        .bind(policy.processing_cutoff(now))
        .bind(policy.retention_cutoff(now))
        .execute(&self.pool)
        .await
        .context("Failed to purge expired dedup records")?;

        let deleted_count = result.rows_affected();

        if deleted_count > 0 {
            info!(deleted_count = deleted_count, "Purged expired dedup records");
        } else {
            debug!("No expired dedup records to purge");
        }

        Ok(deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DedupStatus;

    #[test]
    fn test_schema_statements_match_status_encoding() {
        assert!(CREATE_CLAIMED_INDEX.contains(DedupStatus::Processing.as_str()));
        assert!(CREATE_SUCCEEDED_INDEX.contains(DedupStatus::Succeeded.as_str()));
        assert!(CREATE_TABLE.contains("PRIMARY KEY (application, message_key)"));
    }
}
