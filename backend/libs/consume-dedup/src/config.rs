//! Guard configuration.
//!
//! [`DedupConfig`] is the immutable, validated configuration handed to the
//! guard. [`DedupSettings`] is its environment-driven form, read from
//! `DEDUP_*` variables.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{DedupError, DedupResult};
use crate::record::ExpiryPolicy;

/// Default processing expiry: 2 minutes
pub const DEFAULT_PROCESSING_EXPIRE_MS: u64 = 2 * 60 * 1000;

/// Default success retention: 1 day
pub const DEFAULT_RECORD_RESERVE_MINUTES: u64 = 24 * 60;

/// Default deadline for a single backend call
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 3_000;

/// How duplicates are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupStrategy {
    /// Accept everything; no record is read or written
    Disabled,

    /// Defer in-flight duplicates, skip completed ones
    ConsumeLater,
}

impl Default for DedupStrategy {
    fn default() -> Self {
        DedupStrategy::Disabled
    }
}

/// Validated guard configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupConfig {
    application_name: String,
    strategy: DedupStrategy,
    processing_expiry: Duration,
    record_retention: Duration,
    backend_timeout: Duration,
}

impl DedupConfig {
    /// Consume-later configuration with default windows
    ///
    /// # Errors
    ///
    /// Returns `DedupError::Config` if `application_name` is blank.
    pub fn consume_later(application_name: impl Into<String>) -> DedupResult<Self> {
        Self::new(
            application_name,
            DedupStrategy::ConsumeLater,
            Duration::from_millis(DEFAULT_PROCESSING_EXPIRE_MS),
            Duration::from_secs(DEFAULT_RECORD_RESERVE_MINUTES * 60),
        )
    }

    /// Configuration that turns the guard into a no-op
    pub fn disabled(application_name: impl Into<String>) -> DedupResult<Self> {
        Self::new(
            application_name,
            DedupStrategy::Disabled,
            Duration::from_millis(DEFAULT_PROCESSING_EXPIRE_MS),
            Duration::from_secs(DEFAULT_RECORD_RESERVE_MINUTES * 60),
        )
    }

    /// Fully specified configuration
    ///
    /// # Errors
    ///
    /// Returns `DedupError::Config` if the application name is blank or
    /// either window is zero.
    pub fn new(
        application_name: impl Into<String>,
        strategy: DedupStrategy,
        processing_expiry: Duration,
        record_retention: Duration,
    ) -> DedupResult<Self> {
        let application_name = application_name.into();
        if application_name.trim().is_empty() {
            return Err(DedupError::Config(
                "application name cannot be empty".to_string(),
            ));
        }

        let config = Self {
            application_name,
            strategy,
            processing_expiry,
            record_retention,
            backend_timeout: Duration::from_millis(DEFAULT_BACKEND_TIMEOUT_MS),
        };
        config.validate_windows()?;
        Ok(config)
    }

    /// Override the processing expiry window
    ///
    /// Too short risks two consumers processing the same key concurrently;
    /// too long keeps a crashed consumer's claim blocking the key.
    pub fn with_processing_expiry(mut self, expiry: Duration) -> DedupResult<Self> {
        self.processing_expiry = expiry;
        self.validate_windows()?;
        Ok(self)
    }

    /// Override the processing expiry window in milliseconds
    pub fn with_processing_expire_millis(self, millis: u64) -> DedupResult<Self> {
        self.with_processing_expiry(Duration::from_millis(millis))
    }

    /// Override how long a successful record is retained
    pub fn with_record_retention(mut self, retention: Duration) -> DedupResult<Self> {
        self.record_retention = retention;
        self.validate_windows()?;
        Ok(self)
    }

    /// Override how long a successful record is retained, in minutes
    pub fn with_record_reserve_minutes(self, minutes: u64) -> DedupResult<Self> {
        self.with_record_retention(Duration::from_secs(minutes.saturating_mul(60)))
    }

    /// Override the per-call backend deadline
    pub fn with_backend_timeout(mut self, timeout: Duration) -> DedupResult<Self> {
        if timeout.is_zero() {
            return Err(DedupError::Config(
                "backend timeout must be greater than zero".to_string(),
            ));
        }
        self.backend_timeout = timeout;
        Ok(self)
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn strategy(&self) -> DedupStrategy {
        self.strategy
    }

    pub fn is_enabled(&self) -> bool {
        self.strategy != DedupStrategy::Disabled
    }

    pub fn processing_expiry(&self) -> Duration {
        self.processing_expiry
    }

    pub fn record_retention(&self) -> Duration {
        self.record_retention
    }

    pub fn backend_timeout(&self) -> Duration {
        self.backend_timeout
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(self.processing_expiry, self.record_retention)
    }

    fn validate_windows(&self) -> DedupResult<()> {
        if self.processing_expiry.is_zero() {
            return Err(DedupError::Config(
                "processing expiry must be greater than zero".to_string(),
            ));
        }
        if self.record_retention.is_zero() {
            return Err(DedupError::Config(
                "record retention must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backend the guard persists records in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
    Postgres,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Memory
    }
}

fn default_processing_expire_ms() -> u64 {
    DEFAULT_PROCESSING_EXPIRE_MS
}

fn default_record_reserve_minutes() -> u64 {
    DEFAULT_RECORD_RESERVE_MINUTES
}

fn default_backend_timeout_ms() -> u64 {
    DEFAULT_BACKEND_TIMEOUT_MS
}

/// Environment-driven settings
///
/// | Variable | Default |
/// |----------|---------|
/// | `DEDUP_APPLICATION_NAME` | required |
/// | `DEDUP_STRATEGY` | `disabled` |
/// | `DEDUP_PROCESSING_EXPIRE_MS` | `120000` |
/// | `DEDUP_RECORD_RESERVE_MINUTES` | `1440` |
/// | `DEDUP_BACKEND_TIMEOUT_MS` | `3000` |
/// | `DEDUP_BACKEND` | `memory` |
/// | `DEDUP_REDIS_URL` | required for `redis` |
/// | `DEDUP_DATABASE_URL` | required for `postgres` |
#[derive(Debug, Clone, Deserialize)]
pub struct DedupSettings {
    pub application_name: String,
    #[serde(default)]
    pub strategy: DedupStrategy,
    #[serde(default = "default_processing_expire_ms")]
    pub processing_expire_ms: u64,
    #[serde(default = "default_record_reserve_minutes")]
    pub record_reserve_minutes: u64,
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
    #[serde(default)]
    pub backend: BackendKind,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

impl DedupSettings {
    /// Load settings from `DEDUP_*` environment variables (and `.env`)
    pub fn from_env() -> DedupResult<Self> {
        dotenv::dotenv().ok();
        Ok(envy::prefixed("DEDUP_").from_env::<Self>()?)
    }

    /// Validate into an immutable [`DedupConfig`]
    pub fn to_config(&self) -> DedupResult<DedupConfig> {
        DedupConfig::new(
            self.application_name.clone(),
            self.strategy,
            Duration::from_millis(self.processing_expire_ms),
            Duration::from_secs(self.record_reserve_minutes.saturating_mul(60)),
        )?
        .with_backend_timeout(Duration::from_millis(self.backend_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_later_defaults() {
        let config = DedupConfig::consume_later("order-service").unwrap();

        assert_eq!(config.application_name(), "order-service");
        assert_eq!(config.strategy(), DedupStrategy::ConsumeLater);
        assert!(config.is_enabled());
        assert_eq!(config.processing_expiry(), Duration::from_secs(120));
        assert_eq!(config.record_retention(), Duration::from_secs(86_400));
        assert_eq!(config.backend_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_disabled_config() {
        let config = DedupConfig::disabled("order-service").unwrap();
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_rejects_blank_application_name() {
        let err = DedupConfig::consume_later("  ").unwrap_err();
        assert!(matches!(err, DedupError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_windows() {
        let config = DedupConfig::consume_later("app").unwrap();
        assert!(config.clone().with_processing_expire_millis(0).is_err());
        assert!(config.clone().with_record_reserve_minutes(0).is_err());
        assert!(config.with_backend_timeout(Duration::ZERO).is_err());
    }

    #[test]
    fn test_settings_to_config() {
        let settings = DedupSettings {
            application_name: "billing".to_string(),
            strategy: DedupStrategy::ConsumeLater,
            processing_expire_ms: 5_000,
            record_reserve_minutes: 10,
            backend_timeout_ms: 250,
            backend: BackendKind::Memory,
            redis_url: None,
            database_url: None,
        };

        let config = settings.to_config().unwrap();
        assert_eq!(config.processing_expiry(), Duration::from_millis(5_000));
        assert_eq!(config.record_retention(), Duration::from_secs(600));
        assert_eq!(config.backend_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_settings_from_env_vars() {
        let vars = vec![
            ("DEDUP_APPLICATION_NAME".to_string(), "billing".to_string()),
            ("DEDUP_STRATEGY".to_string(), "consume-later".to_string()),
            ("DEDUP_BACKEND".to_string(), "redis".to_string()),
            ("DEDUP_REDIS_URL".to_string(), "redis://localhost:6379".to_string()),
        ];

        let settings: DedupSettings = envy::prefixed("DEDUP_").from_iter(vars).unwrap();

        assert_eq!(settings.strategy, DedupStrategy::ConsumeLater);
        assert_eq!(settings.backend, BackendKind::Redis);
        assert_eq!(settings.processing_expire_ms, DEFAULT_PROCESSING_EXPIRE_MS);
        assert_eq!(settings.record_reserve_minutes, DEFAULT_RECORD_RESERVE_MINUTES);
        assert_eq!(settings.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert!(settings.database_url.is_none());
    }
}
