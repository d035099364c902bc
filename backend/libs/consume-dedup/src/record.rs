//! Dedup record semantics shared by every backend.
//!
//! A record exists per (application scope, message key). Absence means the
//! key was never seen (or its record has decayed). All backends and the
//! guard consult the same [`ExpiryPolicy`], so a record that the claim path
//! considers expired is also invisible to [`lookup`](crate::DedupStore::lookup).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DedupError, DedupResult};

/// Persisted state of a message key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DedupStatus {
    /// A consumer holds the claim and is running the business handler
    Processing,

    /// The business handler completed successfully
    Succeeded,
}

impl DedupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStatus::Processing => "PROCESSING",
            DedupStatus::Succeeded => "SUCCEEDED",
        }
    }
}

impl fmt::Display for DedupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupStatus {
    type Err = DedupError;

    fn from_str(s: &str) -> DedupResult<Self> {
        match s {
            "PROCESSING" => Ok(DedupStatus::Processing),
            "SUCCEEDED" => Ok(DedupStatus::Succeeded),
            other => Err(DedupError::CorruptRecord(format!(
                "unknown dedup status: {}",
                other
            ))),
        }
    }
}

/// Represents one dedup record as stored by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Application scope the record belongs to
    pub scope: String,

    /// Message dedup key
    pub key: String,

    /// Current state
    pub status: DedupStatus,

    /// Timestamp of the claim that created the current generation
    pub claimed_at: DateTime<Utc>,

    /// Timestamp of the successful outcome (None while processing)
    pub succeeded_at: Option<DateTime<Utc>>,
}

impl DedupRecord {
    /// New PROCESSING record claimed at `now`
    pub fn processing(scope: &str, key: &str, now: DateTime<Utc>) -> Self {
        Self {
            scope: scope.to_string(),
            key: key.to_string(),
            status: DedupStatus::Processing,
            claimed_at: now,
            succeeded_at: None,
        }
    }

    /// Transition to SUCCEEDED, keeping the original claim time
    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.status = DedupStatus::Succeeded;
        self.succeeded_at = Some(now);
    }

    /// Timestamp the applicable window is measured from
    pub fn reference_time(&self) -> DateTime<Utc> {
        match self.status {
            DedupStatus::Processing => self.claimed_at,
            DedupStatus::Succeeded => self.succeeded_at.unwrap_or(self.claimed_at),
        }
    }
}

/// Time windows that bound how long a record blocks a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// How long a PROCESSING claim defers duplicates before it is reclaimable
    pub processing_expiry: Duration,

    /// How long a SUCCEEDED record causes duplicates to be skipped
    pub retention: Duration,
}

impl ExpiryPolicy {
    pub fn new(processing_expiry: Duration, retention: Duration) -> Self {
        Self {
            processing_expiry,
            retention,
        }
    }

    /// Window that applies to a record in `status`
    pub fn window_for(&self, status: DedupStatus) -> Duration {
        match status {
            DedupStatus::Processing => self.processing_expiry,
            DedupStatus::Succeeded => self.retention,
        }
    }

    /// Whether `record` still blocks its key at `now`.
    ///
    /// A record is live while its age is strictly below its window; at
    /// exactly the window length it has expired.
    pub fn is_live(&self, record: &DedupRecord, now: DateTime<Utc>) -> bool {
        match ChronoDuration::from_std(self.window_for(record.status)) {
            Ok(window) => now.signed_duration_since(record.reference_time()) < window,
            Err(_) => true,
        }
    }

    /// Oldest `claimed_at` a PROCESSING record may carry and still be live
    pub fn processing_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.processing_expiry)
    }

    /// Oldest `succeeded_at` a SUCCEEDED record may carry and still be live
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.retention)
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Result of an atomic claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the PROCESSING claim
    Claimed,

    /// Another consumer holds an unexpired PROCESSING claim
    InFlight { claimed_at: DateTime<Utc> },

    /// The key was processed successfully within the retention window
    Completed { succeeded_at: DateTime<Utc> },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }

    /// Outcome reported to a losing claimer that observed `record`
    pub fn blocked_by(record: &DedupRecord) -> Self {
        match record.status {
            DedupStatus::Processing => ClaimOutcome::InFlight {
                claimed_at: record.claimed_at,
            },
            DedupStatus::Succeeded => ClaimOutcome::Completed {
                succeeded_at: record.reference_time(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn policy() -> ExpiryPolicy {
        ExpiryPolicy::new(Duration::from_millis(5_000), Duration::from_secs(60))
    }

    #[test]
    fn test_record_serializes_status_names() {
        let mut record = DedupRecord::processing("billing", "msg-1", at(1_000));
        record.succeed(at(2_000));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "SUCCEEDED");
        assert_eq!(json["scope"], "billing");

        let back: DedupRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_processing_record_expires_at_window() {
        let record = DedupRecord::processing("app", "m2", at(0));

        assert!(policy().is_live(&record, at(4_999)));
        assert!(!policy().is_live(&record, at(5_000)));
        assert!(!policy().is_live(&record, at(5_001)));
    }

    #[test]
    fn test_succeeded_record_uses_retention_window() {
        let mut record = DedupRecord::processing("app", "m1", at(0));
        record.succeed(at(200));

        // Processing window no longer applies once succeeded
        assert!(policy().is_live(&record, at(10_000)));
        assert!(policy().is_live(&record, at(60_199)));
        assert!(!policy().is_live(&record, at(60_200)));
    }

    #[test]
    fn test_status_string_encoding() {
        assert_eq!("PROCESSING".parse::<DedupStatus>().unwrap(), DedupStatus::Processing);
        assert_eq!(DedupStatus::Succeeded.to_string(), "SUCCEEDED");
        assert!(matches!(
            "DONE".parse::<DedupStatus>(),
            Err(DedupError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_blocked_by_reports_state() {
        let mut record = DedupRecord::processing("app", "k", at(10));
        assert_eq!(
            ClaimOutcome::blocked_by(&record),
            ClaimOutcome::InFlight { claimed_at: at(10) }
        );

        record.succeed(at(20));
        assert_eq!(
            ClaimOutcome::blocked_by(&record),
            ClaimOutcome::Completed { succeeded_at: at(20) }
        );
    }
}
