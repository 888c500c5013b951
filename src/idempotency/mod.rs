//! Idempotency store: at-most-once side effects over at-least-once delivery
//!
//! A request is claimed (InProgress) before any work and committed (Done)
//! after its response has been handed to the publisher. A claim whose
//! response could not be published is released (Failed) and may be claimed
//! again by a redelivery. Records are never deleted here; retention is an
//! operational concern.
//!
//! Storage failures during a claim follow [`FailurePolicy`]. The default is
//! fail-open: the claim is treated as won, trading a rare duplicate response
//! for never losing a request. Callers that need the opposite can configure
//! fail-closed.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryIdempotencyStore;
pub use sqlite::SqliteIdempotencyStore;

use crate::config::FailurePolicy;
use crate::observability::metrics::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyInProgress,
    AlreadyDone,
}

impl ClaimOutcome {
    pub fn is_duplicate(self) -> bool {
        !matches!(self, ClaimOutcome::Claimed)
    }
}

impl fmt::Display for ClaimOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimOutcome::Claimed => write!(f, "claimed"),
            ClaimOutcome::AlreadyInProgress => write!(f, "already_in_progress"),
            ClaimOutcome::AlreadyDone => write!(f, "already_done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    InProgress,
    Done,
    /// Released after a publish failure; claimable again
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::InProgress => "IN_PROGRESS",
            RecordStatus::Done => "DONE",
            RecordStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, IdempotencyError> {
        match value {
            "IN_PROGRESS" => Ok(RecordStatus::InProgress),
            "DONE" => Ok(RecordStatus::Done),
            "FAILED" => Ok(RecordStatus::Failed),
            other => Err(IdempotencyError::CorruptRecord(format!(
                "unknown status '{other}'"
            ))),
        }
    }

    /// The duplicate outcome an existing record produces, or `None` when
    /// the record may be claimed again
    pub fn as_claim_outcome(self) -> Option<ClaimOutcome> {
        match self {
            RecordStatus::InProgress => Some(ClaimOutcome::AlreadyInProgress),
            RecordStatus::Done => Some(ClaimOutcome::AlreadyDone),
            RecordStatus::Failed => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt idempotency record: {0}")]
    CorruptRecord(String),
    #[error("Idempotency store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically create an InProgress record, or report the existing one
    async fn try_claim(&self, request_id: &str) -> Result<ClaimOutcome, IdempotencyError>;

    /// Mark the request Done. Safe to repeat.
    async fn commit(&self, request_id: &str) -> Result<(), IdempotencyError>;

    /// Mark an InProgress claim Failed so a redelivery can claim it again.
    /// Done records are left untouched.
    async fn release(&self, request_id: &str) -> Result<(), IdempotencyError>;

    /// Current status, for diagnostics
    async fn status(&self, request_id: &str) -> Result<Option<RecordStatus>, IdempotencyError>;

    async fn health_check(&self) -> Result<(), IdempotencyError>;
}

/// A store wrapped with the configured failure policy
#[derive(Clone)]
pub struct ClaimingStore {
    inner: Arc<dyn IdempotencyStore>,
    policy: FailurePolicy,
}

impl ClaimingStore {
    pub fn new(inner: Arc<dyn IdempotencyStore>, policy: FailurePolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn inner(&self) -> &Arc<dyn IdempotencyStore> {
        &self.inner
    }

    /// Claim `request_id`. Only returns an error under fail-closed.
    pub async fn claim(&self, request_id: &str) -> Result<ClaimOutcome, IdempotencyError> {
        match self.inner.try_claim(request_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => match self.policy {
                FailurePolicy::FailOpen => {
                    metrics().claim_failed_open();
                    warn!(
                        request_id,
                        error = %e,
                        "Idempotency claim failed; proceeding (fail-open), a duplicate response is possible"
                    );
                    Ok(ClaimOutcome::Claimed)
                }
                FailurePolicy::FailClosed => {
                    metrics().claim_failed_closed();
                    error!(request_id, error = %e, "Idempotency claim failed (fail-closed)");
                    Err(e)
                }
            },
        }
    }

    /// Best-effort commit; failures are logged and counted, never returned
    pub async fn commit(&self, request_id: &str) -> bool {
        match self.inner.commit(request_id).await {
            Ok(()) => true,
            Err(e) => {
                metrics().commit_failed();
                warn!(
                    request_id,
                    error = %e,
                    "Idempotency commit failed; a redelivery may be processed again"
                );
                false
            }
        }
    }

    /// Best-effort release after a publish failure
    pub async fn release(&self, request_id: &str) -> bool {
        match self.inner.release(request_id).await {
            Ok(()) => true,
            Err(e) => {
                metrics().release_failed();
                warn!(
                    request_id,
                    error = %e,
                    "Idempotency release failed; redeliveries will be treated as duplicates"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::FailingIdempotencyStore;

    #[test]
    fn test_status_round_trip() {
        for status in [RecordStatus::InProgress, RecordStatus::Done, RecordStatus::Failed] {
            assert_eq!(RecordStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(matches!(
            RecordStatus::parse("PENDING"),
            Err(IdempotencyError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_existing_status_maps_to_duplicate() {
        assert_eq!(
            RecordStatus::InProgress.as_claim_outcome(),
            Some(ClaimOutcome::AlreadyInProgress)
        );
        assert!(RecordStatus::Done
            .as_claim_outcome()
            .is_some_and(ClaimOutcome::is_duplicate));
        assert_eq!(RecordStatus::Failed.as_claim_outcome(), None);
        assert!(!ClaimOutcome::Claimed.is_duplicate());
    }

    #[tokio::test]
    async fn test_fail_open_treats_error_as_claimed() {
        let store = ClaimingStore::new(
            Arc::new(FailingIdempotencyStore),
            FailurePolicy::FailOpen,
        );

        assert_eq!(store.claim("r1").await.unwrap(), ClaimOutcome::Claimed);
        assert!(!store.commit("r1").await);
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_error() {
        let store = ClaimingStore::new(
            Arc::new(FailingIdempotencyStore),
            FailurePolicy::FailClosed,
        );

        assert!(store.claim("r1").await.is_err());
    }

    #[tokio::test]
    async fn test_claim_passes_through_outcomes() {
        let store = ClaimingStore::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            FailurePolicy::FailClosed,
        );

        assert_eq!(store.claim("r1").await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.claim("r1").await.unwrap(),
            ClaimOutcome::AlreadyInProgress
        );
        assert!(store.commit("r1").await);
        assert_eq!(store.claim("r1").await.unwrap(), ClaimOutcome::AlreadyDone);
    }

    #[tokio::test]
    async fn test_released_claim_can_be_reclaimed() {
        let store = ClaimingStore::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            FailurePolicy::FailClosed,
        );

        assert_eq!(store.claim("r1").await.unwrap(), ClaimOutcome::Claimed);
        assert!(store.release("r1").await);
        assert_eq!(store.claim("r1").await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.claim("r1").await.unwrap(),
            ClaimOutcome::AlreadyInProgress
        );
    }
}
