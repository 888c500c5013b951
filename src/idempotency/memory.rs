//! Process-local idempotency store for tests and ephemeral runs

use super::{ClaimOutcome, IdempotencyError, IdempotencyStore, RecordStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, (RecordStatus, DateTime<Utc>)>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_claim(&self, request_id: &str) -> Result<ClaimOutcome, IdempotencyError> {
        let mut records = self.records.lock().await;
        if let Some(duplicate) = records
            .get(request_id)
            .and_then(|(status, _)| status.as_claim_outcome())
        {
            return Ok(duplicate);
        }
        records.insert(
            request_id.to_string(),
            (RecordStatus::InProgress, Utc::now()),
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn commit(&self, request_id: &str) -> Result<(), IdempotencyError> {
        self.records
            .lock()
            .await
            .insert(request_id.to_string(), (RecordStatus::Done, Utc::now()));
        Ok(())
    }

    async fn release(&self, request_id: &str) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(request_id) {
            if record.0 == RecordStatus::InProgress {
                *record = (RecordStatus::Failed, Utc::now());
            }
        }
        Ok(())
    }

    async fn status(&self, request_id: &str) -> Result<Option<RecordStatus>, IdempotencyError> {
        Ok(self
            .records
            .lock()
            .await
            .get(request_id)
            .map(|(status, _)| *status))
    }

    async fn health_check(&self) -> Result<(), IdempotencyError> {
        Ok(())
    }
}
