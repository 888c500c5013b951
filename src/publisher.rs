//! Response publisher with bounded retry
//!
//! A response is serialised once and handed to the transport up to
//! `max_attempts` times with a fixed pause between attempts. Exhaustion is
//! surfaced to the dispatcher, which dead-letters the delivery instead of
//! dropping the result.

use crate::config::PublisherSection;
use crate::observability::metrics::metrics;
use crate::protocol::OutboundResponse;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to serialise response: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Publish failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

pub struct ResponsePublisher<T: Transport> {
    transport: Arc<T>,
    topic: String,
    max_attempts: u32,
    backoff: Duration,
}

impl<T: Transport> ResponsePublisher<T> {
    pub fn new(transport: Arc<T>, topic: impl Into<String>, settings: &PublisherSection) -> Self {
        Self {
            transport,
            topic: topic.into(),
            max_attempts: settings.max_attempts.max(1),
            backoff: Duration::from_millis(settings.backoff_ms),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `response`, retrying transient transport failures
    pub async fn publish(&self, response: &OutboundResponse) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(response)?;
        let request_id = response.request_id();
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.transport.publish(&self.topic, payload.clone()).await {
                Ok(()) => {
                    metrics().response_published();
                    debug!(
                        request_id,
                        kind = response.kind(),
                        attempt,
                        topic = %self.topic,
                        "Response published"
                    );
                    return Ok(());
                }
                Err(e) => {
                    metrics().publish_retry();
                    last_error = e.to_string();
                    warn!(
                        request_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Response publish attempt failed"
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        metrics().publish_failed();
        error!(
            request_id,
            attempts = self.max_attempts,
            "Giving up on response publish"
        );
        Err(PublishError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
