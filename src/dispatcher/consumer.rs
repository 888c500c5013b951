//! Per-delivery state machine
//!
//! `Received -> Claimed -> Resolved -> {Executed | Clarified | ExecutionFailed}
//! -> Published -> Committed -> Acked`, with early exits for duplicates (ack),
//! malformed payloads (reject) and failures (reject). Every delivery is
//! settled exactly once.

use crate::dispatch_span;
use crate::error::WorkerError;
use crate::executor::{self, ImageExecutor};
use crate::idempotency::{ClaimOutcome, ClaimingStore};
use crate::observability::health::HealthServer;
use crate::observability::metrics::metrics;
use crate::protocol::messages::{peek_chat_summary, ImageTaskRequest, OutboundResponse, RequestError};
use crate::protocol::summary::append_chat_summary;
use crate::publisher::ResponsePublisher;
use crate::resolution::resolver::resolve_with_signals;
use crate::resolution::{index_request, FallbackClassifier, Signals};
use crate::storage::ImageStore;
use crate::transport::{Delivery, Transport};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acked(DispatchReason),
    Rejected(DispatchReason),
}

impl DispatchOutcome {
    pub fn reason(self) -> DispatchReason {
        match self {
            DispatchOutcome::Acked(reason) | DispatchOutcome::Rejected(reason) => reason,
        }
    }

    pub fn is_acked(self) -> bool {
        matches!(self, DispatchOutcome::Acked(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReason {
    Completed,
    Clarified,
    Duplicate(ClaimOutcome),
    Malformed,
    ValidationFailed,
    ClaimFailed,
    ExecutorFailed,
    PublishFailed,
}

impl DispatchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchReason::Completed => "completed",
            DispatchReason::Clarified => "clarified",
            DispatchReason::Duplicate(ClaimOutcome::AlreadyDone) => "duplicate_done",
            DispatchReason::Duplicate(_) => "duplicate_in_progress",
            DispatchReason::Malformed => "malformed",
            DispatchReason::ValidationFailed => "validation_failed",
            DispatchReason::ClaimFailed => "claim_failed",
            DispatchReason::ExecutorFailed => "executor_failed",
            DispatchReason::PublishFailed => "publish_failed",
        }
    }
}

impl fmt::Display for DispatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs one delivery end to end against the injected capabilities
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    idempotency: ClaimingStore,
    publisher: ResponsePublisher<T>,
    executor: Arc<dyn ImageExecutor>,
    store: Arc<dyn ImageStore>,
    classifier: Option<FallbackClassifier>,
    health: Option<Arc<HealthServer>>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        idempotency: ClaimingStore,
        publisher: ResponsePublisher<T>,
        executor: Arc<dyn ImageExecutor>,
        store: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            transport,
            idempotency,
            publisher,
            executor,
            store,
            classifier: None,
            health: None,
        }
    }

    pub fn with_classifier(mut self, classifier: FallbackClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_health_server(mut self, health: Arc<HealthServer>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Process and settle one delivery
    pub async fn handle_delivery(&self, delivery: Delivery) -> DispatchOutcome {
        let span = dispatch_span!(
            tag = delivery.tag,
            redelivered = delivery.redelivered,
            request_id = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            metrics().request_received();
            metrics().processing_started();
            let started = Instant::now();

            let outcome = self.process(&delivery).await;
            self.settle(&delivery, outcome).await;

            metrics().processing_finished(started.elapsed());
            if let Some(health) = &self.health {
                health.mark_request_processed();
            }
            tracing::Span::current().record("outcome", outcome.reason().as_str());
            info!(
                acked = outcome.is_acked(),
                reason = %outcome.reason(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Delivery settled"
            );
            outcome
        }
        .instrument(span)
        .await
    }

    async fn process(&self, delivery: &Delivery) -> DispatchOutcome {
        let parsed = ImageTaskRequest::from_slice(&delivery.payload);
        let request_id = match &parsed {
            Ok(request) => request.request_id.clone(),
            Err(RequestError::Invalid { request_id, .. }) => request_id.clone(),
            Err(RequestError::Malformed(reason)) => {
                metrics().malformed_request();
                warn!(reason = %reason, "Rejecting malformed request");
                return DispatchOutcome::Rejected(DispatchReason::Malformed);
            }
        };
        tracing::Span::current().record("request_id", request_id.as_str());

        match self.idempotency.claim(&request_id).await {
            Ok(ClaimOutcome::Claimed) => metrics().request_claimed(),
            Ok(duplicate) => {
                metrics().duplicate_delivery();
                info!(claim = %duplicate, "Duplicate delivery, acknowledging without side effects");
                return DispatchOutcome::Acked(DispatchReason::Duplicate(duplicate));
            }
            Err(e) => {
                let summary = peek_chat_summary(&delivery.payload);
                let response = WorkerError::from(e).to_error_response(&request_id, &summary);
                if let Err(publish_error) = self.publisher.publish(&response).await {
                    error!(error = %publish_error, "Could not report idempotency failure");
                }
                return DispatchOutcome::Rejected(DispatchReason::ClaimFailed);
            }
        }

        let request = match parsed {
            Ok(request) => request,
            Err(e) => return self.fail_validation(delivery, &request_id, e.into()).await,
        };

        let index = index_request(&request);
        let signals = match Signals::extract(&request.prompt, &index) {
            Ok(signals) => signals,
            Err(e) => return self.fail_validation(delivery, &request_id, e.into()).await,
        };

        let mut descriptor = resolve_with_signals(&index, &signals);
        if let Some(classifier) = &self.classifier {
            descriptor = classifier
                .refine(&request, &index, &signals, descriptor)
                .await;
        }
        info!(
            rule = %descriptor.rule,
            kind = %descriptor.outcome_label(),
            low_confidence = descriptor.low_confidence,
            advisory = descriptor.advisory,
            "Request resolved"
        );

        if !descriptor.is_executable() {
            metrics().clarification_returned();
            let summary = append_chat_summary(
                &request.chat_summary,
                &request.prompt,
                &descriptor.clarification_reason,
            );
            let response = OutboundResponse::clarification(
                &request_id,
                descriptor.clarification_reason.as_str(),
                summary,
            );
            return self
                .publish_and_commit(&request_id, &response, DispatchReason::Clarified)
                .await;
        }

        let execution = executor::execute(
            &descriptor,
            &request,
            self.store.as_ref(),
            self.executor.as_ref(),
        )
        .await;

        match execution {
            Ok(result) => {
                metrics().execution_succeeded();
                let summary = append_chat_summary(
                    &request.chat_summary,
                    &request.prompt,
                    &descriptor.result_description,
                );
                let response = OutboundResponse::success(
                    &request_id,
                    &result.stored,
                    descriptor.result_description.as_str(),
                    summary,
                    result.from_style_image,
                );
                self.publish_and_commit(&request_id, &response, DispatchReason::Completed)
                    .await
            }
            Err(e) => {
                metrics().execution_failed();
                error!(error = %e, error_kind = e.kind(), "Execution failed");
                let response = e.to_error_response(&request_id, &request.chat_summary);
                self.publish_and_commit(&request_id, &response, DispatchReason::ExecutorFailed)
                    .await
            }
        }
    }

    async fn fail_validation(
        &self,
        delivery: &Delivery,
        request_id: &str,
        error: WorkerError,
    ) -> DispatchOutcome {
        metrics().validation_failed();
        warn!(error = %error, "Request failed validation");
        let summary = peek_chat_summary(&delivery.payload);
        let response = error.to_error_response(request_id, &summary);
        self.publish_and_commit(request_id, &response, DispatchReason::ValidationFailed)
            .await
    }

    /// Publish the terminal response, then commit. A response that never left
    /// the process releases the claim instead, so a redelivery or dead-letter
    /// redrive runs the request again and can answer it.
    async fn publish_and_commit(
        &self,
        request_id: &str,
        response: &OutboundResponse,
        reason: DispatchReason,
    ) -> DispatchOutcome {
        if let Err(e) = self.publisher.publish(response).await {
            error!(error = %e, kind = response.kind(), "Response could not be published");
            self.idempotency.release(request_id).await;
            return match reason {
                DispatchReason::ExecutorFailed | DispatchReason::ValidationFailed => {
                    DispatchOutcome::Rejected(reason)
                }
                _ => DispatchOutcome::Rejected(DispatchReason::PublishFailed),
            };
        }

        self.idempotency.commit(request_id).await;

        match reason {
            DispatchReason::Completed | DispatchReason::Clarified => DispatchOutcome::Acked(reason),
            other => DispatchOutcome::Rejected(other),
        }
    }

    async fn settle(&self, delivery: &Delivery, outcome: DispatchOutcome) {
        let result = match outcome {
            DispatchOutcome::Acked(_) => {
                metrics().delivery_acked();
                self.transport.ack(delivery).await
            }
            DispatchOutcome::Rejected(reason) => {
                metrics().delivery_rejected();
                self.transport.reject(delivery, reason.as_str()).await
            }
        };

        match result {
            Ok(()) => debug!(tag = delivery.tag, "Delivery settled with broker"),
            Err(e) => error!(
                tag = delivery.tag,
                error = %e,
                "Failed to settle delivery; the broker will redeliver it"
            ),
        }
    }
}
