//! Mock implementations for testing
//!
//! Provides mock Transport, ImageExecutor, ImageStore, LlmProvider and
//! IdempotencyStore implementations so the dispatch pipeline can be tested
//! without a broker, an image API or a database.

use crate::executor::{ExecutorError, ImageBytes, ImageExecutor, StyleTransferOutcome};
use crate::idempotency::{ClaimOutcome, IdempotencyError, IdempotencyStore, RecordStatus};
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use crate::storage::{content_type_for, extension_for, ImageStore, StorageError, StoredImage};
use crate::transport::{mqtt::ConnectionState, Delivery, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

pub type PublishedMessage = (String, Vec<u8>);

#[derive(Debug, Error)]
pub enum MockTransportError {
    #[error("Mock connection failure")]
    ConnectFailed,
    #[error("Mock publish failure")]
    PublishFailed,
}

/// Mock transport recording publishes and settlements
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub acked: Arc<Mutex<Vec<u64>>>,
    pub rejected: Arc<Mutex<Vec<(u64, String)>>>,
    pub should_fail_connect: bool,
    publish_failures_remaining: AtomicU32,
    publish_attempts: AtomicU32,
    connected: AtomicBool,
    subscribed: AtomicBool,
    delivery_sender: std::sync::Mutex<Option<mpsc::Sender<Delivery>>>,
    deliveries_on_connect: Vec<Delivery>,
    dropped_on_connect: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail_connect: true,
            ..Default::default()
        }
    }

    /// Push `deliveries` while connecting, as a broker replaying a persistent
    /// session does right after CONNACK
    pub fn delivering_on_connect(mut self, deliveries: Vec<Delivery>) -> Self {
        self.deliveries_on_connect = deliveries;
        self
    }

    /// Deliveries pushed during connect that found no sender
    pub fn dropped_on_connect(&self) -> u32 {
        self.dropped_on_connect.load(Ordering::SeqCst)
    }

    /// Fail the next `count` publish calls
    pub fn failing_publishes(self, count: u32) -> Self {
        self.publish_failures_remaining
            .store(count, Ordering::SeqCst);
        self
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn publish_attempts(&self) -> u32 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub async fn acked_tags(&self) -> Vec<u64> {
        self.acked.lock().await.clone()
    }

    pub async fn rejected(&self) -> Vec<(u64, String)> {
        self.rejected.lock().await.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Push a delivery through the configured sender, as the broker would
    pub async fn deliver(&self, delivery: Delivery) -> bool {
        let sender = self
            .delivery_sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        match sender {
            Some(sender) => sender.send(delivery).await.is_ok(),
            None => false,
        }
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
        self.acked.lock().await.clear();
        self.rejected.lock().await.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail_connect {
            return Err(MockTransportError::ConnectFailed);
        }
        self.connected.store(true, Ordering::SeqCst);

        let sender = self
            .delivery_sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        for delivery in std::mem::take(&mut self.deliveries_on_connect) {
            let sent = match &sender {
                Some(sender) => sender.try_send(delivery).is_ok(),
                None => false,
            };
            if !sent {
                self.dropped_on_connect.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe_requests(&mut self) -> Result<(), Self::Error> {
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .publish_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MockTransportError::PublishFailed);
        }

        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        self.acked.lock().await.push(delivery.tag);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), Self::Error> {
        self.rejected
            .lock()
            .await
            .push((delivery.tag, reason.to_string()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.is_connected() {
            Some(ConnectionState::Connected)
        } else {
            Some(ConnectionState::Disconnected("Mock disconnection".to_string()))
        }
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }

    fn set_delivery_sender(&self, sender: mpsc::Sender<Delivery>) {
        if let Ok(mut slot) = self.delivery_sender.lock() {
            *slot = Some(sender);
        }
    }
}

/// What the mock executor was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    Generate(String),
    Edit {
        base: Vec<u8>,
        instruction: String,
        references: usize,
    },
    StyleTransfer,
}

/// Mock image executor returning fixed bytes
#[derive(Debug, Default)]
pub struct MockExecutor {
    calls: Mutex<Vec<ExecutorCall>>,
    style_transfer_available: bool,
    should_fail: bool,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_style_transfer(mut self) -> Self {
        self.style_transfer_available = true;
        self
    }

    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().await.clone()
    }

    fn check(&self) -> Result<(), ExecutorError> {
        if self.should_fail {
            Err(ExecutorError::Api {
                status: 500,
                message: "Mock executor failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ImageExecutor for MockExecutor {
    async fn generate_from_text(&self, instruction: &str) -> Result<ImageBytes, ExecutorError> {
        self.check()?;
        self.calls
            .lock()
            .await
            .push(ExecutorCall::Generate(instruction.to_string()));
        Ok(ImageBytes::png(b"generated".to_vec()))
    }

    async fn edit_image(
        &self,
        base: ImageBytes,
        instruction: &str,
        references: Vec<ImageBytes>,
    ) -> Result<ImageBytes, ExecutorError> {
        self.check()?;
        self.calls.lock().await.push(ExecutorCall::Edit {
            base: base.bytes,
            instruction: instruction.to_string(),
            references: references.len(),
        });
        Ok(ImageBytes::png(b"edited".to_vec()))
    }

    async fn style_transfer(
        &self,
        _content: ImageBytes,
        _style: ImageBytes,
    ) -> Result<StyleTransferOutcome, ExecutorError> {
        self.check()?;
        self.calls.lock().await.push(ExecutorCall::StyleTransfer);
        if self.style_transfer_available {
            Ok(StyleTransferOutcome::Image(ImageBytes::png(
                b"stylized".to_vec(),
            )))
        } else {
            Ok(StyleTransferOutcome::Unavailable)
        }
    }
}

/// In-memory image store keyed by locator
#[derive(Debug, Default)]
pub struct MockImageStore {
    images: Mutex<HashMap<String, (Vec<u8>, String)>>,
    stored: Mutex<Vec<StoredImage>>,
}

impl MockImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, locator: &str, bytes: &[u8]) -> Self {
        self.images.get_mut().insert(
            locator.to_string(),
            (bytes.to_vec(), content_type_for(locator).to_string()),
        );
        self
    }

    pub async fn stored_count(&self) -> usize {
        self.stored.lock().await.len()
    }

    pub async fn stored(&self) -> Vec<StoredImage> {
        self.stored.lock().await.clone()
    }
}

#[async_trait]
impl ImageStore for MockImageStore {
    async fn put_image(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredImage, StorageError> {
        let mut stored = self.stored.lock().await;
        let image_name = format!("result-{}", stored.len() + 1);
        let extension = extension_for(content_type).to_string();
        let file_name = format!("{image_name}.{extension}");
        let image = StoredImage {
            locator: format!("results/{file_name}"),
            file_name,
            image_name,
            extension,
        };

        self.images
            .lock()
            .await
            .insert(image.locator.clone(), (bytes, content_type.to_string()));
        stored.push(image.clone());
        Ok(image)
    }

    async fn get_image(&self, locator: &str) -> Result<(Vec<u8>, String), StorageError> {
        self.images
            .lock()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(locator.to_string()))
    }
}

/// Idempotency store whose every operation fails
#[derive(Debug, Default)]
pub struct FailingIdempotencyStore;

#[async_trait]
impl IdempotencyStore for FailingIdempotencyStore {
    async fn try_claim(&self, _request_id: &str) -> Result<ClaimOutcome, IdempotencyError> {
        Err(IdempotencyError::Unavailable("mock store down".to_string()))
    }

    async fn commit(&self, _request_id: &str) -> Result<(), IdempotencyError> {
        Err(IdempotencyError::Unavailable("mock store down".to_string()))
    }

    async fn release(&self, _request_id: &str) -> Result<(), IdempotencyError> {
        Err(IdempotencyError::Unavailable("mock store down".to_string()))
    }

    async fn status(&self, _request_id: &str) -> Result<Option<RecordStatus>, IdempotencyError> {
        Err(IdempotencyError::Unavailable("mock store down".to_string()))
    }

    async fn health_check(&self) -> Result<(), IdempotencyError> {
        Err(IdempotencyError::Unavailable("mock store down".to_string()))
    }
}

/// Mock LLM provider for testing
#[derive(Debug)]
pub struct MockLlmProvider {
    pub responses: Vec<String>,
    pub current_response: Arc<Mutex<usize>>,
    pub should_fail: bool,
}

impl MockLlmProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            current_response: Arc::new(Mutex::new(0)),
            should_fail: false,
        }
    }

    pub fn with_failure() -> Self {
        Self {
            responses: vec![],
            current_response: Arc::new(Mutex::new(0)),
            should_fail: true,
        }
    }

    pub fn single_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Number of completions requested so far
    pub async fn call_count(&self) -> usize {
        *self.current_response.lock().await
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut current = self.current_response.lock().await;
        let response_idx = *current % self.responses.len().max(1);
        *current += 1;

        if self.should_fail {
            return Err(LlmError::RequestFailed("Mock LLM failure".to_string()));
        }

        let content = if self.responses.is_empty() {
            "Mock response".to_string()
        } else {
            self.responses[response_idx].clone()
        };

        Ok(CompletionResponse {
            content: Some(content),
            model: "mock-model".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
            metadata: HashMap::new(),
        })
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        if self.should_fail {
            Err(LlmError::RequestFailed(
                "Mock health check failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}
