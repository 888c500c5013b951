//! Image execution capability and the per-descriptor execution plan
//!
//! The pixel work itself happens behind [`ImageExecutor`]; this module only
//! decides which capability calls an [`OperationDescriptor`] turns into and
//! where the inputs and the result live.

pub mod openai;

pub use openai::{OpenAiImageExecutor, OpenAiImageExecutorConfig};

use crate::error::{WorkerError, WorkerResult};
use crate::protocol::messages::ImageTaskRequest;
use crate::resolution::{IndexedImage, OperationDescriptor, OperationKind};
use crate::storage::{ImageStore, StoredImage};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Raw image content with its MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl ImageBytes {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "image/png")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StyleTransferOutcome {
    Image(ImageBytes),
    /// No style-transfer backend is configured or reachable
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Invalid executor response: {0}")]
    InvalidResponse(String),
    #[error("Executor timed out: {0}")]
    Timeout(String),
}

impl From<reqwest::Error> for ExecutorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExecutorError::Timeout(e.to_string())
        } else if e.is_decode() {
            ExecutorError::InvalidResponse(e.to_string())
        } else {
            ExecutorError::Http(e.to_string())
        }
    }
}

#[async_trait]
pub trait ImageExecutor: Send + Sync {
    async fn generate_from_text(&self, instruction: &str) -> Result<ImageBytes, ExecutorError>;

    async fn edit_image(
        &self,
        base: ImageBytes,
        instruction: &str,
        references: Vec<ImageBytes>,
    ) -> Result<ImageBytes, ExecutorError>;

    async fn style_transfer(
        &self,
        content: ImageBytes,
        style: ImageBytes,
    ) -> Result<StyleTransferOutcome, ExecutorError>;
}

/// What an executed descriptor produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stored: StoredImage,
    pub from_style_image: bool,
}

/// Run an executable descriptor end to end: load inputs, call the executor,
/// store the result.
pub async fn execute(
    descriptor: &OperationDescriptor,
    request: &ImageTaskRequest,
    store: &dyn ImageStore,
    executor: &dyn ImageExecutor,
) -> WorkerResult<ExecutionResult> {
    let kind = descriptor
        .kind
        .ok_or_else(|| WorkerError::internal("descriptor has no operation kind"))?;
    if descriptor.needs_clarification {
        return Err(WorkerError::internal(
            "clarification descriptors are not executable",
        ));
    }
    let instruction = descriptor.instruction_text.as_str();

    let (image, from_style_image) = match kind {
        OperationKind::Generate => (executor.generate_from_text(instruction).await?, false),
        OperationKind::Edit => {
            let base = load_base(descriptor, store).await?;
            let references = load_all(&descriptor.references, store).await?;
            let edited = executor.edit_image(base, instruction, references).await?;

            let style = if descriptor.apply_style_transfer {
                load_optional(request.style_image_path.as_deref(), store).await?
            } else {
                None
            };
            match style {
                Some(style) => stylize_or_keep(executor, edited, style).await?,
                None => (edited, false),
            }
        }
        OperationKind::StyleTransfer => {
            let base = load_base(descriptor, store).await?;
            let style_locator = request
                .style_image_path
                .as_deref()
                .or_else(|| descriptor.references.first().map(|r| r.locator.as_str()));
            let style = load_optional(style_locator, store).await?;

            let transferred = match &style {
                Some(style) => executor.style_transfer(base.clone(), style.clone()).await?,
                None => StyleTransferOutcome::Unavailable,
            };
            match transferred {
                StyleTransferOutcome::Image(image) => (image, true),
                StyleTransferOutcome::Unavailable => {
                    debug!("Style transfer unavailable, editing with instruction instead");
                    let mut references = load_all(&descriptor.references, store).await?;
                    if request.style_image_path.is_some() {
                        if let Some(style) = style {
                            references.insert(0, style);
                        }
                    }
                    (
                        executor.edit_image(base, instruction, references).await?,
                        false,
                    )
                }
            }
        }
    };

    let stored = store.put_image(image.bytes, &image.content_type).await?;
    info!(
        kind = %kind,
        locator = %stored.locator,
        from_style_image,
        "Stored result image"
    );
    Ok(ExecutionResult {
        stored,
        from_style_image,
    })
}

async fn stylize_or_keep(
    executor: &dyn ImageExecutor,
    edited: ImageBytes,
    style: ImageBytes,
) -> WorkerResult<(ImageBytes, bool)> {
    match executor.style_transfer(edited.clone(), style).await? {
        StyleTransferOutcome::Image(image) => Ok((image, true)),
        StyleTransferOutcome::Unavailable => {
            warn!("Style transfer unavailable, returning the edited image");
            Ok((edited, false))
        }
    }
}

async fn load_base(
    descriptor: &OperationDescriptor,
    store: &dyn ImageStore,
) -> WorkerResult<ImageBytes> {
    let base = descriptor
        .base
        .as_ref()
        .ok_or_else(|| WorkerError::internal("operation requires a base image"))?;
    load(base, store).await
}

async fn load(image: &IndexedImage, store: &dyn ImageStore) -> WorkerResult<ImageBytes> {
    let (bytes, content_type) = store.get_image(&image.locator).await?;
    Ok(ImageBytes::new(bytes, content_type))
}

async fn load_all(
    images: &[IndexedImage],
    store: &dyn ImageStore,
) -> WorkerResult<Vec<ImageBytes>> {
    let mut loaded = Vec::with_capacity(images.len());
    for image in images {
        loaded.push(load(image, store).await?);
    }
    Ok(loaded)
}

async fn load_optional(
    locator: Option<&str>,
    store: &dyn ImageStore,
) -> WorkerResult<Option<ImageBytes>> {
    match locator {
        Some(locator) => {
            let (bytes, content_type) = store.get_image(locator).await?;
            Ok(Some(ImageBytes::new(bytes, content_type)))
        }
        None => Ok(None),
    }
}
