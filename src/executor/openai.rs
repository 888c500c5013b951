//! OpenAI Images API executor with an optional HTTP style-transfer backend

use super::{ExecutorError, ImageBytes, ImageExecutor, StyleTransferOutcome};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest API error body carried into an error message
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Clone)]
pub struct OpenAiImageExecutorConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub size: String,
    pub timeout: Duration,
    /// Style-transfer service; `None` means style transfer is unavailable
    pub style_transfer_url: Option<String>,
}

impl Default for OpenAiImageExecutorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-image-1".to_string(),
            size: "1024x1024".to_string(),
            timeout: Duration::from_secs(120),
            style_transfer_url: None,
        }
    }
}

pub struct OpenAiImageExecutor {
    config: OpenAiImageExecutorConfig,
    client: Client,
}

impl OpenAiImageExecutor {
    pub fn new(config: OpenAiImageExecutorConfig) -> Result<Self, ExecutorError> {
        if config.api_key.is_empty() {
            return Err(ExecutorError::Http(
                "OpenAI API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExecutorError::Http(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Turn a non-success status into an `Api` error
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExecutorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message: String = body.chars().take(MAX_ERROR_BODY).collect();
        Err(ExecutorError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// First `data[].b64_json` entry of an Images API response
    fn decode_images_response(response: ImagesResponse) -> Result<ImageBytes, ExecutorError> {
        let encoded = response
            .data
            .into_iter()
            .find_map(|item| item.b64_json)
            .ok_or_else(|| {
                ExecutorError::InvalidResponse("response contains no b64_json image".to_string())
            })?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| ExecutorError::InvalidResponse(format!("base64 decode failed: {e}")))?;
        Ok(ImageBytes::png(bytes))
    }

    fn image_part(image: ImageBytes, file_name: String) -> Result<Part, ExecutorError> {
        Part::bytes(image.bytes)
            .file_name(file_name)
            .mime_str(&image.content_type)
            .map_err(|e| ExecutorError::Http(format!("invalid content type: {e}")))
    }
}

#[async_trait]
impl ImageExecutor for OpenAiImageExecutor {
    async fn generate_from_text(&self, instruction: &str) -> Result<ImageBytes, ExecutorError> {
        debug!(model = %self.config.model, "Requesting image generation");
        let response = self
            .client
            .post(self.endpoint("images/generations"))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "prompt": instruction,
                "n": 1,
                "size": self.config.size,
            }))
            .send()
            .await?;

        let response = Self::check_status(response).await?;
        let payload: ImagesResponse = response.json().await?;
        Self::decode_images_response(payload)
    }

    async fn edit_image(
        &self,
        base: ImageBytes,
        instruction: &str,
        references: Vec<ImageBytes>,
    ) -> Result<ImageBytes, ExecutorError> {
        debug!(
            model = %self.config.model,
            references = references.len(),
            "Requesting image edit"
        );
        let mut form = Form::new()
            .text("model", self.config.model.clone())
            .text("prompt", edit_prompt(instruction, references.len()))
            .text("n", "1")
            .text("size", self.config.size.clone());

        form = form.part("image[]", Self::image_part(base, "base.png".to_string())?);
        for (i, reference) in references.into_iter().enumerate() {
            form = form.part(
                "image[]",
                Self::image_part(reference, format!("reference-{i}.png"))?,
            );
        }

        let response = self
            .client
            .post(self.endpoint("images/edits"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        let response = Self::check_status(response).await?;
        let payload: ImagesResponse = response.json().await?;
        Self::decode_images_response(payload)
    }

    async fn style_transfer(
        &self,
        content: ImageBytes,
        style: ImageBytes,
    ) -> Result<StyleTransferOutcome, ExecutorError> {
        let Some(url) = self.config.style_transfer_url.as_deref() else {
            return Ok(StyleTransferOutcome::Unavailable);
        };

        let response = self
            .client
            .post(url)
            .json(&StyleTransferRequest {
                content_b64: BASE64.encode(&content.bytes),
                style_b64: BASE64.encode(&style.bytes),
            })
            .send()
            .await?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            warn!("Style transfer backend reported unavailable");
            return Ok(StyleTransferOutcome::Unavailable);
        }

        let response = Self::check_status(response).await?;
        let payload: StyleTransferResponse = response.json().await?;
        let bytes = BASE64
            .decode(payload.image_b64.as_bytes())
            .map_err(|e| ExecutorError::InvalidResponse(format!("base64 decode failed: {e}")))?;
        Ok(StyleTransferOutcome::Image(ImageBytes::png(bytes)))
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    b64_json: Option<String>,
}

#[derive(Debug, Serialize)]
struct StyleTransferRequest {
    content_b64: String,
    style_b64: String,
}

#[derive(Debug, Deserialize)]
struct StyleTransferResponse {
    image_b64: String,
}

/// The base is always the first image part; references only guide the edit
fn edit_prompt(instruction: &str, reference_count: usize) -> String {
    match reference_count {
        0 => instruction.to_string(),
        1 => format!(
            "{instruction}\nEdit the first image. Use the 1 other image only as a reference for the edit."
        ),
        n => format!(
            "{instruction}\nEdit the first image. Use the {n} other images only as references for the edit."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_prompt_mentions_references() {
        assert_eq!(edit_prompt("make it red", 0), "make it red");
        assert!(edit_prompt("make it red", 1)
            .ends_with("Use the 1 other image only as a reference for the edit."));
        let prompt = edit_prompt("make it red", 3);
        assert!(prompt.starts_with("make it red\n"));
        assert!(prompt.contains("Use the 3 other images only as references"));
    }

    #[test]
    fn test_config_default() {
        let config = OpenAiImageExecutorConfig::default();
        assert_eq!(config.model, "gpt-image-1");
        assert_eq!(config.size, "1024x1024");
        assert!(config.style_transfer_url.is_none());
    }

    #[test]
    fn test_requires_api_key() {
        let result = OpenAiImageExecutor::new(OpenAiImageExecutorConfig::default());
        assert!(matches!(result, Err(ExecutorError::Http(_))));
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let executor = OpenAiImageExecutor::new(OpenAiImageExecutorConfig {
            api_key: "k".into(),
            base_url: "http://localhost:9000/v1/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            executor.endpoint("images/edits"),
            "http://localhost:9000/v1/images/edits"
        );
    }

    #[test]
    fn test_decode_images_response() {
        let payload: ImagesResponse = serde_json::from_value(json!({
            "data": [{"url": "https://example.invalid/a.png"}, {"b64_json": BASE64.encode(b"png")}]
        }))
        .unwrap();

        let image = OpenAiImageExecutor::decode_images_response(payload).unwrap();
        assert_eq!(image.bytes, b"png");
        assert_eq!(image.content_type, "image/png");
    }

    #[test]
    fn test_decode_rejects_missing_and_corrupt_data() {
        let empty: ImagesResponse = serde_json::from_value(json!({"data": []})).unwrap();
        assert!(matches!(
            OpenAiImageExecutor::decode_images_response(empty),
            Err(ExecutorError::InvalidResponse(_))
        ));

        let corrupt: ImagesResponse =
            serde_json::from_value(json!({"data": [{"b64_json": "%%%"}]})).unwrap();
        assert!(matches!(
            OpenAiImageExecutor::decode_images_response(corrupt),
            Err(ExecutorError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_style_transfer_without_backend_is_unavailable() {
        let executor = OpenAiImageExecutor::new(OpenAiImageExecutorConfig {
            api_key: "k".into(),
            ..Default::default()
        })
        .unwrap();

        let outcome = executor
            .style_transfer(ImageBytes::png(vec![1]), ImageBytes::png(vec![2]))
            .await
            .unwrap();
        assert_eq!(outcome, StyleTransferOutcome::Unavailable);
    }
}
