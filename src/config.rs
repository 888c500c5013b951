//! Worker configuration
//!
//! Loaded from a TOML file. Secrets are never stored in the file; sections
//! carry the *name* of the environment variable that holds them and the
//! value is read at runtime.

use crate::protocol::topics::{normalize_topic, validate_topic_name, validate_worker_id};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub worker: WorkerSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub idempotency: IdempotencySection,
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub storage: StorageSection,
    /// Optional LLM fallback classifier for ambiguous requests
    pub classifier: Option<ClassifierSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSection {
    /// Worker identifier (must match [a-zA-Z0-9._-]+), also the MQTT client id
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Number of dispatch workers pulling deliveries concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_request_topic")]
    pub request_topic: String,
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,
    /// Persistent session lifetime on the broker
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u32,
}

fn default_request_topic() -> String {
    "ai/image/request".to_string()
}

fn default_response_topic() -> String {
    "ai/image/response".to_string()
}

fn default_dead_letter_topic() -> String {
    "ai/image/request/dlx".to_string()
}

fn default_session_expiry() -> u32 {
    3600
}

/// What to do when the idempotency store itself is failing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the request as claimed and process it; a rare duplicate is preferred to a lost request
    #[default]
    FailOpen,
    /// Reject the delivery; a lost request is preferred to a duplicate
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencySection {
    /// SQLite database path
    #[serde(default = "default_idempotency_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_idempotency_path() -> PathBuf {
    PathBuf::from("data/idempotency.db")
}

impl Default for IdempotencySection {
    fn default() -> Self {
        Self {
            path: default_idempotency_path(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorSection {
    #[serde(default = "default_executor_base_url")]
    pub base_url: String,
    #[serde(default = "default_executor_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_image_size")]
    pub size: String,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
    /// GPU style-transfer service; style transfer is unavailable when unset
    pub style_transfer_url: Option<String>,
}

fn default_executor_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_executor_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_image_model() -> String {
    "gpt-image-1".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_executor_timeout() -> u64 {
    120
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            base_url: default_executor_base_url(),
            api_key_env: default_executor_api_key_env(),
            image_model: default_image_model(),
            size: default_image_size(),
            timeout_secs: default_executor_timeout(),
            style_transfer_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    /// Directory image locators are resolved against
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Key prefix for generated images
    #[serde(default = "default_storage_prefix")]
    pub prefix: String,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/images")
}

fn default_storage_prefix() -> String {
    "generated".to_string()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            prefix: default_storage_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierSection {
    /// Provider name; only "openai" is supported
    #[serde(default = "default_classifier_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default = "default_executor_api_key_env")]
    pub api_key_env: String,
    /// Override for OpenAI-compatible endpoints
    pub base_url: Option<String>,
    #[serde(default = "default_classifier_temperature")]
    pub temperature: f32,
}

fn default_classifier_provider() -> String {
    "openai".to_string()
}

fn default_classifier_temperature() -> f32 {
    0.1
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid worker ID format: {0}")]
    InvalidWorkerId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WorkerConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: WorkerConfig = toml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.mqtt.request_topic = normalize_topic(&self.mqtt.request_topic);
        self.mqtt.response_topic = normalize_topic(&self.mqtt.response_topic);
        self.mqtt.dead_letter_topic = normalize_topic(&self.mqtt.dead_letter_topic);
        self.executor.base_url = self.executor.base_url.trim_end_matches('/').to_string();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_worker_id(&self.worker.id).map_err(|e| {
            ConfigError::InvalidWorkerId(format!(
                "Worker ID '{}' must match pattern [a-zA-Z0-9._-]+ ({e})",
                self.worker.id
            ))
        })?;

        let topics = [
            ("mqtt.request_topic", &self.mqtt.request_topic),
            ("mqtt.response_topic", &self.mqtt.response_topic),
            ("mqtt.dead_letter_topic", &self.mqtt.dead_letter_topic),
        ];
        for (name, topic) in topics {
            validate_topic_name(topic)
                .map_err(|e| ConfigError::InvalidConfig(format!("{name}: {e}")))?;
        }
        if self.mqtt.request_topic == self.mqtt.response_topic
            || self.mqtt.request_topic == self.mqtt.dead_letter_topic
            || self.mqtt.response_topic == self.mqtt.dead_letter_topic
        {
            return Err(ConfigError::InvalidConfig(
                "request, response and dead-letter topics must be distinct".to_string(),
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.publisher.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "publisher.max_attempts must be at least 1".to_string(),
            ));
        }

        if let Some(classifier) = &self.classifier {
            if classifier.provider != "openai" {
                return Err(ConfigError::InvalidConfig(format!(
                    "Unsupported classifier provider: {}",
                    classifier.provider
                )));
            }
            if !(0.0..=2.0).contains(&classifier.temperature) {
                return Err(ConfigError::InvalidConfig(
                    "classifier.temperature must be between 0.0 and 2.0".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Get image API key from environment variable
    pub fn get_executor_api_key(&self) -> Result<String, ConfigError> {
        Self::get_env_var_required(&self.executor.api_key_env)
    }

    /// Get classifier API key, if a classifier is configured
    pub fn get_classifier_api_key(&self) -> Option<Result<String, ConfigError>> {
        self.classifier
            .as_ref()
            .map(|c| Self::get_env_var_required(&c.api_key_env))
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[worker]
id = "test-worker"
description = "A test worker"

[mqtt]
broker_url = "mqtt://localhost:1883"

[idempotency]
path = "/tmp/does-not-matter.db"

[publisher]
max_attempts = 3
backoff_ms = 1
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}
