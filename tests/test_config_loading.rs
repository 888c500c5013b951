//! Configuration loading tests against real files on disk

use imagetask_worker::config::{ConfigError, FailurePolicy, WorkerConfig};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;


fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_minimal_config_fills_defaults() {
    let temp_file = write_config(
        r#"
[worker]
id = "image-worker"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );

    let config = WorkerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.worker.id, "image-worker");
    assert_eq!(config.worker.description, "");
    assert_eq!(config.worker.concurrency, 1);
    assert_eq!(config.mqtt.request_topic, "ai/image/request");
    assert_eq!(config.mqtt.response_topic, "ai/image/response");
    assert_eq!(config.mqtt.dead_letter_topic, "ai/image/request/dlx");
    assert_eq!(config.mqtt.session_expiry_secs, 3600);
    assert_eq!(config.idempotency.path, PathBuf::from("data/idempotency.db"));
    assert_eq!(config.idempotency.failure_policy, FailurePolicy::FailOpen);
    assert_eq!(config.publisher.max_attempts, 3);
    assert_eq!(config.publisher.backoff_ms, 500);
    assert_eq!(config.executor.base_url, "https://api.openai.com/v1");
    assert_eq!(config.executor.api_key_env, "OPENAI_API_KEY");
    assert_eq!(config.executor.image_model, "gpt-image-1");
    assert_eq!(config.executor.size, "1024x1024");
    assert!(config.executor.style_transfer_url.is_none());
    assert_eq!(config.storage.root, PathBuf::from("data/images"));
    assert_eq!(config.storage.prefix, "generated");
    assert!(config.classifier.is_none());
}

#[test]
fn test_full_config_is_loaded_and_normalized() {
    let temp_file = write_config(
        r#"
[worker]
id = "image-worker.eu_1"
description = "Image worker"
concurrency = 4

[mqtt]
broker_url = "mqtt://broker.internal:1883"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"
request_topic = "/tenant//image/request/"
response_topic = "tenant/image/response"
dead_letter_topic = "tenant/image/dlx"
session_expiry_secs = 600

[idempotency]
path = "/var/lib/worker/idempotency.db"
failure_policy = "fail_closed"

[publisher]
max_attempts = 5
backoff_ms = 250

[executor]
base_url = "https://images.example.com/v1/"
api_key_env = "IMAGE_API_KEY"
image_model = "gpt-image-1"
size = "512x512"
timeout_secs = 30
style_transfer_url = "https://style.example.com/transfer"

[storage]
root = "/srv/images"
prefix = "out"

[classifier]
model = "gpt-4o-mini"
api_key_env = "CLASSIFIER_KEY"
temperature = 0.0
"#,
    );

    let config = WorkerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.worker.concurrency, 4);
    assert_eq!(config.mqtt.request_topic, "/tenant/image/request");
    assert_eq!(config.mqtt.session_expiry_secs, 600);
    assert_eq!(config.idempotency.failure_policy, FailurePolicy::FailClosed);
    assert_eq!(config.publisher.max_attempts, 5);
    assert_eq!(config.executor.base_url, "https://images.example.com/v1");
    assert_eq!(
        config.executor.style_transfer_url.as_deref(),
        Some("https://style.example.com/transfer")
    );
    assert_eq!(config.storage.prefix, "out");

    let classifier = config.classifier.expect("classifier section");
    assert_eq!(classifier.provider, "openai");
    assert_eq!(classifier.model, "gpt-4o-mini");
    assert_eq!(classifier.temperature, 0.0);
}

#[test]
fn test_helper_config_is_valid() {
    let config = test_helpers::test_config();
    assert_eq!(config.worker.id, "integration-worker");
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_returns_error_when_worker_section_missing() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );

    match WorkerConfig::load_from_file(temp_file.path()) {
        Err(ConfigError::TomlParse(_)) => {}
        other => panic!("Expected TomlParse error for missing worker section, got {other:?}"),
    }
}

#[test]
fn test_config_returns_error_when_mqtt_section_missing() {
    let temp_file = write_config(
        r#"
[worker]
id = "image-worker"
"#,
    );

    match WorkerConfig::load_from_file(temp_file.path()) {
        Err(ConfigError::TomlParse(_)) => {}
        other => panic!("Expected TomlParse error for missing mqtt section, got {other:?}"),
    }
}

#[test]
fn test_config_returns_error_for_invalid_toml() {
    let temp_file = write_config("[worker\nid = ");

    assert!(matches!(
        WorkerConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_config_returns_error_for_empty_file() {
    let temp_file = NamedTempFile::new().unwrap();

    assert!(matches!(
        WorkerConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_config_returns_error_for_missing_file() {
    let result = WorkerConfig::load_from_file(std::path::Path::new(
        "/nonexistent/path/to/worker.toml",
    ));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_returns_error_for_invalid_worker_id() {
    for id in ["invalid@worker", "", "has space"] {
        let temp_file = write_config(&format!(
            r#"
[worker]
id = "{id}"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#
        ));

        match WorkerConfig::load_from_file(temp_file.path()) {
            Err(ConfigError::InvalidWorkerId(_)) => {}
            other => panic!("Expected InvalidWorkerId for {id:?}, got {other:?}"),
        }
    }
}

#[test]
fn test_config_rejects_shared_topics() {
    let temp_file = write_config(
        r#"
[worker]
id = "image-worker"

[mqtt]
broker_url = "mqtt://localhost:1883"
request_topic = "ai/image"
response_topic = "ai/image"
"#,
    );

    assert!(matches!(
        WorkerConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_config_rejects_wildcard_topics() {
    let temp_file = write_config(
        r#"
[worker]
id = "image-worker"

[mqtt]
broker_url = "mqtt://localhost:1883"
request_topic = "ai/+/request"
"#,
    );

    assert!(matches!(
        WorkerConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_config_rejects_zero_concurrency_and_attempts() {
    let zero_concurrency = write_config(
        r#"
[worker]
id = "image-worker"
concurrency = 0

[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );
    assert!(matches!(
        WorkerConfig::load_from_file(zero_concurrency.path()),
        Err(ConfigError::InvalidConfig(_))
    ));

    let zero_attempts = write_config(
        r#"
[worker]
id = "image-worker"

[mqtt]
broker_url = "mqtt://localhost:1883"

[publisher]
max_attempts = 0
"#,
    );
    assert!(matches!(
        WorkerConfig::load_from_file(zero_attempts.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_config_rejects_unsupported_classifier() {
    let temp_file = write_config(
        r#"
[worker]
id = "image-worker"

[mqtt]
broker_url = "mqtt://localhost:1883"

[classifier]
provider = "anthropic"
model = "claude"
"#,
    );

    match WorkerConfig::load_from_file(temp_file.path()) {
        Err(ConfigError::InvalidConfig(msg)) => assert!(msg.contains("anthropic")),
        other => panic!("Expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_config_rejects_unknown_failure_policy() {
    let temp_file = write_config(
        r#"
[worker]
id = "image-worker"

[mqtt]
broker_url = "mqtt://localhost:1883"

[idempotency]
failure_policy = "sometimes"
"#,
    );

    assert!(matches!(
        WorkerConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_secrets_are_read_from_named_env_vars() {
    let temp_file = write_config(
        r#"
[worker]
id = "image-worker"

[mqtt]
broker_url = "mqtt://localhost:1883"
username_env = "IMAGETASK_TEST_MQTT_USER"

[executor]
api_key_env = "IMAGETASK_TEST_IMAGE_KEY"

[classifier]
model = "gpt-4o-mini"
api_key_env = "IMAGETASK_TEST_CLASSIFIER_KEY_UNSET"
"#,
    );
    std::env::set_var("IMAGETASK_TEST_MQTT_USER", "worker-user");
    std::env::set_var("IMAGETASK_TEST_IMAGE_KEY", "sk-test");
    std::env::remove_var("IMAGETASK_TEST_CLASSIFIER_KEY_UNSET");

    let config = WorkerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.get_mqtt_username().as_deref(), Some("worker-user"));
    assert_eq!(config.get_mqtt_password(), None);
    assert_eq!(config.get_executor_api_key().unwrap(), "sk-test");
    match config.get_classifier_api_key() {
        Some(Err(ConfigError::EnvVarNotFound(name))) => {
            assert_eq!(name, "IMAGETASK_TEST_CLASSIFIER_KEY_UNSET")
        }
        other => panic!("Expected EnvVarNotFound, got {other:?}"),
    }
}

#[test]
fn test_example_config_parses() {
    let config = WorkerConfig::from_toml_str(include_str!("../config/worker.example.toml")).unwrap();

    assert_eq!(config.worker.id, "image-worker-1");
    assert_eq!(config.idempotency.failure_policy, FailurePolicy::FailOpen);
    assert!(config.classifier.is_none());
}
