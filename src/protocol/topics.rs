//! Topic normalisation and worker ID validation
//!
//! The worker publishes to fixed, configured topic names; these helpers keep
//! those names well-formed before they ever reach the broker.

use thiserror::Error;

/// Normalise a configured topic name.
///
/// Trims whitespace, collapses repeated slashes and strips a trailing slash.
/// A leading slash is preserved because MQTT treats it as a distinct level.
pub fn normalize_topic(topic: &str) -> String {
    let mut result = topic.trim().to_string();

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Validate a topic the worker will publish or subscribe to by exact name.
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    if topic.trim().is_empty() || topic == "/" {
        return Err(ValidationError::EmptyTopic);
    }

    for ch in topic.chars() {
        if ch == '+' || ch == '#' || ch == '\0' {
            return Err(ValidationError::InvalidTopicChar(ch));
        }
    }

    if topic.len() > u16::MAX as usize {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }

    Ok(())
}

pub fn validate_worker_id(worker_id: &str) -> Result<(), ValidationError> {
    if worker_id.is_empty() {
        return Err(ValidationError::EmptyWorkerId);
    }

    for ch in worker_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidWorkerIdChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Worker ID cannot be empty")]
    EmptyWorkerId,
    #[error("Worker ID contains invalid character: '{0}'")]
    InvalidWorkerIdChar(char),
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic contains invalid character: '{0:?}'")]
    InvalidTopicChar(char),
    #[error("Topic is {0} bytes, longer than MQTT allows")]
    TopicTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_topic_is_idempotent(topic in ".*") {
            let first = normalize_topic(&topic);
            let second = normalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn normalize_topic_no_consecutive_slashes(topic in ".*") {
            let result = normalize_topic(&topic);
            prop_assert!(!result.contains("//"), "No consecutive slashes allowed: {}", result);
        }

        #[test]
        fn test_valid_worker_id_format(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_worker_id(&id).is_ok(), "Valid worker ID should pass: {}", id);
        }

        #[test]
        fn test_invalid_worker_id_chars(id in "[^a-zA-Z0-9._-]{1}[a-zA-Z0-9._-]*") {
            prop_assert!(validate_worker_id(&id).is_err(), "Invalid worker ID should fail: {}", id);
        }
    }

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize_topic("ai/image/request"), "ai/image/request");
        assert_eq!(normalize_topic(" ai//image/request/ "), "ai/image/request");
        assert_eq!(normalize_topic("/ai/image"), "/ai/image");
        assert_eq!(normalize_topic("/"), "/");
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("ai/image/request").is_ok());
        assert_eq!(validate_topic_name(""), Err(ValidationError::EmptyTopic));
        assert_eq!(validate_topic_name("/"), Err(ValidationError::EmptyTopic));
        assert_eq!(
            validate_topic_name("ai/+/request"),
            Err(ValidationError::InvalidTopicChar('+'))
        );
        assert_eq!(
            validate_topic_name("ai/#"),
            Err(ValidationError::InvalidTopicChar('#'))
        );
    }

    #[test]
    fn test_worker_id_validation_examples() {
        assert!(validate_worker_id("image-worker").is_ok());
        assert!(validate_worker_id("worker_1.gpu").is_ok());

        assert_eq!(validate_worker_id(""), Err(ValidationError::EmptyWorkerId));
        assert_eq!(
            validate_worker_id("worker@host"),
            Err(ValidationError::InvalidWorkerIdChar('@'))
        );
        assert!(validate_worker_id("worker/1").is_err());
    }
}
