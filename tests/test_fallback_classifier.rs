//! Fallback classifier over a mock OpenAI-compatible endpoint

use imagetask_worker::llm::{OpenAiConfig, OpenAiProvider};
use imagetask_worker::protocol::ImageTaskRequest;
use imagetask_worker::resolution::{
    index_request, resolve, FallbackClassifier, OperationKind, ResolutionRule, Signals,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};


fn classifier(server: &MockServer) -> FallbackClassifier {
    let provider = OpenAiProvider::new(OpenAiConfig {
        api_key: "sk-test".to_string(),
        base_url: server.uri(),
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    FallbackClassifier::new(Arc::new(provider), "gpt-4o-mini".to_string())
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

fn fallback_request() -> ImageTaskRequest {
    ImageTaskRequest::from_value(test_helpers::request_json(
        "cls-1",
        "a bit brighter please",
        &["u/a.png", "u/b.png"],
    ))
    .unwrap()
}

#[tokio::test]
async fn test_classifier_reply_replaces_fallback_kind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .and(body_string_contains("image_task_decision"))
        .and(body_string_contains("a bit brighter please"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"kind":"style_transfer","instruction":"brighten the photo"}"#,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let request = fallback_request();
    let index = index_request(&request);
    let signals = Signals::extract(&request.prompt, &index).unwrap();
    let fallback = resolve(&request, &index).unwrap();
    assert_eq!(fallback.rule, ResolutionRule::Fallback);

    let refined = classifier(&server)
        .refine(&request, &index, &signals, fallback)
        .await;

    assert_eq!(refined.rule, ResolutionRule::Classifier);
    assert_eq!(refined.kind, Some(OperationKind::StyleTransfer));
    assert_eq!(refined.instruction_text, "brighten the photo");
    assert_eq!(refined.base.as_ref().unwrap().label(), "upload#0");
    assert!(refined
        .references
        .iter()
        .all(|r| r.label() != "upload#0"));
}

#[tokio::test]
async fn test_classifier_clarify_reply_becomes_clarification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"kind":"clarify","reason":"Which photo should be brightened?"}"#,
        )))
        .mount(&server)
        .await;

    let request = fallback_request();
    let index = index_request(&request);
    let signals = Signals::extract(&request.prompt, &index).unwrap();
    let fallback = resolve(&request, &index).unwrap();

    let refined = classifier(&server)
        .refine(&request, &index, &signals, fallback)
        .await;

    assert!(refined.needs_clarification);
    assert_eq!(refined.clarification_reason, "Which photo should be brightened?");
}

#[tokio::test]
async fn test_rejected_request_keeps_deterministic_descriptor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let request = fallback_request();
    let index = index_request(&request);
    let signals = Signals::extract(&request.prompt, &index).unwrap();
    let fallback = resolve(&request, &index).unwrap();

    let refined = classifier(&server)
        .refine(&request, &index, &signals, fallback.clone())
        .await;

    assert_eq!(refined, fallback);
}

#[tokio::test]
async fn test_reply_outside_schema_is_ignored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion(r#"{"kind":"paint"}"#)),
        )
        .mount(&server)
        .await;

    let request = fallback_request();
    let index = index_request(&request);
    let signals = Signals::extract(&request.prompt, &index).unwrap();
    let fallback = resolve(&request, &index).unwrap();

    let refined = classifier(&server)
        .refine(&request, &index, &signals, fallback.clone())
        .await;

    assert_eq!(refined, fallback);
}

#[tokio::test]
async fn test_keyword_rules_never_reach_the_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(r#"{"kind":"generate"}"#)))
        .expect(0)
        .mount(&server)
        .await;

    let request = ImageTaskRequest::from_value(test_helpers::request_json(
        "cls-2",
        "change the background to a beach",
        &["u/a.png"],
    ))
    .unwrap();
    let index = index_request(&request);
    let signals = Signals::extract(&request.prompt, &index).unwrap();
    let descriptor = resolve(&request, &index).unwrap();

    let refined = classifier(&server)
        .refine(&request, &index, &signals, descriptor.clone())
        .await;

    assert_eq!(refined, descriptor);
    assert_eq!(refined.kind, Some(OperationKind::Edit));
}
