//! Resolution tests driven from wire-format JSON

use imagetask_worker::executor::{execute, ImageExecutor};
use imagetask_worker::protocol::{ImageTaskRequest, OutboundResponse};
use imagetask_worker::resolution::{
    index_request, resolve, OperationDescriptor, OperationKind, ResolutionRule, Signals,
    SourceKind,
};
use imagetask_worker::storage::ImageStore;
use imagetask_worker::testing::mocks::{MockExecutor, MockImageStore};
use proptest::prelude::*;
use serde_json::{json, Value};


fn resolve_json(value: Value) -> OperationDescriptor {
    let request = ImageTaskRequest::from_value(value).unwrap();
    let index = index_request(&request);
    resolve(&request, &index).unwrap()
}

fn chat_user_then_ai() -> Value {
    json!([
        {"role": "USER", "contents": [
            {"type": "text", "text": "here is my photo"},
            {"type": "image", "imagePath": "c/user.png"}
        ]},
        {"role": "AI", "contents": [
            {"type": "image", "imagePath": "c/ai.png", "description": "a cat in a hat", "fromOriginImage": "false"}
        ]}
    ])
}

#[test]
fn test_uploads_only_request_resolves_to_style_transfer() {
    let descriptor = resolve_json(json!({
        "requestId": "r1",
        "prompt": "",
        "imagesPath": ["u/a.png"],
        "chat": []
    }));

    assert_eq!(descriptor.kind, Some(OperationKind::StyleTransfer));
    assert!(descriptor.apply_style_transfer);
    assert!(!descriptor.needs_clarification);
    let base = descriptor.base.expect("base image");
    assert_eq!(base.source_kind, SourceKind::Upload);
    assert_eq!(base.index, 0);
    assert_eq!(base.locator, "u/a.png");
}

#[test]
fn test_uploads_only_wins_over_style_only() {
    let descriptor = resolve_json(test_helpers::request_json("r2", "   ", &["u/only.png"]));

    assert_eq!(descriptor.rule, ResolutionRule::UploadsOnly);
    assert_eq!(descriptor.kind, Some(OperationKind::StyleTransfer));
    assert_eq!(descriptor.base.unwrap().locator, "u/only.png");
}

#[test]
fn test_default_base_prefers_latest_user_image() {
    let descriptor = resolve_json(json!({
        "requestId": "r3",
        "prompt": "make it watercolor",
        "chat": chat_user_then_ai()
    }));

    assert_eq!(descriptor.kind, Some(OperationKind::StyleTransfer));
    let base = descriptor.base.unwrap();
    assert_eq!(base.label(), "chat#0");
    assert_eq!(base.locator, "c/user.png");
}

#[test]
fn test_default_base_follows_named_ai_result() {
    let descriptor = resolve_json(json!({
        "requestId": "r4",
        "prompt": "make the one you just made anime style",
        "chat": chat_user_then_ai()
    }));

    let base = descriptor.base.unwrap();
    assert_eq!(base.label(), "chat#1");
    assert_eq!(base.locator, "c/ai.png");
}

#[test]
fn test_insertion_phrase_without_named_result_edits_the_upload() {
    let descriptor = resolve_json(json!({
        "requestId": "r4b",
        "prompt": "add a hat on the dog",
        "imagesPath": ["u/a.png"],
        "chat": chat_user_then_ai()
    }));

    assert_eq!(descriptor.kind, Some(OperationKind::Edit));
    let base = descriptor.base.unwrap();
    assert_eq!(base.label(), "upload#0");
    assert_eq!(base.locator, "u/a.png");
    assert!(descriptor.references.is_empty());
}

#[test]
fn test_edit_without_any_image_asks_for_one() {
    let descriptor = resolve_json(json!({
        "requestId": "r5",
        "prompt": "edit the background",
        "imagesPath": [],
        "chat": []
    }));

    assert!(descriptor.needs_clarification);
    assert!(!descriptor.is_executable());
    assert!(!descriptor.clarification_reason.is_empty());
}

#[test]
fn test_invalid_origin_flag_is_a_validation_error() {
    let result = ImageTaskRequest::from_value(json!({
        "requestId": "r6",
        "chat": [{"role": "AI", "contents": [
            {"type": "image", "imagePath": "c/ai.png", "fromOriginImage": "maybe"}
        ]}]
    }));

    let err = result.unwrap_err();
    assert_eq!(err.request_id(), Some("r6"));
    assert!(err.to_string().contains("fromOriginImage"));
}

#[test]
fn test_empty_locators_are_not_indexed() {
    let request = ImageTaskRequest::from_value(json!({
        "requestId": "r7",
        "imagesPath": ["", "u/b.png"],
        "chat": [{"role": "USER", "contents": [
            {"type": "image", "imagePath": ""},
            {"type": "image", "imagePath": "c/0.png"}
        ]}]
    }))
    .unwrap();

    let index = index_request(&request);
    assert_eq!(index.chat().len(), 1);
    assert_eq!(index.chat()[0].index, 0);
    assert_eq!(index.uploads().len(), 1);
    assert_eq!(index.uploads()[0].label(), "upload#1");
}

#[tokio::test]
async fn test_success_response_round_trip_preserves_result() {
    let request = ImageTaskRequest::from_value(json!({
        "requestId": "round-trip",
        "prompt": "",
        "imagesPath": ["u/a.png"],
        "chatSummary": "user wants a styled portrait",
        "styleImagePath": "s/style.png"
    }))
    .unwrap();
    let descriptor = resolve(&request, &index_request(&request)).unwrap();

    let store = MockImageStore::new()
        .with_image("u/a.png", b"content")
        .with_image("s/style.png", b"style");
    let executor = MockExecutor::new().with_style_transfer();
    let result = execute(
        &descriptor,
        &request,
        &store as &dyn ImageStore,
        &executor as &dyn ImageExecutor,
    )
    .await
    .unwrap();
    assert!(result.from_style_image);

    let outbound = OutboundResponse::success(
        &request.request_id,
        &result.stored,
        &descriptor.result_description,
        &request.chat_summary,
        result.from_style_image,
    );
    let wire = serde_json::to_vec(&outbound).unwrap();
    let value: Value = serde_json::from_slice(&wire).unwrap();
    assert_eq!(value["isSuccess"], json!(true));
    assert_eq!(value["isImageGenerated"], json!(true));

    match serde_json::from_slice::<OutboundResponse>(&wire).unwrap() {
        OutboundResponse::Success(success) => {
            assert_eq!(success.request_id, "round-trip");
            assert_eq!(success.image_path, result.stored.locator);
            assert!(success.from_style_image);
            assert_eq!(success.chat_summary, "user wants a styled portrait");
        }
        other => panic!("Expected a success response, got {other:?}"),
    }
}

const WORDS: &[&str] = &[
    "make", "it", "a", "the", "cat", "dog", "background", "red", "blue", "watercolor", "anime",
    "style", "replace", "remove", "add", "draw", "picture", "of", "with", "into", "first",
    "second", "image", "one", "you", "just", "made", "brighter", "please", "sunset", "beach",
];

fn prompt_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(WORDS), 0..8).prop_map(|words| words.join(" "))
}

fn chat_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..4)
}

proptest! {
    #[test]
    fn base_is_never_a_reference(
        prompt in prompt_strategy(),
        uploads in 0usize..3,
        chat_roles in chat_strategy(),
    ) {
        let upload_paths: Vec<String> = (0..uploads).map(|i| format!("u/{i}.png")).collect();
        let chat: Vec<Value> = chat_roles
            .iter()
            .enumerate()
            .map(|(i, is_ai)| json!({
                "role": if *is_ai { "AI" } else { "USER" },
                "contents": [{"type": "image", "imagePath": format!("c/{i}.png")}]
            }))
            .collect();
        let request = ImageTaskRequest::from_value(json!({
            "requestId": "prop",
            "prompt": prompt,
            "imagesPath": upload_paths,
            "chat": chat,
        }))
        .unwrap();
        let index = index_request(&request);
        let names_nothing = Signals::extract(&request.prompt, &index)
            .map(|signals| signals.named.is_empty())
            .unwrap_or(false);

        if let Ok(descriptor) = resolve(&request, &index) {
            if let Some(base) = &descriptor.base {
                prop_assert!(descriptor.references.iter().all(|r| r.key() != base.key()));
                if uploads > 0 && names_nothing {
                    prop_assert_eq!(base.label(), "upload#0");
                }
            }
            if descriptor.kind == Some(OperationKind::Generate) {
                prop_assert!(descriptor.base.is_none());
                prop_assert!(descriptor.references.is_empty());
            }
            if descriptor.needs_clarification {
                prop_assert!(!descriptor.is_executable());
            }
            if index.is_empty() && descriptor.is_executable() {
                prop_assert_eq!(descriptor.kind, Some(OperationKind::Generate));
            }
        }
    }
}
