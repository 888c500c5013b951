//! Wire message types for the image-task worker
//!
//! Inbound requests arrive as loosely-typed JSON and are validated into
//! [`ImageTaskRequest`] at the boundary. Outbound messages take one of three
//! shapes (success, clarification, error), all keyed by `requestId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Author of a chat turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Ai,
}

impl Role {
    /// Parse a wire role. Missing roles default to USER.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        let Some(raw) = raw else {
            return Some(Role::User);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "user" => Some(Role::User),
            "ai" | "assistant" => Some(Role::Ai),
            _ => None,
        }
    }
}

/// A single piece of turn content
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        locator: String,
        description: String,
        derived_from_style_transfer: bool,
    },
}

/// One chat turn. Turns are ordered chronologically: index 0 is the oldest.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub contents: Vec<Content>,
}

/// Validated inbound image task
///
/// # Examples
/// ```
/// use imagetask_worker::protocol::ImageTaskRequest;
///
/// let raw = br#"{"requestId":"r1","prompt":"","imagesPath":["u/a.png"],"chat":[]}"#;
/// let request = ImageTaskRequest::from_slice(raw).unwrap();
/// assert_eq!(request.request_id, "r1");
/// assert_eq!(request.uploads, vec!["u/a.png".to_string()]);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageTaskRequest {
    pub request_id: String,
    pub prompt: String,
    /// Upload locators in upload order, trimmed. Empty entries keep their slot.
    pub uploads: Vec<String>,
    pub chat: Vec<Turn>,
    pub chat_summary: String,
    pub style_image_id: Option<String>,
    pub style_image_path: Option<String>,
}

/// Inbound validation failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RequestError {
    /// No usable correlation key; nothing can be reported back to the caller
    #[error("Malformed request: {0}")]
    Malformed(String),
    /// The request is identified but a field is structurally invalid
    #[error("Invalid field '{field}' in request {request_id}: {message}")]
    Invalid {
        request_id: String,
        field: String,
        message: String,
    },
}

impl RequestError {
    /// The request id, when the request got far enough to be identified
    pub fn request_id(&self) -> Option<&str> {
        match self {
            RequestError::Malformed(_) => None,
            RequestError::Invalid { request_id, .. } => Some(request_id),
        }
    }

    fn invalid(request_id: &str, field: impl Into<String>, message: impl Into<String>) -> Self {
        RequestError::Invalid {
            request_id: request_id.to_string(),
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    images_path: Option<Vec<Option<String>>>,
    #[serde(default)]
    chat: Option<Vec<WireTurn>>,
    #[serde(default)]
    chat_summary: Option<String>,
    #[serde(default)]
    style_image_id: Option<String>,
    #[serde(default)]
    style_image_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTurn {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    contents: Option<Vec<WireContent>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContent {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    image_path: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    from_origin_image: Option<Value>,
}

impl ImageTaskRequest {
    /// Parse and validate a raw delivery payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| RequestError::Malformed(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Validate an already-parsed JSON document
    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        let request_id = extract_request_id(&value)?;

        let wire: WireRequest = serde_json::from_value(value)
            .map_err(|e| RequestError::invalid(&request_id, "payload", e.to_string()))?;

        let mut chat = Vec::new();
        for (turn_idx, turn) in wire.chat.unwrap_or_default().into_iter().enumerate() {
            chat.push(validate_turn(&request_id, turn_idx, turn)?);
        }

        let uploads = wire
            .images_path
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.unwrap_or_default().trim().to_string())
            .collect();

        Ok(Self {
            request_id,
            prompt: wire.prompt.unwrap_or_default(),
            uploads,
            chat,
            chat_summary: wire.chat_summary.unwrap_or_default(),
            style_image_id: non_empty(wire.style_image_id),
            style_image_path: non_empty(wire.style_image_path),
        })
    }
}

/// Read `chatSummary` from a raw payload without validating anything else.
///
/// Used on the error path so that a request with a bad field can still be
/// answered with its summary echoed back.
pub fn peek_chat_summary(payload: &[u8]) -> String {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| {
            v.get("chatSummary")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default()
}

fn extract_request_id(value: &Value) -> Result<String, RequestError> {
    let object = value
        .as_object()
        .ok_or_else(|| RequestError::Malformed("payload is not a JSON object".to_string()))?;

    match object.get("requestId") {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        Some(Value::String(_)) => Err(RequestError::Malformed(
            "requestId is empty".to_string(),
        )),
        Some(Value::Null) | None => Err(RequestError::Malformed(
            "requestId is missing".to_string(),
        )),
        Some(_) => Err(RequestError::Malformed(
            "requestId is not a string".to_string(),
        )),
    }
}

fn validate_turn(request_id: &str, turn_idx: usize, turn: WireTurn) -> Result<Turn, RequestError> {
    let role = Role::parse(turn.role.as_deref()).ok_or_else(|| {
        RequestError::invalid(
            request_id,
            format!("chat[{turn_idx}].role"),
            format!("unknown role '{}'", turn.role.as_deref().unwrap_or_default()),
        )
    })?;

    let mut contents = Vec::new();
    for (content_idx, content) in turn.contents.unwrap_or_default().into_iter().enumerate() {
        let position = format!("chat[{turn_idx}].contents[{content_idx}]");
        let kind = content.kind.as_deref().unwrap_or_default().trim().to_ascii_lowercase();
        match kind.as_str() {
            "text" => contents.push(Content::Text {
                text: content.text.unwrap_or_default(),
            }),
            "image" => {
                let derived = parse_strict_bool(content.from_origin_image.as_ref()).map_err(|msg| {
                    RequestError::invalid(request_id, format!("{position}.fromOriginImage"), msg)
                })?;
                contents.push(Content::Image {
                    locator: content.image_path.unwrap_or_default().trim().to_string(),
                    description: content.description.unwrap_or_default().trim().to_string(),
                    derived_from_style_transfer: derived,
                });
            }
            other => {
                return Err(RequestError::invalid(
                    request_id,
                    format!("{position}.type"),
                    format!("unknown content type '{other}'"),
                ))
            }
        }
    }

    Ok(Turn { role, contents })
}

/// Strict boolean: JSON booleans or an unambiguous boolean string.
///
/// Absent and null are `false`. Everything else is rejected rather than guessed.
pub fn parse_strict_bool(value: Option<&Value>) -> Result<bool, String> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" => Ok(false),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        Some(other) => Err(format!("{other} is not a boolean")),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Successful generation result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub request_id: String,
    pub is_success: bool,
    pub is_image_generated: bool,
    pub image_path: String,
    pub full_image_name: String,
    pub image_name: String,
    pub extension: String,
    pub description: String,
    pub chat_summary: String,
    pub from_style_image: bool,
}

/// Request could not be resolved without more input from the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationResponse {
    pub request_id: String,
    pub is_success: bool,
    pub is_image_generated: bool,
    pub text_context: String,
    pub chat_summary: String,
}

/// Terminal failure for a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub request_id: String,
    pub is_success: bool,
    pub chat_summary: String,
    /// Sanitised error detail (no secrets, bounded length)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every message the worker emits on the response topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundResponse {
    Success(SuccessResponse),
    Clarification(ClarificationResponse),
    Error(ErrorResponse),
}

impl OutboundResponse {
    pub fn success(
        request_id: impl Into<String>,
        image: &crate::storage::StoredImage,
        description: impl Into<String>,
        chat_summary: impl Into<String>,
        from_style_image: bool,
    ) -> Self {
        OutboundResponse::Success(SuccessResponse {
            request_id: request_id.into(),
            is_success: true,
            is_image_generated: true,
            image_path: image.locator.clone(),
            full_image_name: image.file_name.clone(),
            image_name: image.image_name.clone(),
            extension: image.extension.clone(),
            description: description.into(),
            chat_summary: chat_summary.into(),
            from_style_image,
        })
    }

    pub fn clarification(
        request_id: impl Into<String>,
        reason: impl Into<String>,
        chat_summary: impl Into<String>,
    ) -> Self {
        OutboundResponse::Clarification(ClarificationResponse {
            request_id: request_id.into(),
            is_success: true,
            is_image_generated: false,
            text_context: reason.into(),
            chat_summary: chat_summary.into(),
        })
    }

    pub fn error(
        request_id: impl Into<String>,
        chat_summary: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        OutboundResponse::Error(ErrorResponse {
            request_id: request_id.into(),
            is_success: false,
            chat_summary: chat_summary.into(),
            error: detail,
        })
    }

    pub fn request_id(&self) -> &str {
        match self {
            OutboundResponse::Success(r) => &r.request_id,
            OutboundResponse::Clarification(r) => &r.request_id,
            OutboundResponse::Error(r) => &r.request_id,
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundResponse::Success(_) => "success",
            OutboundResponse::Clarification(_) => "clarification",
            OutboundResponse::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<ImageTaskRequest, RequestError> {
        ImageTaskRequest::from_value(value)
    }

    #[test]
    fn test_minimal_request_defaults() {
        let request = parse(json!({"requestId": "r1"})).unwrap();

        assert_eq!(request.request_id, "r1");
        assert_eq!(request.prompt, "");
        assert!(request.uploads.is_empty());
        assert!(request.chat.is_empty());
        assert_eq!(request.chat_summary, "");
        assert!(request.style_image_path.is_none());
    }

    #[test]
    fn test_missing_request_id_is_malformed() {
        for payload in [
            json!({}),
            json!({"requestId": null}),
            json!({"requestId": "   "}),
            json!({"requestId": 42}),
            json!(["r1"]),
        ] {
            let err = parse(payload).unwrap_err();
            assert!(matches!(err, RequestError::Malformed(_)), "got {err:?}");
            assert!(err.request_id().is_none());
        }
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = ImageTaskRequest::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, RequestError::Malformed(_)));
    }

    #[test]
    fn test_full_request_parses() {
        let request = parse(json!({
            "requestId": "r2",
            "prompt": "make it blue",
            "imagesPath": [" u/a.png ", "", "u/b.png"],
            "chatSummary": "talked about cats",
            "styleImageId": "",
            "styleImagePath": "styles/monet.png",
            "chat": [
                {"role": "USER", "contents": [
                    {"type": "TEXT", "text": "draw a cat"}
                ]},
                {"role": "ai", "contents": [
                    {"type": "image", "imagePath": "gen/cat.png", "description": "a cat", "fromOriginImage": "no"}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(request.uploads, vec!["u/a.png", "", "u/b.png"]);
        assert_eq!(request.style_image_id, None);
        assert_eq!(request.style_image_path.as_deref(), Some("styles/monet.png"));
        assert_eq!(request.chat.len(), 2);
        assert_eq!(request.chat[1].role, Role::Ai);
        assert_eq!(
            request.chat[1].contents[0],
            Content::Image {
                locator: "gen/cat.png".to_string(),
                description: "a cat".to_string(),
                derived_from_style_transfer: false,
            }
        );
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::parse(None), Some(Role::User));
        assert_eq!(Role::parse(Some("User")), Some(Role::User));
        assert_eq!(Role::parse(Some("AI")), Some(Role::Ai));
        assert_eq!(Role::parse(Some("assistant")), Some(Role::Ai));
        assert_eq!(Role::parse(Some("system")), None);
    }

    #[test]
    fn test_unknown_role_is_validation_error() {
        let err = parse(json!({"requestId": "r3", "chat": [{"role": "robot", "contents": []}]}))
            .unwrap_err();
        match err {
            RequestError::Invalid { request_id, field, .. } => {
                assert_eq!(request_id, "r3");
                assert_eq!(field, "chat[0].role");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_strict_bool_accepts_known_forms() {
        assert_eq!(parse_strict_bool(None), Ok(false));
        assert_eq!(parse_strict_bool(Some(&Value::Null)), Ok(false));
        assert_eq!(parse_strict_bool(Some(&json!(true))), Ok(true));
        assert_eq!(parse_strict_bool(Some(&json!(" YES "))), Ok(true));
        assert_eq!(parse_strict_bool(Some(&json!("0"))), Ok(false));
        assert_eq!(parse_strict_bool(Some(&json!("n"))), Ok(false));
    }

    #[test]
    fn test_strict_bool_rejects_everything_else() {
        assert!(parse_strict_bool(Some(&json!(1))).is_err());
        assert!(parse_strict_bool(Some(&json!("maybe"))).is_err());
        assert!(parse_strict_bool(Some(&json!({"v": true}))).is_err());
    }

    #[test]
    fn test_malformed_bool_names_position() {
        let err = parse(json!({
            "requestId": "r4",
            "chat": [
                {"role": "USER", "contents": [{"type": "TEXT", "text": "hi"}]},
                {"role": "AI", "contents": [
                    {"type": "TEXT", "text": "here"},
                    {"type": "IMAGE", "imagePath": "x.png", "fromOriginImage": "sometimes"}
                ]}
            ]
        }))
        .unwrap_err();

        match err {
            RequestError::Invalid { field, .. } => {
                assert_eq!(field, "chat[1].contents[1].fromOriginImage")
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_field_type_is_validation_error() {
        let err = parse(json!({"requestId": "r5", "imagesPath": "u/a.png"})).unwrap_err();
        assert_eq!(err.request_id(), Some("r5"));
    }

    #[test]
    fn test_peek_chat_summary() {
        assert_eq!(
            peek_chat_summary(br#"{"requestId":"x","chatSummary":"so far"}"#),
            "so far"
        );
        assert_eq!(peek_chat_summary(b"garbage"), "");
    }

    #[test]
    fn test_success_response_wire_format() {
        let image = crate::storage::StoredImage {
            locator: "generated/abc.png".to_string(),
            file_name: "abc.png".to_string(),
            image_name: "abc".to_string(),
            extension: "PNG".to_string(),
        };
        let response = OutboundResponse::success("r1", &image, "a blue cat", "summary", true);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["isSuccess"], true);
        assert_eq!(json["isImageGenerated"], true);
        assert_eq!(json["imagePath"], "generated/abc.png");
        assert_eq!(json["fullImageName"], "abc.png");
        assert_eq!(json["imageName"], "abc");
        assert_eq!(json["extension"], "PNG");
        assert_eq!(json["fromStyleImage"], true);
    }

    #[test]
    fn test_clarification_wire_format() {
        let response = OutboundResponse::clarification("r2", "which image?", "s");
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["isSuccess"], true);
        assert_eq!(json["isImageGenerated"], false);
        assert_eq!(json["textContext"], "which image?");
        assert!(json.get("imagePath").is_none());
    }

    #[test]
    fn test_error_wire_format_omits_empty_detail() {
        let response = OutboundResponse::error("r3", "s", None);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["isSuccess"], false);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_outbound_shapes_are_distinguished_on_read() {
        let clarify = serde_json::to_string(&OutboundResponse::clarification("a", "b", "c")).unwrap();
        let error = serde_json::to_string(&OutboundResponse::error("a", "c", Some("boom".into()))).unwrap();

        assert_eq!(
            serde_json::from_str::<OutboundResponse>(&clarify).unwrap().kind(),
            "clarification"
        );
        assert_eq!(
            serde_json::from_str::<OutboundResponse>(&error).unwrap().kind(),
            "error"
        );
    }
}
