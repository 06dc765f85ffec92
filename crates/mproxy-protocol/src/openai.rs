//! Canonical OpenAI chat-completions wire shape.
//!
//! Every request entering the proxy is parsed into these types, and every
//! response leaving it (other than Anthropic-native passthrough) is
//! serialized from them. Adapters translate between this shape and the
//! provider-native ones.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// `content` accepts both the plain-string form and the part-list form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to plain text, joining text parts with newlines.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// Up to 4 stop sequences are allowed upstream; not enforced here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopConfiguration {
    Single(String),
    Many(Vec<String>),
}

impl StopConfiguration {
    pub fn into_sequences(self) -> Vec<String> {
        match self {
            StopConfiguration::Single(value) => vec![value],
            StopConfiguration::Many(values) => values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model ID as presented by the caller (the route key).
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopConfiguration>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionObject {
    #[serde(rename = "chat.completion")]
    ChatCompletion,
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: i64,
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: CompletionObject,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionResponse {
    /// Text of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|choice| choice.message.content.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl StreamDelta {
    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.content.is_none() && self.reasoning_content.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: i64,
    pub delta: StreamDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: CompletionObject,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionChunk {
    /// A chunk with one choice carrying the given delta.
    pub fn delta(id: impl Into<String>, created: i64, model: impl Into<String>, delta: StreamDelta) -> Self {
        Self {
            id: id.into(),
            object: CompletionObject::ChatCompletionChunk,
            created,
            model: model.into(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// A terminal chunk carrying only a finish reason.
    pub fn finish(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        finish_reason: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            object: CompletionObject::ChatCompletionChunk,
            created,
            model: model.into(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta::default(),
                finish_reason: Some(finish_reason.into()),
            }],
            usage: None,
        }
    }
}

/// `GET /v1/models` list shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    pub owned_by: String,
}

impl ModelList {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        Self {
            object: "list".to_string(),
            data: entries,
        }
    }
}

/// Extract a human-readable message from the error body shapes providers use.
///
/// Checks `error` (string), `error.message`, `error.error`, then `message`.
pub fn extract_error_message(body: &JsonValue) -> Option<String> {
    match body.get("error") {
        Some(JsonValue::String(text)) => return Some(text.clone()),
        Some(JsonValue::Object(map)) => {
            if let Some(text) = map.get("message").and_then(|v| v.as_str()) {
                return Some(text.to_string());
            }
            if let Some(text) = map.get("error").and_then(|v| v.as_str()) {
                return Some(text.to_string());
            }
        }
        _ => {}
    }
    body.get("message")
        .and_then(|v| v.as_str())
        .map(|text| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_accepts_string_and_parts() {
        let plain: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(plain.content, MessageContent::Text("hi".to_string()));

        let parts: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"a"},{"type":"image_url","image_url":{"url":"https://x/y.png"}}]}"#,
        )
        .unwrap();
        match parts.content {
            MessageContent::Parts(ref list) => assert_eq!(list.len(), 2),
            _ => panic!("expected part list"),
        }
    }

    #[test]
    fn error_message_extraction_covers_common_shapes() {
        let shapes = [
            (r#"{"error":"boom"}"#, "boom"),
            (r#"{"error":{"message":"nested"}}"#, "nested"),
            (r#"{"error":{"error":"double"}}"#, "double"),
            (r#"{"message":"flat"}"#, "flat"),
        ];
        for (raw, expected) in shapes {
            let body: JsonValue = serde_json::from_str(raw).unwrap();
            assert_eq!(extract_error_message(&body).as_deref(), Some(expected));
        }
        let none: JsonValue = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(extract_error_message(&none).is_none());
    }

    #[test]
    fn chunk_serializes_without_empty_options() {
        let chunk = ChatCompletionChunk::finish("id-1", 1, "m", "stop");
        let raw = serde_json::to_string(&chunk).unwrap();
        assert!(raw.contains(r#""object":"chat.completion.chunk""#));
        assert!(raw.contains(r#""finish_reason":"stop""#));
        assert!(!raw.contains("usage"));
        assert!(!raw.contains("reasoning_content"));
    }
}
