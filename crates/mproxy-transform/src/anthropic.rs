//! Anthropic adapter: canonical chat requests become messages-API bodies,
//! messages-API responses and stream events become canonical completions.

use serde_json::Value as JsonValue;

use mproxy_protocol::anthropic::{
    ClaudeBlock, ClaudeMessage, ClaudeRole, CreateMessageRequest, ImageSource, MessageResponse,
    StreamEvent, finish_reason_from_stop,
};
use mproxy_protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Choice, CompletionObject,
    ContentPart, MessageContent, MessageRole, ResponseMessage, StreamDelta, Usage,
};

use crate::datauri::{image_placeholder, parse_data_url};
use crate::{Adapter, AdapterError, AdapterResult, epoch_seconds};

const NAME: &str = "anthropic";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const STREAM_ID: &str = "chatcmpl-anthropic";
const FALLBACK_MODEL: &str = "claude-3-sonnet-20240229";

#[derive(Debug, Default)]
pub struct AnthropicAdapter;

impl Adapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supports_multimodal(&self) -> bool {
        true
    }

    fn adapt_request(
        &self,
        request: ChatCompletionRequest,
        target_model: &str,
    ) -> AdapterResult<JsonValue> {
        let messages = request
            .messages
            .iter()
            .filter_map(|message| {
                let role = match message.role {
                    MessageRole::System => return None,
                    MessageRole::User => ClaudeRole::User,
                    MessageRole::Assistant => ClaudeRole::Assistant,
                };
                Some(ClaudeMessage {
                    role,
                    content: convert_content(&message.content),
                })
            })
            .collect();

        let native = CreateMessageRequest {
            model: target_model.to_string(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: None,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream,
            stop_sequences: None,
        };
        serde_json::to_value(&native).map_err(|err| AdapterError::decode(NAME, err))
    }

    fn adapt_response(&self, native: JsonValue) -> AdapterResult<ChatCompletionResponse> {
        let response: MessageResponse =
            serde_json::from_value(native).map_err(|err| AdapterError::decode(NAME, err))?;

        let content = response
            .content
            .first()
            .and_then(|block| match block {
                ClaudeBlock::Text { text } => Some(text.clone()),
                ClaudeBlock::Image { .. } => None,
            })
            .unwrap_or_default();

        let usage = Usage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        };

        Ok(ChatCompletionResponse {
            id: response.id,
            object: CompletionObject::ChatCompletion,
            created: epoch_seconds(),
            model: response.model.unwrap_or_else(|| FALLBACK_MODEL.to_string()),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content,
                    reasoning_content: None,
                },
                finish_reason: Some(
                    finish_reason_from_stop(response.stop_reason.as_deref()).to_string(),
                ),
            }],
            usage: Some(usage),
        })
    }

    fn adapt_stream_chunk(&self, native: JsonValue) -> AdapterResult<ChatCompletionChunk> {
        let event: StreamEvent =
            serde_json::from_value(native).map_err(|err| AdapterError::decode(NAME, err))?;
        let created = epoch_seconds();

        let chunk = match event {
            StreamEvent::ContentBlockDelta { delta, .. } => ChatCompletionChunk::delta(
                STREAM_ID,
                created,
                FALLBACK_MODEL,
                StreamDelta {
                    role: None,
                    content: Some(delta.text),
                    reasoning_content: None,
                },
            ),
            StreamEvent::MessageStop => {
                ChatCompletionChunk::finish(STREAM_ID, created, FALLBACK_MODEL, "stop")
            }
            _ => ChatCompletionChunk::delta(
                STREAM_ID,
                created,
                FALLBACK_MODEL,
                StreamDelta::default(),
            ),
        };
        Ok(chunk)
    }
}

/// Map a canonical finish reason back onto a messages-API stop reason.
pub fn stop_reason_from_finish(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("stop") => "end_turn",
        Some("length") => "max_tokens",
        Some("content_filter") => "stop_sequence",
        Some("function_call") | Some("tool_calls") => "end_turn",
        _ => "end_turn",
    }
}

/// Render a canonical completion as an Anthropic message envelope. Used by
/// the `/v1/messages` surface when the resolved upstream was not
/// Anthropic and there is no native body to pass through.
pub fn canonical_to_message(response: &ChatCompletionResponse) -> JsonValue {
    let content = response.first_content().unwrap_or_default();
    let finish_reason = response
        .choices
        .first()
        .and_then(|choice| choice.finish_reason.as_deref());
    let usage = response.usage.unwrap_or_default();
    serde_json::json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": [{"type": "text", "text": content}],
        "stop_reason": stop_reason_from_finish(finish_reason),
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
        },
    })
}

fn convert_content(content: &MessageContent) -> Vec<ClaudeBlock> {
    match content {
        MessageContent::Text(text) => vec![ClaudeBlock::text(text.clone())],
        MessageContent::Parts(parts) => parts.iter().map(convert_part).collect(),
    }
}

fn convert_part(part: &ContentPart) -> ClaudeBlock {
    match part {
        ContentPart::Text { text } => ClaudeBlock::text(text.clone()),
        ContentPart::ImageUrl { image_url } => {
            let url = image_url.url.as_str();
            if url.starts_with("data:") {
                match parse_data_url(url) {
                    Some((media_type, data)) => ClaudeBlock::Image {
                        source: ImageSource::Base64 { media_type, data },
                    },
                    None => ClaudeBlock::text(image_placeholder(url)),
                }
            } else {
                ClaudeBlock::Image {
                    source: ImageSource::Url {
                        url: url.to_string(),
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::{ChatMessage, ImageUrl};
    use serde_json::json;

    fn request_with(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-3-sonnet".to_string(),
            messages,
            max_tokens: None,
            temperature: Some(0.7),
            top_p: None,
            stream: Some(true),
            stop: None,
        }
    }

    #[test]
    fn system_messages_are_dropped_and_max_tokens_defaulted() {
        let adapter = AnthropicAdapter;
        let request = request_with(vec![
            ChatMessage::text(MessageRole::System, "be terse"),
            ChatMessage::text(MessageRole::User, "hi"),
        ]);
        let native = adapter
            .adapt_request(request, "claude-3-sonnet-20240229")
            .unwrap();
        assert_eq!(native["max_tokens"], 4096);
        assert_eq!(native["messages"].as_array().unwrap().len(), 1);
        assert_eq!(native["messages"][0]["role"], "user");
        assert_eq!(native["messages"][0]["content"][0]["text"], "hi");
        assert!(native.get("system").is_none());
    }

    #[test]
    fn data_url_images_become_base64_blocks() {
        let adapter = AnthropicAdapter;
        let request = request_with(vec![ChatMessage {
            role: MessageRole::User,
            content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".to_string(),
                    detail: None,
                },
            }]),
        }]);
        let native = adapter.adapt_request(request, "claude-3-opus").unwrap();
        let block = &native["messages"][0]["content"][0];
        assert_eq!(block["type"], "image");
        assert_eq!(block["source"]["type"], "base64");
        assert_eq!(block["source"]["media_type"], "image/png");
        assert_eq!(block["source"]["data"], "AAAA");
    }

    #[test]
    fn bad_data_url_falls_back_to_placeholder() {
        let adapter = AnthropicAdapter;
        let url = format!("data:image/png;weird,{}", "A".repeat(80));
        let request = request_with(vec![ChatMessage {
            role: MessageRole::User,
            content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: url.clone(),
                    detail: None,
                },
            }]),
        }]);
        let native = adapter.adapt_request(request, "claude-3-opus").unwrap();
        let block = &native["messages"][0]["content"][0];
        assert_eq!(block["type"], "text");
        let text = block["text"].as_str().unwrap();
        assert!(text.starts_with("[image: "));
        // Only the first 50 URL characters survive.
        assert!(text.contains(&url[..50]));
        assert!(!text.contains(&url[..60]));
    }

    #[test]
    fn plain_urls_become_url_blocks() {
        let adapter = AnthropicAdapter;
        let request = request_with(vec![ChatMessage {
            role: MessageRole::User,
            content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/cat.png".to_string(),
                    detail: None,
                },
            }]),
        }]);
        let native = adapter.adapt_request(request, "claude-3-opus").unwrap();
        let block = &native["messages"][0]["content"][0];
        assert_eq!(block["source"]["type"], "url");
        assert_eq!(block["source"]["url"], "https://example.com/cat.png");
    }

    #[test]
    fn response_maps_stop_reason_and_usage() {
        let adapter = AnthropicAdapter;
        let native = json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-sonnet-20240229",
            "content": [{"type": "text", "text": "pong"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        });
        let response = adapter.adapt_response(native).unwrap();
        assert_eq!(response.first_content(), Some("pong"));
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("length")
        );
        let usage = response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 4);
        assert_eq!(usage.total_tokens, 14);
    }

    #[test]
    fn canonical_renders_as_message_envelope() {
        let response = ChatCompletionResponse {
            id: "chatcmpl-9".to_string(),
            object: CompletionObject::ChatCompletion,
            created: 7,
            model: "deepseek-reasoner".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: "done".to_string(),
                    reasoning_content: None,
                },
                finish_reason: Some("length".to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 9,
                total_tokens: 12,
            }),
        };
        let message = canonical_to_message(&response);
        assert_eq!(message["type"], "message");
        assert_eq!(message["content"][0]["text"], "done");
        assert_eq!(message["stop_reason"], "max_tokens");
        assert_eq!(message["usage"]["input_tokens"], 3);
        assert_eq!(message["usage"]["output_tokens"], 9);

        assert_eq!(stop_reason_from_finish(Some("stop")), "end_turn");
        assert_eq!(stop_reason_from_finish(Some("content_filter")), "stop_sequence");
        assert_eq!(stop_reason_from_finish(None), "end_turn");
    }

    #[test]
    fn stream_events_map_to_chunks() {
        let adapter = AnthropicAdapter;

        let delta = adapter
            .adapt_stream_chunk(json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": "to"}
            }))
            .unwrap();
        assert_eq!(delta.choices[0].delta.content.as_deref(), Some("to"));
        assert!(delta.choices[0].finish_reason.is_none());

        let stop = adapter
            .adapt_stream_chunk(json!({"type": "message_stop"}))
            .unwrap();
        assert_eq!(stop.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(stop.choices[0].delta.is_empty());

        let ping = adapter.adapt_stream_chunk(json!({"type": "ping"})).unwrap();
        assert!(ping.choices[0].delta.is_empty());
        assert!(ping.choices[0].finish_reason.is_none());
    }
}
