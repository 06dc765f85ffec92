//! Gemini adapter: canonical chat requests become generateContent bodies.
//! Streaming is selected by URL upstream, so the body never carries a
//! stream flag.

use serde_json::Value as JsonValue;

use mproxy_protocol::gemini::{
    Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData, Part,
    finish_reason_from_gemini,
};
use mproxy_protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Choice, CompletionObject,
    ContentPart, MessageContent, MessageRole, ResponseMessage, StreamDelta, Usage,
};

use crate::datauri::{image_placeholder, parse_data_url};
use crate::{Adapter, AdapterError, AdapterResult, epoch_seconds};

const NAME: &str = "gemini";
const FALLBACK_MODEL: &str = "gemini-pro";

#[derive(Debug, Default)]
pub struct GeminiAdapter;

impl Adapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supports_multimodal(&self) -> bool {
        true
    }

    fn adapt_request(
        &self,
        request: ChatCompletionRequest,
        _target_model: &str,
    ) -> AdapterResult<JsonValue> {
        let contents = request
            .messages
            .iter()
            .filter_map(|message| {
                let role = match message.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                    MessageRole::System => return None,
                };
                Some(Content {
                    role: Some(role.to_string()),
                    parts: convert_content(&message.content),
                })
            })
            .collect();

        let generation_config = GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
        };
        let native = GenerateContentRequest {
            contents,
            generation_config: (!generation_config.is_empty()).then_some(generation_config),
        };
        serde_json::to_value(&native).map_err(|err| AdapterError::decode(NAME, err))
    }

    fn adapt_response(&self, native: JsonValue) -> AdapterResult<ChatCompletionResponse> {
        let response: GenerateContentResponse =
            serde_json::from_value(native).map_err(|err| AdapterError::decode(NAME, err))?;

        let created = epoch_seconds();
        let content = response.first_candidate_text();
        let finish_reason = response
            .candidates
            .first()
            .and_then(|candidate| candidate.finish_reason.as_deref())
            .map(finish_reason_from_gemini)
            .unwrap_or("stop");

        Ok(ChatCompletionResponse {
            id: format!("chatcmpl-gemini-{created}"),
            object: CompletionObject::ChatCompletion,
            created,
            model: response
                .model_version
                .unwrap_or_else(|| FALLBACK_MODEL.to_string()),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content,
                    reasoning_content: None,
                },
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens: response.usage_metadata.prompt_token_count,
                completion_tokens: response.usage_metadata.candidates_token_count,
                total_tokens: response.usage_metadata.total_token_count,
            }),
        })
    }

    fn adapt_stream_chunk(&self, native: JsonValue) -> AdapterResult<ChatCompletionChunk> {
        let response: GenerateContentResponse =
            serde_json::from_value(native).map_err(|err| AdapterError::decode(NAME, err))?;

        let created = epoch_seconds();
        let text = response.first_candidate_text();
        let finish_reason = response
            .candidates
            .first()
            .and_then(|candidate| candidate.finish_reason.as_deref())
            .map(|reason| finish_reason_from_gemini(reason).to_string());

        let mut chunk = ChatCompletionChunk::delta(
            format!("chatcmpl-gemini-{created}"),
            created,
            response
                .model_version
                .unwrap_or_else(|| FALLBACK_MODEL.to_string()),
            StreamDelta {
                role: None,
                content: (!text.is_empty()).then_some(text),
                reasoning_content: None,
            },
        );
        chunk.choices[0].finish_reason = finish_reason;
        Ok(chunk)
    }
}

fn convert_content(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => vec![Part::Text(text.clone())],
        MessageContent::Parts(parts) => parts.iter().map(convert_part).collect(),
    }
}

fn convert_part(part: &ContentPart) -> Part {
    match part {
        ContentPart::Text { text } => Part::Text(text.clone()),
        ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
            Some((mime_type, data)) => Part::InlineData(InlineData { mime_type, data }),
            None => Part::Text(image_placeholder(&image_url.url)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::{ChatMessage, ImageUrl};
    use serde_json::json;

    #[test]
    fn request_maps_roles_and_generation_config() {
        let adapter = GeminiAdapter;
        let request = ChatCompletionRequest {
            model: "gemini-pro".to_string(),
            messages: vec![
                ChatMessage::text(MessageRole::System, "ignored"),
                ChatMessage::text(MessageRole::User, "hello"),
                ChatMessage::text(MessageRole::Assistant, "hi"),
            ],
            max_tokens: Some(128),
            temperature: Some(0.4),
            top_p: Some(0.8),
            stream: Some(true),
            stop: None,
        };
        let native = adapter.adapt_request(request, "gemini-pro").unwrap();

        let contents = native["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[0]["parts"][0]["text"], "hello");

        let config = &native["generationConfig"];
        assert_eq!(config["temperature"], 0.4);
        assert_eq!(config["topP"], 0.8);
        assert_eq!(config["maxOutputTokens"], 128);

        // Streaming is signalled in the URL, never the body.
        assert!(native.get("stream").is_none());
    }

    #[test]
    fn data_urls_become_inline_data_and_plain_urls_placeholders() {
        let adapter = GeminiAdapter;
        let request = ChatCompletionRequest {
            model: "gemini-pro".to_string(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: MessageContent::Parts(vec![
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/webp;base64,UklGR".to_string(),
                            detail: None,
                        },
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "https://example.com/dog.jpg".to_string(),
                            detail: None,
                        },
                    },
                ]),
            }],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: None,
            stop: None,
        };
        let native = adapter.adapt_request(request, "gemini-pro").unwrap();
        let parts = native["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/webp");
        assert_eq!(parts[0]["inlineData"]["data"], "UklGR");
        assert!(
            parts[1]["text"]
                .as_str()
                .unwrap()
                .starts_with("[image: https://example.com/dog.jpg")
        );
        assert!(native.get("generationConfig").is_none());
    }

    #[test]
    fn response_concatenates_parts_and_maps_usage() {
        let adapter = GeminiAdapter;
        let native = json!({
            "candidates": [{
                "content": {"parts": [{"text": "Hel"}, {"text": "lo"}], "role": "model"},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 2, "totalTokenCount": 9}
        });
        let response = adapter.adapt_response(native).unwrap();
        assert_eq!(response.first_content(), Some("Hello"));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(response.model, "gemini-pro");
        assert_eq!(response.usage.unwrap().total_tokens, 9);
        assert!(response.id.starts_with("chatcmpl-gemini-"));
    }

    #[test]
    fn response_echoes_model_version_when_present() {
        let adapter = GeminiAdapter;
        let native = json!({
            "candidates": [{"content": {"parts": [{"text": "x"}]}, "finishReason": "STOP"}],
            "modelVersion": "gemini-1.5-pro-002"
        });
        let response = adapter.adapt_response(native).unwrap();
        assert_eq!(response.model, "gemini-1.5-pro-002");
    }

    #[test]
    fn empty_candidates_still_produce_a_stop_response() {
        let adapter = GeminiAdapter;
        let response = adapter.adapt_response(json!({})).unwrap();
        assert_eq!(response.first_content(), Some(""));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn stream_chunk_carries_delta_and_terminal_reason() {
        let adapter = GeminiAdapter;
        let chunk = adapter
            .adapt_stream_chunk(json!({
                "candidates": [{"content": {"parts": [{"text": "bit"}]}, "finishReason": "STOP"}]
            }))
            .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("bit"));
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));

        let empty = adapter
            .adapt_stream_chunk(json!({"candidates": [{"content": {"parts": []}}]}))
            .unwrap();
        assert!(empty.choices[0].delta.content.is_none());
        assert!(empty.choices[0].finish_reason.is_none());
    }
}
