//! DeepSeek adapter. DeepSeek's reasoner endpoint speaks an
//! Anthropic-flavored dialect on the request side but may answer in either
//! the Anthropic or the OpenAI shape, and its streams interleave
//! `reasoning_content` with `content`.

use serde_json::Value as JsonValue;

use mproxy_protocol::anthropic::{
    ClaudeBlock, ClaudeMessage, ClaudeRole, CreateMessageRequest, ImageSource, MessageResponse,
    finish_reason_from_stop,
};
use mproxy_protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Choice, CompletionObject,
    ContentPart, MessageContent, MessageRole, ResponseMessage, Usage,
};

use crate::datauri::parse_data_url;
use crate::{Adapter, AdapterError, AdapterResult, epoch_seconds};

const NAME: &str = "deepseek";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const FALLBACK_MODEL: &str = "deepseek-chat";

#[derive(Debug, Default)]
pub struct DeepSeekAdapter;

impl Adapter for DeepSeekAdapter {
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
        let mut system_texts = Vec::new();
        let mut messages: Vec<ClaudeMessage> = Vec::new();

        for message in &request.messages {
            match message.role {
                MessageRole::System => system_texts.push(message.content.to_text()),
                MessageRole::User => messages.push(ClaudeMessage {
                    role: ClaudeRole::User,
                    content: convert_content(&message.content),
                }),
                MessageRole::Assistant => messages.push(ClaudeMessage {
                    role: ClaudeRole::Assistant,
                    content: convert_content(&message.content),
                }),
            }
        }

        // The dialect rejects system roles mid-list; fold the system text
        // into the first user message instead.
        if !system_texts.is_empty()
            && let Some(first) = messages.first_mut()
            && first.role == ClaudeRole::User
        {
            let system = system_texts.join("\n");
            match first.content.first_mut() {
                Some(ClaudeBlock::Text { text }) => {
                    *text = format!("{system}\n\n{text}");
                }
                _ => {
                    first.content.insert(0, ClaudeBlock::text(system));
                }
            }
        }

        let native = CreateMessageRequest {
            model: target_model.to_string(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: None,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream,
            stop_sequences: request.stop.map(|stop| stop.into_sequences()),
        };
        serde_json::to_value(&native).map_err(|err| AdapterError::decode(NAME, err))
    }

    fn adapt_response(&self, native: JsonValue) -> AdapterResult<ChatCompletionResponse> {
        if native.get("type").and_then(|v| v.as_str()) == Some("message") {
            return message_to_canonical(native);
        }

        if native.get("choices").is_some() {
            let mut response: ChatCompletionResponse = serde_json::from_value(native)
                .map_err(|err| AdapterError::decode(NAME, err))?;
            if let Some(choice) = response.choices.first_mut()
                && choice.message.content.is_empty()
                && let Some(reasoning) = choice.message.reasoning_content.take()
                && !reasoning.is_empty()
            {
                choice.message.content = reasoning;
            }
            return Ok(response);
        }

        Err(AdapterError::new(NAME, "unrecognized response shape").with_details(native))
    }

    fn adapt_stream_chunk(&self, native: JsonValue) -> AdapterResult<ChatCompletionChunk> {
        let mut chunk: ChatCompletionChunk =
            serde_json::from_value(native).map_err(|err| AdapterError::decode(NAME, err))?;

        // Reasoner streams emit the thinking phase under reasoning_content
        // with a null content; surface it as ordinary content.
        if let Some(choice) = chunk.choices.first_mut()
            && choice.delta.content.is_none()
            && let Some(reasoning) = choice.delta.reasoning_content.take()
        {
            choice.delta.content = Some(reasoning);
        }
        Ok(chunk)
    }
}

fn message_to_canonical(native: JsonValue) -> AdapterResult<ChatCompletionResponse> {
    let response: MessageResponse =
        serde_json::from_value(native).map_err(|err| AdapterError::decode(NAME, err))?;

    let usage = Usage {
        prompt_tokens: response.usage.input_tokens,
        completion_tokens: response.usage.output_tokens,
        total_tokens: response.usage.input_tokens + response.usage.output_tokens,
    };

    let content = response.text();

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

fn convert_content(content: &MessageContent) -> Vec<ClaudeBlock> {
    match content {
        MessageContent::Text(text) => vec![ClaudeBlock::text(text.clone())],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(ClaudeBlock::text(text.clone())),
                ContentPart::ImageUrl { image_url } => {
                    let url = image_url.url.as_str();
                    if url.starts_with("data:") {
                        parse_data_url(url).map(|(media_type, data)| ClaudeBlock::Image {
                            source: ImageSource::Base64 { media_type, data },
                        })
                    } else {
                        Some(ClaudeBlock::Image {
                            source: ImageSource::Url {
                                url: url.to_string(),
                            },
                        })
                    }
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::{ChatMessage, StopConfiguration};
    use serde_json::json;

    #[test]
    fn system_text_folds_into_first_user_message() {
        let adapter = DeepSeekAdapter;
        let request = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![
                ChatMessage::text(MessageRole::System, "answer in haiku"),
                ChatMessage::text(MessageRole::User, "what is rust"),
            ],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: None,
            stop: Some(StopConfiguration::Single("END".to_string())),
        };
        let native = adapter.adapt_request(request, "deepseek-reasoner").unwrap();
        assert_eq!(native["model"], "deepseek-reasoner");
        assert_eq!(native["max_tokens"], 4096);
        let messages = native["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0]["content"][0]["text"],
            "answer in haiku\n\nwhat is rust"
        );
        assert_eq!(native["stop_sequences"][0], "END");
        assert!(native.get("stop").is_none());
    }

    #[test]
    fn system_without_user_leader_is_dropped() {
        let adapter = DeepSeekAdapter;
        let request = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![
                ChatMessage::text(MessageRole::System, "setup"),
                ChatMessage::text(MessageRole::Assistant, "previous answer"),
            ],
            max_tokens: Some(32),
            temperature: None,
            top_p: None,
            stream: None,
            stop: None,
        };
        let native = adapter.adapt_request(request, "deepseek-reasoner").unwrap();
        let messages = native["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "assistant");
    }

    #[test]
    fn anthropic_shaped_response_is_repackaged() {
        let adapter = DeepSeekAdapter;
        let native = json!({
            "id": "msg_ds",
            "type": "message",
            "role": "assistant",
            "model": "deepseek-reasoner",
            "content": [{"type": "text", "text": "four"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 6, "output_tokens": 1}
        });
        let response = adapter.adapt_response(native).unwrap();
        assert_eq!(response.first_content(), Some("four"));
        assert_eq!(response.model, "deepseek-reasoner");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn reasoning_content_is_promoted_when_content_is_empty() {
        let adapter = DeepSeekAdapter;
        let native = json!({
            "id": "chatcmpl-ds",
            "object": "chat.completion",
            "created": 5,
            "model": "deepseek-reasoner",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "", "reasoning_content": "thought"},
                "finish_reason": "stop"
            }]
        });
        let response = adapter.adapt_response(native).unwrap();
        assert_eq!(response.first_content(), Some("thought"));
        assert!(response.choices[0].message.reasoning_content.is_none());
    }

    #[test]
    fn populated_content_is_left_alone() {
        let adapter = DeepSeekAdapter;
        let native = json!({
            "id": "chatcmpl-ds",
            "object": "chat.completion",
            "created": 5,
            "model": "deepseek-reasoner",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "real", "reasoning_content": "thought"},
                "finish_reason": "stop"
            }]
        });
        let response = adapter.adapt_response(native).unwrap();
        assert_eq!(response.first_content(), Some("real"));
        assert_eq!(
            response.choices[0].message.reasoning_content.as_deref(),
            Some("thought")
        );
    }

    #[test]
    fn unknown_shape_is_an_adapter_error() {
        let adapter = DeepSeekAdapter;
        let err = adapter.adapt_response(json!({"weird": true})).unwrap_err();
        assert_eq!(err.adapter, "deepseek");
        assert!(err.details.is_some());
    }

    #[test]
    fn stream_rewrites_reasoning_deltas() {
        let adapter = DeepSeekAdapter;
        let chunk = adapter
            .adapt_stream_chunk(json!({
                "id": "c1",
                "object": "chat.completion.chunk",
                "created": 1,
                "model": "deepseek-reasoner",
                "choices": [{"index": 0, "delta": {"content": null, "reasoning_content": "hmm"}, "finish_reason": null}]
            }))
            .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hmm"));
        assert!(chunk.choices[0].delta.reasoning_content.is_none());

        let passthrough = adapter
            .adapt_stream_chunk(json!({
                "id": "c2",
                "object": "chat.completion.chunk",
                "created": 1,
                "model": "deepseek-reasoner",
                "choices": [{"index": 0, "delta": {"content": "final"}, "finish_reason": null}]
            }))
            .unwrap();
        assert_eq!(passthrough.choices[0].delta.content.as_deref(), Some("final"));
    }
}
