//! OpenAI adapter: the canonical shape is already the native one, so the
//! request only gets its model overridden and responses pass straight
//! through (re-validated against the canonical types).

use serde_json::Value as JsonValue;

use mproxy_protocol::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

use crate::{Adapter, AdapterError, AdapterResult};

const NAME: &str = "openai";

#[derive(Debug, Default)]
pub struct OpenAiAdapter;

impl Adapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supports_multimodal(&self) -> bool {
        true
    }

    fn adapt_request(
        &self,
        mut request: ChatCompletionRequest,
        target_model: &str,
    ) -> AdapterResult<JsonValue> {
        request.model = target_model.to_string();
        serde_json::to_value(&request).map_err(|err| AdapterError::decode(NAME, err))
    }

    fn adapt_response(&self, native: JsonValue) -> AdapterResult<ChatCompletionResponse> {
        serde_json::from_value(native).map_err(|err| AdapterError::decode(NAME, err))
    }

    fn adapt_stream_chunk(&self, native: JsonValue) -> AdapterResult<ChatCompletionChunk> {
        serde_json::from_value(native).map_err(|err| AdapterError::decode(NAME, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::{ChatMessage, MessageRole};

    #[test]
    fn request_is_identity_modulo_model() {
        let adapter = OpenAiAdapter;
        let request = ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage::text(MessageRole::User, "hi")],
            max_tokens: Some(64),
            temperature: Some(0.3),
            top_p: None,
            stream: None,
            stop: None,
        };
        let native = adapter.adapt_request(request.clone(), "gpt-4-turbo").unwrap();
        assert_eq!(native["model"], "gpt-4-turbo");
        assert_eq!(native["messages"][0]["content"], "hi");
        assert_eq!(native["max_tokens"], 64);

        // Round trip: everything but the overridden model survives.
        let reparsed: ChatCompletionRequest = serde_json::from_value(native).unwrap();
        assert_eq!(reparsed.messages, request.messages);
        assert_eq!(reparsed.max_tokens, request.max_tokens);
        assert_eq!(reparsed.temperature, request.temperature);
    }

    #[test]
    fn response_passes_through() {
        let adapter = OpenAiAdapter;
        let native = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hey"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        });
        let response = adapter.adapt_response(native).unwrap();
        assert_eq!(response.first_content(), Some("hey"));
        assert_eq!(response.usage.unwrap().total_tokens, 3);
    }

    #[test]
    fn malformed_response_is_an_adapter_error() {
        let adapter = OpenAiAdapter;
        let err = adapter
            .adapt_response(serde_json::json!({"choices": "nope"}))
            .unwrap_err();
        assert_eq!(err.adapter, "openai");
    }
}
