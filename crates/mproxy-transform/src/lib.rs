//! Bidirectional translation between the canonical OpenAI chat shape and
//! each provider's native shape, for unary responses and stream chunks.

mod anthropic;
mod datauri;
mod deepseek;
mod error;
mod gemini;
mod openai;
mod registry;

use serde_json::Value as JsonValue;

use mproxy_protocol::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

pub use anthropic::{AnthropicAdapter, canonical_to_message, stop_reason_from_finish};
pub use datauri::parse_data_url;
pub use deepseek::DeepSeekAdapter;
pub use error::AdapterError;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use registry::{Provider, adapter_for};

pub type AdapterResult<T> = Result<T, AdapterError>;

pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_multimodal(&self) -> bool;

    /// Canonical request in, provider-native JSON body out. `target_model`
    /// replaces whatever model the caller named.
    fn adapt_request(
        &self,
        request: ChatCompletionRequest,
        target_model: &str,
    ) -> AdapterResult<JsonValue>;

    /// Provider-native response body in, canonical completion out.
    fn adapt_response(&self, native: JsonValue) -> AdapterResult<ChatCompletionResponse>;

    /// One provider-native stream payload in, canonical chunk out.
    fn adapt_stream_chunk(&self, native: JsonValue) -> AdapterResult<ChatCompletionChunk>;
}

pub(crate) fn epoch_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
