//! The closed provider set and its adapter dispatch.

use crate::Adapter;
use crate::anthropic::AnthropicAdapter;
use crate::deepseek::DeepSeekAdapter;
use crate::gemini::GeminiAdapter;
use crate::openai::OpenAiAdapter;

/// The providers this proxy can talk to. Closed set: adding one means
/// adding an arm to `adapter_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    DeepSeek,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::DeepSeek,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            "gemini" => Some(Provider::Gemini),
            "deepseek" => Some(Provider::DeepSeek),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::DeepSeek => "deepseek",
        }
    }
}

/// Adapter dispatch over the closed set. The adapters are stateless unit
/// structs, so each arm hands out a promoted static reference.
pub fn adapter_for(provider: Provider) -> &'static dyn Adapter {
    match provider {
        Provider::OpenAi => &OpenAiAdapter,
        Provider::Anthropic => &AnthropicAdapter,
        Provider::Gemini => &GeminiAdapter,
        Provider::DeepSeek => &DeepSeekAdapter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_round_trip_through_dispatch() {
        for provider in Provider::ALL {
            assert_eq!(Provider::parse(provider.as_str()), Some(provider));
            let adapter = adapter_for(provider);
            assert_eq!(adapter.name(), provider.as_str());
            assert!(adapter.supports_multimodal());
        }
    }

    #[test]
    fn unknown_names_do_not_parse() {
        assert!(Provider::parse("mistral").is_none());
        assert!(Provider::parse("OpenAI").is_none());
        assert!(Provider::parse("").is_none());
    }
}
