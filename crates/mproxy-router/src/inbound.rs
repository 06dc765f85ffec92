//! Anthropic-style inbound request parsing for `/v1/messages`.
//!
//! The body is converted to the canonical chat shape before it enters the
//! engine; system prompts become a leading system message, content blocks
//! become canonical parts.

use serde::Deserialize;

use mproxy_protocol::openai::{
    ChatCompletionRequest, ChatMessage, ContentPart, ImageUrl, MessageContent, MessageRole,
    StopConfiguration,
};

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicInbound {
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub system: Option<InboundSystem>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    pub content: InboundContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Blocks(Vec<InboundBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundBlock {
    Text {
        text: String,
    },
    Image {
        source: InboundImageSource,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundSystem {
    Text(String),
    Blocks(Vec<InboundBlock>),
}

impl AnthropicInbound {
    pub fn into_canonical(self) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);

        if let Some(system) = self.system {
            let text = match system {
                InboundSystem::Text(text) => text,
                InboundSystem::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|block| match block {
                        InboundBlock::Text { text } => Some(text.as_str()),
                        InboundBlock::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            if !text.is_empty() {
                messages.push(ChatMessage::text(MessageRole::System, text));
            }
        }

        for message in self.messages {
            let role = match message.role.as_str() {
                "assistant" => MessageRole::Assistant,
                "system" => MessageRole::System,
                _ => MessageRole::User,
            };
            messages.push(ChatMessage {
                role,
                content: convert_content(message.content),
            });
        }

        ChatCompletionRequest {
            model: self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            stream: self.stream,
            stop: self.stop_sequences.map(StopConfiguration::Many),
        }
    }
}

fn convert_content(content: InboundContent) -> MessageContent {
    match content {
        InboundContent::Text(text) => MessageContent::Text(text),
        InboundContent::Blocks(blocks) => MessageContent::Parts(
            blocks
                .into_iter()
                .map(|block| match block {
                    InboundBlock::Text { text } => ContentPart::Text { text },
                    InboundBlock::Image { source } => {
                        let url = match source {
                            InboundImageSource::Base64 { media_type, data } => {
                                format!("data:{media_type};base64,{data}")
                            }
                            InboundImageSource::Url { url } => url,
                        };
                        ContentPart::ImageUrl {
                            image_url: ImageUrl { url, detail: None },
                        }
                    }
                })
                .collect(),
        ),
    }
}
