//! The provider HTTP client: endpoint table, auth header construction,
//! unary calls, and SSE stream consumption.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use mproxy_pool::ApiKey;
use mproxy_protocol::openai::extract_error_message;
use mproxy_protocol::sse::{SseFrame, SseParser};

use crate::error::{ProxyError, ProxyResult};
use crate::resolver::ModelConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Static endpoint knowledge per provider: where to call and how to
/// authenticate when the key row doesn't override it.
struct ProviderEndpoint {
    name: &'static str,
    default_base: &'static str,
    auth_header: &'static str,
    auth_format: &'static str,
}

const ENDPOINTS: &[ProviderEndpoint] = &[
    ProviderEndpoint {
        name: "openai",
        default_base: "https://api.openai.com",
        auth_header: "Authorization",
        auth_format: "Bearer {key}",
    },
    ProviderEndpoint {
        name: "anthropic",
        default_base: "https://api.anthropic.com",
        auth_header: "x-api-key",
        auth_format: "{key}",
    },
    ProviderEndpoint {
        name: "gemini",
        default_base: "https://generativelanguage.googleapis.com",
        auth_header: "",
        auth_format: "",
    },
    ProviderEndpoint {
        name: "deepseek",
        default_base: "https://api.deepseek.com",
        auth_header: "Authorization",
        auth_format: "Bearer {key}",
    },
];

fn endpoint_for(provider: &str) -> ProxyResult<&'static ProviderEndpoint> {
    ENDPOINTS
        .iter()
        .find(|endpoint| endpoint.name == provider)
        .ok_or_else(|| ProxyError::Configuration(format!("unknown provider: {provider}")))
}

fn chat_path(provider: &str, target_model: &str, stream: bool) -> String {
    match provider {
        "anthropic" => "v1/messages".to_string(),
        "gemini" => {
            let method = if stream {
                "streamGenerateContent?alt=sse"
            } else {
                "generateContent"
            };
            format!("v1beta/models/{target_model}:{method}")
        }
        "deepseek" => "chat/completions".to_string(),
        _ => "v1/chat/completions".to_string(),
    }
}

/// A fully resolved upstream call: URL plus headers, with the credential
/// already folded in.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub provider: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl UpstreamTarget {
    /// Build the concrete target from the routing row and the selected
    /// key. Key-level auth overrides beat the model row's, which beat the
    /// provider defaults.
    pub fn build(
        model: &ModelConfig,
        key: &ApiKey,
        stream: bool,
    ) -> ProxyResult<Self> {
        let endpoint = endpoint_for(&model.provider)?;
        let base = model
            .api_base
            .as_deref()
            .unwrap_or(endpoint.default_base)
            .trim_end_matches('/');
        let path = chat_path(&model.provider, &model.target_model, stream);
        let mut url = format!("{base}/{path}");

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];

        if model.provider == "gemini" {
            // Gemini authenticates via the query string, not a header.
            let separator = if url.contains('?') { '&' } else { '?' };
            url = format!("{url}{separator}key={}", key.secret);
        } else {
            let header_name = model
                .auth_header
                .as_deref()
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| pick_auth_header(key, endpoint));
            let format = model
                .auth_format
                .as_deref()
                .filter(|fmt| !fmt.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| pick_auth_format(key, endpoint));
            headers.push((header_name, format.replace("{key}", &key.secret)));
        }

        if model.provider == "anthropic" {
            headers.push((
                "anthropic-version".to_string(),
                ANTHROPIC_VERSION.to_string(),
            ));
        }

        Ok(Self {
            provider: model.provider.clone(),
            url,
            headers,
        })
    }
}

fn pick_auth_header(key: &ApiKey, endpoint: &ProviderEndpoint) -> String {
    // A key row still carrying the generic default defers to the
    // provider's own convention (anthropic wants x-api-key).
    if key.auth_header.is_empty() || key.auth_header == "Authorization" {
        endpoint.auth_header.to_string()
    } else {
        key.auth_header.clone()
    }
}

fn pick_auth_format(key: &ApiKey, endpoint: &ProviderEndpoint) -> String {
    if key.auth_format.is_empty() || key.auth_format == "Bearer {key}" {
        endpoint.auth_format.to_string()
    } else {
        key.auth_format.clone()
    }
}

/// One item of an upstream stream: a decoded chunk, or the error that
/// ended it.
#[derive(Debug)]
pub enum StreamItem {
    Chunk(JsonValue),
    Error(ProxyError),
}

pub struct UpstreamClient {
    client: wreq::Client,
}

impl UpstreamClient {
    pub fn new(request_timeout: Duration) -> ProxyResult<Self> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .read_timeout(request_timeout)
            .build()
            .map_err(|err| ProxyError::Configuration(format!("upstream client: {err}")))?;
        Ok(Self { client })
    }

    /// Unary chat-completion call; returns the provider-native body.
    pub async fn chat_completion(
        &self,
        target: &UpstreamTarget,
        body: &JsonValue,
    ) -> ProxyResult<JsonValue> {
        let response = self.send(target, body).await?;
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(&response);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| map_transport_error(&target.provider, err))?;

        if !(200..300).contains(&status) {
            return Err(status_error(status, &bytes, retry_after));
        }

        serde_json::from_slice(&bytes).map_err(|err| ProxyError::Provider {
            status,
            message: format!("invalid upstream JSON: {err}"),
        })
    }

    /// Streaming call. Yields decoded SSE payloads through a bounded
    /// channel; the reader task parses incrementally and never buffers the
    /// whole response. Malformed payload lines are skipped (keepalives).
    pub async fn stream_chat_completion(
        &self,
        target: &UpstreamTarget,
        body: &JsonValue,
    ) -> ProxyResult<mpsc::Receiver<StreamItem>> {
        let response = self.send(target, body).await?;
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(&response);

        if !(200..300).contains(&status) {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| map_transport_error(&target.provider, err))?;
            return Err(status_error(status, &bytes, retry_after));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let provider = target.provider.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();
            'read: while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx
                            .send(StreamItem::Error(map_transport_error(&provider, err)))
                            .await;
                        return;
                    }
                };
                for frame in parser.push_bytes(&chunk) {
                    match frame {
                        SseFrame::Done => break 'read,
                        SseFrame::Data(payload) => {
                            match serde_json::from_str::<JsonValue>(&payload) {
                                Ok(value) => {
                                    if tx.send(StreamItem::Chunk(value)).await.is_err() {
                                        // Receiver gone: request cancelled.
                                        return;
                                    }
                                }
                                Err(_) => continue,
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn send(
        &self,
        target: &UpstreamTarget,
        body: &JsonValue,
    ) -> ProxyResult<wreq::Response> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| ProxyError::internal(format!("serialize upstream body: {err}")))?;

        let mut builder = self.client.request(wreq::Method::POST, &target.url);
        for (name, value) in &target.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(payload)
            .send()
            .await
            .map_err(|err| map_transport_error(&target.provider, err))
    }
}

fn map_transport_error(provider: &str, err: wreq::Error) -> ProxyError {
    if err.is_timeout() {
        return ProxyError::ServiceUnavailable(format!("{provider} timed out"));
    }
    if err.is_connect() {
        return ProxyError::ServiceUnavailable(format!("{provider} connect failed: {err}"));
    }
    ProxyError::ServiceUnavailable(format!("{provider} transport error: {err}"))
}

fn status_error(status: u16, body: &[u8], retry_after: Option<u64>) -> ProxyError {
    let message = serde_json::from_slice::<JsonValue>(body)
        .ok()
        .and_then(|value| extract_error_message(&value))
        .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(200).collect());

    match status {
        401 => ProxyError::Authentication(message),
        429 => ProxyError::RateLimit {
            message,
            retry_after,
        },
        status if status >= 500 => ProxyError::ServiceUnavailable(message),
        status => ProxyError::Provider { status, message },
    }
}

fn parse_retry_after(response: &wreq::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
