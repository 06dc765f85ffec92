//! Per-request orchestration: preprocess, resolve, select a key, adapt,
//! call upstream, adapt back, record statistics, log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use mproxy_pool::{BreakerSet, CircuitBreaker, KeyPool, RequestOutcome, StrategyKind};
use mproxy_protocol::openai::{ChatCompletionRequest, ChatCompletionResponse, Usage};
use mproxy_transform::{Adapter, Provider};

use crate::config::{ProxyConfig, RetryConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::logsink::{RequestLogEntry, RequestLogSink};
use crate::multimodal::MultimodalProcessor;
use crate::resolver::{ModelResolver, ModelView, Resolution};
use crate::upstream::{StreamItem, UpstreamClient, UpstreamTarget};

const STREAM_OUT_CAPACITY: usize = 64;
const STATUS_CLIENT_CLOSED: u16 = 499;

/// How one inbound call wants to be handled.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub source_api: String,
    /// Restrict resolution to one provider (stage 1 only, no transformer).
    pub forced_provider: Option<String>,
    /// Skip response canonicalization when the resolved provider is
    /// Anthropic (the `/v1/messages` surface).
    pub anthropic_native: bool,
    pub priority: i32,
}

impl CallOptions {
    pub fn chat_completions() -> Self {
        Self {
            source_api: "/v1/chat/completions".to_string(),
            forced_provider: None,
            anthropic_native: false,
            priority: 0,
        }
    }

    pub fn messages() -> Self {
        Self {
            source_api: "/v1/messages".to_string(),
            forced_provider: None,
            anthropic_native: true,
            priority: 0,
        }
    }

    pub fn provider_completions(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self {
            source_api: format!("/v1/provider/{provider}/completions"),
            forced_provider: Some(provider),
            anthropic_native: false,
            priority: 0,
        }
    }
}

/// Unary result: canonical for most callers, provider-native for the
/// Anthropic passthrough surface.
#[derive(Debug, Clone)]
pub enum ChatResult {
    Canonical(ChatCompletionResponse),
    Native(JsonValue),
}

impl ChatResult {
    pub fn into_json(self) -> JsonValue {
        match self {
            ChatResult::Canonical(response) => {
                serde_json::to_value(response).unwrap_or_else(|_| json!({}))
            }
            ChatResult::Native(value) => value,
        }
    }
}

pub struct ProxyEngine {
    resolver: ModelResolver,
    pool: Arc<KeyPool>,
    client: UpstreamClient,
    preprocessor: MultimodalProcessor,
    breakers: BreakerSet,
    log_sink: Arc<dyn RequestLogSink>,
    retry: RetryConfig,
}

impl ProxyEngine {
    pub fn new(
        view: Arc<ModelView>,
        pool: Arc<KeyPool>,
        config: &ProxyConfig,
        log_sink: Arc<dyn RequestLogSink>,
    ) -> ProxyResult<Self> {
        for (provider, name) in &config.strategies {
            match StrategyKind::parse(name) {
                Some(kind) => pool.strategies().bind_provider(provider.clone(), kind),
                None => {
                    return Err(ProxyError::Configuration(format!(
                        "unknown strategy '{name}' for provider '{provider}'"
                    )));
                }
            }
        }

        Ok(Self {
            resolver: ModelResolver::new(
                view,
                config.transformer_rules.clone(),
                config.default_route_key.clone(),
            ),
            pool,
            client: UpstreamClient::new(Duration::from_secs(config.upstream_timeout_secs))?,
            preprocessor: MultimodalProcessor::new(Duration::from_secs(
                config.image_fetch_timeout_secs,
            ))?,
            breakers: BreakerSet::new(config.breaker),
            log_sink,
            retry: config.retry.clone(),
        })
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    /// Unary chat completion.
    pub async fn chat(
        &self,
        request: ChatCompletionRequest,
        opts: &CallOptions,
    ) -> ProxyResult<ChatResult> {
        let started = Instant::now();
        let source_model = request.model.clone();
        let request_body = serde_json::to_string(&request).unwrap_or_default();

        self.preprocessor.validate(&request)?;
        let mut processed = self.preprocessor.process(request).await?;
        processed.stream = None;

        let attempts = if self.retry.enabled {
            self.retry.max_retries + 1
        } else {
            1
        };
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry.delay_for(attempt);
                tracing::info!(attempt, delay, model = %source_model, "retrying upstream call");
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            let avoid_flagged = self.retry.enabled && attempt > 0;
            match self
                .dispatch_unary(&processed, &source_model, &request_body, opts, started, avoid_flagged)
                .await
            {
                Ok(result) => return Ok(result),
                Err(err) if attempt + 1 < attempts && is_retryable(&err) => {
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| ProxyError::internal("retry attempts exhausted")))
    }

    async fn dispatch_unary(
        &self,
        processed: &ChatCompletionRequest,
        source_model: &str,
        request_body: &str,
        opts: &CallOptions,
        started: Instant,
        avoid_flagged: bool,
    ) -> ProxyResult<ChatResult> {
        let resolution = self.resolve(source_model, opts, avoid_flagged).await?;
        let Resolution { model, key } = &resolution;
        let adapter = self.adapter_for(&model.provider)?;

        let native_request = adapter.adapt_request(processed.clone(), &model.target_model)?;
        let target = UpstreamTarget::build(model, key, false)?;

        let breaker = self.breakers.breaker(&model.provider);
        if !breaker.try_acquire() {
            tracing::warn!(provider = %model.provider, "circuit open, refusing request");
            return Err(ProxyError::NoAvailableKey(model.provider.clone()));
        }

        match self.client.chat_completion(&target, &native_request).await {
            Ok(native_response) => {
                breaker.on_success();

                let passthrough = opts.anthropic_native && model.provider == "anthropic";
                let (result, usage) = if passthrough {
                    let usage = usage_from_native(&native_response);
                    (ChatResult::Native(native_response), usage)
                } else {
                    let response = adapter.adapt_response(native_response)?;
                    let usage = response.usage;
                    (ChatResult::Canonical(response), usage)
                };

                let elapsed = started.elapsed().as_secs_f64();
                let mut outcome = RequestOutcome::success()
                    .with_latency(elapsed)
                    .with_model(model.target_model.clone());
                outcome.usage = usage;
                self.pool.observe(key.id, &outcome).await;

                self.log_sink.append(self.entry(
                    opts,
                    source_model,
                    model,
                    request_body,
                    Some(result_body(&result)),
                    200,
                    None,
                    elapsed,
                ));
                Ok(result)
            }
            Err(err) => {
                breaker.on_failure();
                let elapsed = started.elapsed().as_secs_f64();
                let outcome =
                    RequestOutcome::failure(Some(err.status_code()), err.to_string());
                self.pool.observe(key.id, &outcome).await;

                self.log_sink.append(self.entry(
                    opts,
                    source_model,
                    model,
                    request_body,
                    None,
                    err.status_code(),
                    Some(err.to_string()),
                    elapsed,
                ));
                Err(err)
            }
        }
    }

    /// Streaming chat completion. The receiver yields ready-to-send SSE
    /// frames; the last frame is `data: [DONE]` on success or a
    /// `data: {"error": ...}` frame on mid-stream failure.
    pub async fn chat_stream(
        &self,
        request: ChatCompletionRequest,
        opts: &CallOptions,
    ) -> ProxyResult<mpsc::Receiver<Bytes>> {
        let started = Instant::now();
        let source_model = request.model.clone();
        let request_body = serde_json::to_string(&request).unwrap_or_default();

        self.preprocessor.validate(&request)?;
        let mut processed = self.preprocessor.process(request).await?;
        processed.stream = Some(true);

        let resolution = self.resolve(&source_model, opts, false).await?;
        let Resolution { model, key } = resolution;
        let adapter = self.adapter_for(&model.provider)?;

        let native_request = adapter.adapt_request(processed, &model.target_model)?;
        let target = UpstreamTarget::build(&model, &key, true)?;

        let breaker = self.breakers.breaker(&model.provider);
        if !breaker.try_acquire() {
            return Err(ProxyError::NoAvailableKey(model.provider.clone()));
        }

        let upstream = match self.client.stream_chat_completion(&target, &native_request).await
        {
            Ok(rx) => rx,
            Err(err) => {
                breaker.on_failure();
                let elapsed = started.elapsed().as_secs_f64();
                let outcome =
                    RequestOutcome::failure(Some(err.status_code()), err.to_string());
                self.pool.observe(key.id, &outcome).await;
                self.log_sink.append(self.entry(
                    opts,
                    &source_model,
                    &model,
                    &request_body,
                    None,
                    err.status_code(),
                    Some(err.to_string()),
                    elapsed,
                ));
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_OUT_CAPACITY);
        let passthrough = opts.anthropic_native && model.provider == "anthropic";
        let pool = self.pool.clone();
        let log_sink = self.log_sink.clone();
        let entry_template = self.entry(
            opts,
            &source_model,
            &model,
            &request_body,
            None,
            200,
            None,
            0.0,
        );
        let target_model = model.target_model.clone();
        let key_id = key.id;

        let pump = StreamPump {
            adapter,
            passthrough,
            pool,
            breaker,
            log_sink,
            entry_template,
            target_model,
            key_id,
            started,
        };
        tokio::spawn(async move {
            stream_pump(pump, upstream, tx).await;
        });

        Ok(rx)
    }

    async fn resolve(
        &self,
        source_model: &str,
        opts: &CallOptions,
        avoid_flagged: bool,
    ) -> ProxyResult<Resolution> {
        let mut resolution = match &opts.forced_provider {
            Some(provider) => {
                self.resolver
                    .resolve_for_provider(provider, &self.pool, opts.priority)
                    .await?
            }
            None => {
                self.resolver
                    .resolve(source_model, &self.pool, opts.priority)
                    .await?
            }
        };

        // Retry attempts steer away from keys already flagged for rotation
        // when a healthy sibling exists.
        if avoid_flagged && resolution.key.flagged_for_rotation {
            let replacement = self
                .pool
                .available(&resolution.model.provider)
                .await
                .into_iter()
                .find(|key| !key.flagged_for_rotation && key.id != resolution.key.id);
            if let Some(key) = replacement {
                resolution.key = key;
            }
        }
        Ok(resolution)
    }

    fn adapter_for(&self, provider: &str) -> ProxyResult<&'static dyn Adapter> {
        Provider::parse(provider)
            .map(mproxy_transform::adapter_for)
            .ok_or_else(|| ProxyError::Configuration(format!("no adapter for {provider}")))
    }

    #[allow(clippy::too_many_arguments)]
    fn entry(
        &self,
        opts: &CallOptions,
        source_model: &str,
        model: &crate::resolver::ModelConfig,
        request_body: &str,
        response_body: Option<String>,
        status_code: u16,
        error_message: Option<String>,
        processing_seconds: f64,
    ) -> RequestLogEntry {
        RequestLogEntry {
            at: OffsetDateTime::now_utc(),
            source_api: opts.source_api.clone(),
            target_api: format!("/{}/chat/completions", model.provider),
            source_model: source_model.to_string(),
            target_model: model.target_model.clone(),
            provider: model.provider.clone(),
            request_body: request_body.to_string(),
            response_body,
            status_code,
            error_message,
            processing_seconds,
        }
    }
}

struct StreamPump {
    adapter: &'static dyn Adapter,
    passthrough: bool,
    pool: Arc<KeyPool>,
    breaker: Arc<CircuitBreaker>,
    log_sink: Arc<dyn RequestLogSink>,
    entry_template: RequestLogEntry,
    target_model: String,
    key_id: i64,
    started: Instant,
}

async fn stream_pump(
    mut pump: StreamPump,
    mut upstream: mpsc::Receiver<StreamItem>,
    tx: mpsc::Sender<Bytes>,
) {
    loop {
        match upstream.recv().await {
            Some(StreamItem::Chunk(value)) => {
                let frame = if pump.passthrough {
                    sse_frame(&value)
                } else {
                    match pump.adapter.adapt_stream_chunk(value) {
                        Ok(chunk) => match serde_json::to_value(&chunk) {
                            Ok(value) => sse_frame(&value),
                            Err(err) => {
                                pump.fail(ProxyError::internal(err.to_string()), &tx).await;
                                return;
                            }
                        },
                        Err(err) => {
                            pump.fail(ProxyError::Adapter(err), &tx).await;
                            return;
                        }
                    }
                };
                if tx.send(frame).await.is_err() {
                    pump.cancelled().await;
                    return;
                }
            }
            Some(StreamItem::Error(err)) => {
                pump.fail(err, &tx).await;
                return;
            }
            None => break,
        }
    }

    let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
    pump.finished().await;
}

impl StreamPump {
    /// Upstream or translation failure after headers were committed: one
    /// final error frame, failure stats, one log row.
    async fn fail(&mut self, err: ProxyError, tx: &mpsc::Sender<Bytes>) {
        let frame = sse_frame(&err.to_body());
        let _ = tx.send(frame).await;
        self.breaker.on_failure();

        let outcome = RequestOutcome::failure(Some(err.status_code()), err.to_string());
        self.pool.observe(self.key_id, &outcome).await;

        let mut entry = self.entry_template.clone();
        entry.status_code = err.status_code();
        entry.error_message = Some(err.to_string());
        entry.processing_seconds = self.started.elapsed().as_secs_f64();
        self.log_sink.append(entry);
    }

    /// Client went away: cancel the upstream read and record a 499.
    async fn cancelled(&mut self) {
        let outcome =
            RequestOutcome::failure(Some(STATUS_CLIENT_CLOSED), "client closed request");
        self.pool.observe(self.key_id, &outcome).await;

        let mut entry = self.entry_template.clone();
        entry.status_code = STATUS_CLIENT_CLOSED;
        entry.error_message = Some("client closed request".to_string());
        entry.processing_seconds = self.started.elapsed().as_secs_f64();
        self.log_sink.append(entry);
    }

    async fn finished(&mut self) {
        self.breaker.on_success();
        let elapsed = self.started.elapsed().as_secs_f64();
        let outcome = RequestOutcome::success()
            .with_latency(elapsed)
            .with_model(self.target_model.clone());
        self.pool.observe(self.key_id, &outcome).await;

        let mut entry = self.entry_template.clone();
        entry.response_body = Some(r#"{"stream":true}"#.to_string());
        entry.processing_seconds = elapsed;
        self.log_sink.append(entry);
    }
}

fn sse_frame(value: &JsonValue) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

fn result_body(result: &ChatResult) -> String {
    match result {
        ChatResult::Canonical(response) => serde_json::to_string(response).unwrap_or_default(),
        ChatResult::Native(value) => value.to_string(),
    }
}

/// Usage block from an Anthropic-native body, for statistics parity on the
/// passthrough surface.
fn usage_from_native(native: &JsonValue) -> Option<Usage> {
    let usage = native.get("usage")?;
    let input = usage.get("input_tokens").and_then(|v| v.as_i64())?;
    let output = usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    Some(Usage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
    })
}

fn is_retryable(err: &ProxyError) -> bool {
    matches!(
        err,
        ProxyError::ServiceUnavailable(_)
            | ProxyError::RateLimit { .. }
            | ProxyError::NoAvailableKey(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_extraction_from_native_bodies() {
        let native = json!({"usage": {"input_tokens": 12, "output_tokens": 5}});
        let usage = usage_from_native(&native).unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 17);

        assert!(usage_from_native(&json!({})).is_none());
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable(&ProxyError::ServiceUnavailable("x".into())));
        assert!(is_retryable(&ProxyError::RateLimit {
            message: "x".into(),
            retry_after: None
        }));
        assert!(!is_retryable(&ProxyError::Validation("x".into())));
        assert!(!is_retryable(&ProxyError::Authentication("x".into())));
    }

    #[test]
    fn call_options_surfaces() {
        let chat = CallOptions::chat_completions();
        assert_eq!(chat.source_api, "/v1/chat/completions");
        assert!(!chat.anthropic_native);

        let messages = CallOptions::messages();
        assert!(messages.anthropic_native);

        let forced = CallOptions::provider_completions("gemini");
        assert_eq!(forced.forced_provider.as_deref(), Some("gemini"));
        assert_eq!(forced.source_api, "/v1/provider/gemini/completions");
    }

    #[test]
    fn sse_frames_are_newline_terminated() {
        let frame = sse_frame(&json!({"a": 1}));
        assert_eq!(&frame[..], b"data: {\"a\":1}\n\n");
    }
}
