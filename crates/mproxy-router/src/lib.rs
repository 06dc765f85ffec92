//! The inbound HTTP surface: the four proxy endpoints, request parsing,
//! SSE response framing, and the error-to-status mapping.

mod inbound;

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;

use mproxy_core::{CallOptions, ChatResult, ProxyEngine, ProxyError};
use mproxy_protocol::openai::{ChatCompletionRequest, ModelEntry, ModelList};

pub use inbound::AnthropicInbound;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<ProxyEngine>,
}

pub fn api_router(engine: Arc<ProxyEngine>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route(
            "/v1/provider/{provider}/completions",
            post(provider_completions),
        )
        .route("/v1/models", get(models_list))
        .with_state(ApiState { engine })
}

async fn chat_completions(State(state): State<ApiState>, Json(body): Json<JsonValue>) -> Response {
    let request = match parse_canonical(body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    dispatch(state, request, CallOptions::chat_completions()).await
}

async fn messages(State(state): State<ApiState>, Json(body): Json<JsonValue>) -> Response {
    let inbound: AnthropicInbound = match serde_json::from_value(body) {
        Ok(inbound) => inbound,
        Err(err) => {
            return error_response(ProxyError::Validation(format!("invalid request: {err}")));
        }
    };
    let request = inbound.into_canonical();
    dispatch(state, request, CallOptions::messages()).await
}

async fn provider_completions(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    Json(body): Json<JsonValue>,
) -> Response {
    let request = match parse_canonical(body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    dispatch(state, request, CallOptions::provider_completions(provider)).await
}

/// Distinct enabled route keys in the OpenAI list shape.
async fn models_list(State(state): State<ApiState>) -> Response {
    let rows = state.engine.resolver().view().load();
    let created = OffsetDateTime::now_utc().unix_timestamp();

    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();
    for row in rows.iter() {
        if !seen.insert(row.route_key.clone()) {
            continue;
        }
        entries.push(ModelEntry {
            id: row.route_key.clone(),
            object: "model".to_string(),
            created: Some(created),
            owned_by: row.provider.clone(),
        });
    }
    (StatusCode::OK, Json(ModelList::new(entries))).into_response()
}

fn parse_canonical(body: JsonValue) -> Result<ChatCompletionRequest, ProxyError> {
    serde_json::from_value(body)
        .map_err(|err| ProxyError::Validation(format!("invalid request: {err}")))
}

async fn dispatch(state: ApiState, request: ChatCompletionRequest, opts: CallOptions) -> Response {
    if request.is_stream() {
        match state.engine.chat_stream(request, &opts).await {
            Ok(rx) => sse_response(rx),
            Err(err) => error_response(err),
        }
    } else {
        match state.engine.chat(request, &opts).await {
            Ok(result) => unary_response(result, &opts),
            Err(err) => error_response(err),
        }
    }
}

fn unary_response(result: ChatResult, opts: &CallOptions) -> Response {
    let body = match result {
        // The messages surface answers in the Anthropic shape even when a
        // non-Anthropic upstream produced a canonical completion.
        ChatResult::Canonical(response) if opts.anthropic_native => {
            mproxy_transform::canonical_to_message(&response)
        }
        other => other.into_json(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<bytes::Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(err: ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    tracing::debug!(status = %status, error = %err, "request failed");
    (status, Json(err.to_body())).into_response()
}
