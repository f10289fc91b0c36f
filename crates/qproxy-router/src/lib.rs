use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, RawQuery, State};
use axum::response::{Html, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use tracing::{info, warn};
use uuid::Uuid;

use qproxy_core::auth::authenticate;
use qproxy_core::error::ProxyError;
use qproxy_core::execute::ProxyResponse;
use qproxy_core::state::AppState;
use qproxy_protocol::openai::request::ChatCompletionRequest;

const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/refresh-token", post(refresh_token))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let started_at = Instant::now();

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&ProxyError::BadRequest(err.to_string()), &request_id);
        }
    };

    let config = state.config.load();
    let auth = match authenticate(
        &config,
        &headers,
        query.as_deref(),
        request.api_key.as_deref(),
    ) {
        Ok(auth) => auth,
        Err(err) => return error_response(&err, &request_id),
    };

    info!(
        event = "chat_received",
        request_id = %request_id,
        model = %request.model,
        messages = request.messages.len(),
        stream = request.wants_stream()
    );

    match state
        .orchestrator
        .execute_chat(&request, &auth, &request_id)
        .await
    {
        Ok(ProxyResponse::Stream { body }) => {
            info!(
                event = "chat_responded",
                request_id = %request_id,
                elapsed_ms = started_at.elapsed().as_millis(),
                is_stream = true
            );
            sse_response(body, &request_id)
        }
        Ok(ProxyResponse::Json { status, body }) => {
            info!(
                event = "chat_responded",
                request_id = %request_id,
                status = status.as_u16(),
                elapsed_ms = started_at.elapsed().as_millis(),
                is_stream = false
            );
            json_response(status, body, &request_id)
        }
        Err(err) => {
            warn!(
                event = "chat_failed",
                request_id = %request_id,
                kind = err.kind(),
                error = %err,
                elapsed_ms = started_at.elapsed().as_millis()
            );
            error_response(&err, &request_id)
        }
    }
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let config = state.config.load();
    let auth = match authenticate(&config, &headers, query.as_deref(), None) {
        Ok(auth) => auth,
        Err(err) => return error_response(&err, &request_id),
    };

    let list = state.orchestrator.list_models(&auth).await;
    let body = serde_json::to_vec(&list).unwrap_or_default();
    json_response(StatusCode::OK, Bytes::from(body), &request_id)
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let config = state.config.load();
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "auth_mode": config.auth_mode,
        "vision_fallback_model": config.vision_fallback_model,
        "identity_pool": state.pool.status(),
        "identities": state.pool.identity_statuses(),
    });
    json_response(
        StatusCode::OK,
        Bytes::from(body.to_string()),
        &Uuid::new_v4().to_string(),
    )
}

async fn refresh_token(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let config = state.config.load();
    if let Err(err) = authenticate(&config, &headers, query.as_deref(), None) {
        return error_response(&err, &request_id);
    }

    let outcomes = state
        .pool
        .refresh_expired(state.exchanger.as_ref(), true)
        .await;
    let refreshed = outcomes.iter().filter(|o| o.refreshed).count();
    info!(
        event = "manual_refresh",
        request_id = %request_id,
        attempted = outcomes.len(),
        refreshed
    );
    let body = serde_json::json!({
        "attempted": outcomes.len(),
        "refreshed": refreshed,
        "identities": outcomes,
    });
    json_response(
        StatusCode::OK,
        Bytes::from(body.to_string()),
        &request_id,
    )
}

async fn index() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>qproxy</title></head>\
         <body><h1>qproxy</h1>\
         <p>OpenAI-compatible proxy for the Qwen web chat.</p>\
         <p>POST <code>/v1/chat/completions</code> · GET <code>/v1/models</code> · \
         GET <code>/health</code></p></body></html>",
    )
}

fn sse_response(body: qproxy_core::StreamBody, request_id: &str) -> Response {
    let mut resp = Response::new(Body::from_stream(body.stream));
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    resp
}

fn json_response(status: StatusCode, body: Bytes, request_id: &str) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

fn error_response(err: &ProxyError, request_id: &str) -> Response {
    let body = err.body_json(request_id).to_string();
    json_response(err.status_code(), Bytes::from(body), request_id)
}
