use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::stream::unfold;
use http::StatusCode;
use tokio::sync::mpsc;
use tracing::{info, warn};

use qproxy_common::{GlobalConfig, now_epoch_millis, now_epoch_seconds};
use qproxy_pool::{FailureSignal, Identity, IdentityPool};
use qproxy_protocol::openai::models::ModelList;
use qproxy_protocol::openai::request::ChatCompletionRequest;
use qproxy_protocol::qwen::chat::ChatListResponse;
use qproxy_protocol::qwen::models::ModelCatalogue;
use qproxy_protocol::sse::{self, SseParser};
use qproxy_translate::{
    ChunkTranslator, CompletionCollector, TranslateConfig, TranslationPlan, build_envelope,
    expand_catalogue, fallback_models, plan,
};

use crate::auth::ClientAuth;
use crate::error::ProxyError;
use crate::qwen::{QwenUpstream, parse_chat_id};
use crate::upstream_client::{ByteStream, UpstreamBody, UpstreamClient};

/// Additional identities tried after the first attempt fails retryably.
const EXTRA_ATTEMPTS: usize = 2;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// Chats older than this are eligible for background deletion.
const CLEANUP_MIN_AGE_SECS: i64 = 60 * 60;
const CLEANUP_BATCH: usize = 20;

pub struct StreamBody {
    pub stream: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
}

impl StreamBody {
    fn from_receiver(rx: mpsc::Receiver<Bytes>) -> Self {
        let stream = unfold(rx, |mut rx| async move {
            rx.recv().await.map(|bytes| (Ok::<_, io::Error>(bytes), rx))
        });
        Self {
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBody").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ProxyResponse {
    Json { status: StatusCode, body: Bytes },
    Stream { body: StreamBody },
}

/// Drives one completion end-to-end: identity selection, the two-stage
/// upstream protocol, response translation, and failover.
pub struct Orchestrator {
    client: Arc<dyn UpstreamClient>,
    pool: Arc<IdentityPool>,
    upstream: QwenUpstream,
    config: Arc<ArcSwap<GlobalConfig>>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        pool: Arc<IdentityPool>,
        upstream: QwenUpstream,
        config: Arc<ArcSwap<GlobalConfig>>,
    ) -> Self {
        Self {
            client,
            pool,
            upstream,
            config,
        }
    }

    pub async fn execute_chat(
        &self,
        request: &ChatCompletionRequest,
        auth: &ClientAuth,
        request_id: &str,
    ) -> Result<ProxyResponse, ProxyError> {
        let config = self.config.load();
        let translate_config = TranslateConfig {
            vision_fallback_model: config.vision_fallback_model.clone(),
            disable_vision_fallback: config.disable_vision_fallback,
        };
        let plan = plan(request, &translate_config)?;
        let want_stream = request.wants_stream();

        let mut last_error: Option<ProxyError> = None;
        for attempt in 0..=EXTRA_ATTEMPTS {
            let (identity, from_pool) = match auth {
                ClientAuth::Direct { token, cookie } => (
                    Identity::new("client".to_string(), token.clone(), cookie.clone()),
                    false,
                ),
                ClientAuth::Pool => match self.pool.acquire() {
                    Some(identity) => (identity, true),
                    None => return Err(last_error.unwrap_or(ProxyError::UpstreamUnavailable)),
                },
            };

            info!(
                event = "chat_attempt",
                request_id,
                attempt,
                identity = %identity.id,
                model = %plan.upstream_model,
                chat_type = plan.chat_type.as_str(),
                stream = want_stream
            );

            match self
                .attempt(&identity, &plan, request, want_stream, request_id)
                .await
            {
                Ok(response) => {
                    if from_pool {
                        self.pool.mark_success(&identity.id);
                    }
                    return Ok(response);
                }
                Err(err) => {
                    warn!(
                        event = "chat_attempt_failed",
                        request_id,
                        attempt,
                        identity = %identity.id,
                        error = %err
                    );
                    if from_pool && let Some(signal) = failure_signal(&err) {
                        self.pool.mark_failure(&identity.id, signal);
                    }
                    let retry = err.is_retryable()
                        && from_pool
                        && attempt < EXTRA_ATTEMPTS
                        && self.pool.has_alternative(&identity.id);
                    if !retry {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(ProxyError::UpstreamUnavailable))
    }

    /// One try with one identity: create the chat, post the envelope, wire
    /// up the response. Errors here are pre-byte and therefore retryable by
    /// the caller; once a `Stream` response is returned, failures surface
    /// in-band as a synthetic chunk.
    async fn attempt(
        &self,
        identity: &Identity,
        plan: &TranslationPlan,
        request: &ChatCompletionRequest,
        want_stream: bool,
        request_id: &str,
    ) -> Result<ProxyResponse, ProxyError> {
        let create = self.upstream.create_chat(
            identity,
            &plan.upstream_model,
            plan.chat_type,
            now_epoch_millis(),
        );
        let response = self
            .client
            .send(create)
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))?;
        let status = response.status;
        let body = response.into_bytes().await;
        if !(200..300).contains(&status) {
            return Err(ProxyError::Upstream {
                status,
                body: truncate_body(&body),
            });
        }
        let chat_id =
            parse_chat_id(&body).ok_or_else(|| ProxyError::CreateChatFailed(truncate_body(&body)))?;

        let envelope = build_envelope(plan, request, &chat_id, now_epoch_seconds())?;
        let payload =
            serde_json::to_vec(&envelope).map_err(|err| ProxyError::Translation(err.to_string()))?;

        info!(
            event = "upstream_dispatch",
            request_id,
            chat_id = %chat_id,
            fallback = plan.used_fallback
        );

        let completion = self.upstream.completion(
            identity,
            &chat_id,
            Bytes::from(payload),
            plan.used_fallback,
        );
        let response = self
            .client
            .send(completion)
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))?;
        if !response.is_success() {
            let status = response.status;
            let body = response.into_bytes().await;
            return Err(ProxyError::Upstream {
                status,
                body: truncate_body(&body),
            });
        }

        let rx = match response.body {
            UpstreamBody::Stream(rx) => rx,
            UpstreamBody::Bytes(bytes) => {
                // Buffered SSE (small responses); feed it through the same
                // path.
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(Ok(bytes));
                rx
            }
        };

        if want_stream {
            Ok(self.stream_response(rx, &request.model))
        } else {
            Ok(self.collect_response(rx, &request.model).await)
        }
    }

    /// Pipes upstream SSE through the chunk translator into the downstream
    /// body. A single relay task owns the output channel, so `[DONE]` is
    /// written exactly once no matter which terminal event fires first, and
    /// a client disconnect tears the upstream read down by dropping it.
    fn stream_response(&self, mut rx: ByteStream, model: &str) -> ProxyResponse {
        let (tx, out_rx) = mpsc::channel::<Bytes>(64);
        let mut translator = ChunkTranslator::new(model);

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let start = tokio::time::Instant::now() + KEEPALIVE_PERIOD;
            let mut keepalive = tokio::time::interval_at(start, KEEPALIVE_PERIOD);

            loop {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(Ok(chunk)) => {
                            keepalive.reset();
                            for data in parser.push_bytes(&chunk) {
                                for frame in translator.push_data(&data) {
                                    if tx.send(frame).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            if translator.is_finished() {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            for frame in translator.fail(&err.to_string()) {
                                if tx.send(frame).await.is_err() {
                                    return;
                                }
                            }
                            return;
                        }
                        None => {
                            for data in parser.finish() {
                                for frame in translator.push_data(&data) {
                                    if tx.send(frame).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            for frame in translator.finish() {
                                if tx.send(frame).await.is_err() {
                                    return;
                                }
                            }
                            return;
                        }
                    },
                    _ = keepalive.tick() => {
                        if tx.send(sse::keepalive_frame()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        ProxyResponse::Stream {
            body: StreamBody::from_receiver(out_rx),
        }
    }

    /// Buffered mode: the upstream streams anyway, so the same SSE is
    /// aggregated into one completion. A dropped connection returns whatever
    /// was collected.
    async fn collect_response(&self, mut rx: ByteStream, model: &str) -> ProxyResponse {
        let mut parser = SseParser::new();
        let mut collector = CompletionCollector::new(model);
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    for data in parser.push_bytes(&chunk) {
                        collector.push_data(&data);
                    }
                }
                Err(err) => {
                    warn!(event = "collect_interrupted", error = %err);
                    break;
                }
            }
        }
        for data in parser.finish() {
            collector.push_data(&data);
        }

        let completion = collector.finalize();
        let body = serde_json::to_vec(&completion).unwrap_or_default();
        ProxyResponse::Json {
            status: StatusCode::OK,
            body: Bytes::from(body),
        }
    }

    /// Upstream catalogue with suffix expansion; a static list keeps clients
    /// usable when the upstream has nothing to say.
    pub async fn list_models(&self, auth: &ClientAuth) -> ModelList {
        let created = now_epoch_seconds();
        let identity = match auth {
            ClientAuth::Direct { token, cookie } => Some(Identity::new(
                "client".to_string(),
                token.clone(),
                cookie.clone(),
            )),
            ClientAuth::Pool => self.pool.acquire(),
        };
        let Some(identity) = identity else {
            return fallback_models(created);
        };

        let request = self.upstream.list_models(&identity);
        let catalogue = match self.client.send(request).await {
            Ok(response) if response.is_success() => {
                let body = response.into_bytes().await;
                serde_json::from_slice::<ModelCatalogue>(&body)
                    .map(|parsed| parsed.data)
                    .unwrap_or_default()
            }
            Ok(response) => {
                warn!(event = "models_fetch_failed", status = response.status);
                Vec::new()
            }
            Err(err) => {
                warn!(event = "models_fetch_failed", error = %err);
                Vec::new()
            }
        };

        if catalogue.is_empty() {
            fallback_models(created)
        } else {
            expand_catalogue(&catalogue, created)
        }
    }

    /// Deletes a bounded page of stale upstream chats with one healthy
    /// identity. Best-effort; skipped entirely when nothing healthy exists.
    pub async fn cleanup_chats(&self) -> Result<usize, ProxyError> {
        let Some(identity) = self.pool.acquire() else {
            return Ok(0);
        };
        if identity.health != qproxy_pool::Health::Healthy {
            return Ok(0);
        }

        let request = self.upstream.list_chats(&identity, 1);
        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| ProxyError::Transport(err.to_string()))?;
        if !response.is_success() {
            let status = response.status;
            return Err(ProxyError::Upstream {
                status,
                body: truncate_body(&response.into_bytes().await),
            });
        }
        let body = response.into_bytes().await;
        let listed: ChatListResponse = serde_json::from_slice(&body).unwrap_or(ChatListResponse {
            data: Vec::new(),
        });

        let cutoff = now_epoch_seconds() - CLEANUP_MIN_AGE_SECS;
        let mut deleted = 0;
        for chat in listed
            .data
            .iter()
            .filter(|chat| chat.updated_at.is_none_or(|at| at <= cutoff))
            .take(CLEANUP_BATCH)
        {
            let request = self.upstream.delete_chat(&identity, &chat.id);
            match self.client.send(request).await {
                Ok(response) if response.is_success() => deleted += 1,
                Ok(response) => {
                    warn!(event = "chat_delete_failed", chat = %chat.id, status = response.status);
                }
                Err(err) => {
                    warn!(event = "chat_delete_failed", chat = %chat.id, error = %err);
                }
            }
        }
        Ok(deleted)
    }
}

/// Maps a pre-byte failure onto the pool's accounting. Auth-shaped bodies
/// quarantine the identity even when the status is not 401/403.
fn failure_signal(err: &ProxyError) -> Option<FailureSignal> {
    match err {
        ProxyError::Upstream { status, body } => {
            if *status == 401 || *status == 403 || body_indicates_invalid_token(body) {
                Some(FailureSignal::Auth)
            } else {
                Some(FailureSignal::Status(*status))
            }
        }
        ProxyError::Transport(_) => Some(FailureSignal::Transport),
        ProxyError::CreateChatFailed(_) => Some(FailureSignal::Status(502)),
        _ => None,
    }
}

fn body_indicates_invalid_token(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("token") && (lower.contains("invalid") || lower.contains("expired"))
}

fn truncate_body(body: &Bytes) -> String {
    const LIMIT: usize = 512;
    let text = String::from_utf8_lossy(body);
    if text.len() <= LIMIT {
        return text.to_string();
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_bodies_quarantine_even_without_auth_status() {
        let err = ProxyError::Upstream {
            status: 400,
            body: "{\"message\":\"Invalid token supplied\"}".to_string(),
        };
        assert_eq!(failure_signal(&err), Some(FailureSignal::Auth));

        let err = ProxyError::Upstream {
            status: 500,
            body: "internal".to_string(),
        };
        assert_eq!(failure_signal(&err), Some(FailureSignal::Status(500)));
    }

    #[test]
    fn non_upstream_errors_do_not_mark_identities() {
        assert!(failure_signal(&ProxyError::BadRequest("x".into())).is_none());
        assert!(failure_signal(&ProxyError::Translation("x".into())).is_none());
    }
}
