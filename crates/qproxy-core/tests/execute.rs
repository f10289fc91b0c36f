use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;

use qproxy_common::{CredentialPair, GlobalConfigPatch};
use qproxy_core::ProxyError;
use qproxy_core::auth::ClientAuth;
use qproxy_core::execute::{Orchestrator, ProxyResponse};
use qproxy_core::qwen::QwenUpstream;
use qproxy_core::upstream_client::{
    TransportError, UpstreamBody, UpstreamClient, UpstreamHttpRequest, UpstreamHttpResponse,
};
use qproxy_pool::{ExchangeError, Health, IdentityPool, PoolConfig, TokenExchanger};
use qproxy_protocol::openai::request::ChatCompletionRequest;

enum Scripted {
    Json {
        status: u16,
        body: &'static str,
    },
    Stream {
        frames: Vec<Result<&'static str, &'static str>>,
    },
}

struct MockClient {
    script: Mutex<VecDeque<Scripted>>,
    urls: Mutex<Vec<String>>,
}

impl MockClient {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            urls: Mutex::new(Vec::new()),
        })
    }

    fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl UpstreamClient for MockClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            self.urls.lock().unwrap().push(req.url.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("mock script exhausted");
            match next {
                Scripted::Json { status, body } => Ok(UpstreamHttpResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(body.as_bytes())),
                }),
                Scripted::Stream { frames } => {
                    let (tx, rx) = tokio::sync::mpsc::channel(frames.len().max(1));
                    for frame in frames {
                        let item = match frame {
                            Ok(data) => Ok(Bytes::from(format!("data: {data}\n\n"))),
                            Err(message) => Err(TransportError::other(message)),
                        };
                        tx.try_send(item).expect("mock channel capacity");
                    }
                    Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
            }
        })
    }
}

struct NoExchange;

#[async_trait]
impl TokenExchanger for NoExchange {
    async fn exchange(&self, _cookie: &str) -> Result<String, ExchangeError> {
        Err(ExchangeError::NoCookie)
    }
}

fn pairs(n: usize) -> Vec<CredentialPair> {
    (0..n)
        .map(|i| CredentialPair {
            token: format!("token-{i}"),
            cookie: format!("cookie-{i}"),
        })
        .collect()
}

async fn setup(
    script: Vec<Scripted>,
    identities: usize,
) -> (Orchestrator, Arc<IdentityPool>, Arc<MockClient>) {
    let client = MockClient::new(script);
    let pool = Arc::new(IdentityPool::new(PoolConfig::default()));
    pool.initialize(&pairs(identities), &NoExchange).await;
    let config = Arc::new(ArcSwap::from_pointee(
        GlobalConfigPatch::default().into_config().unwrap(),
    ));
    let orchestrator = Orchestrator::new(
        client.clone(),
        pool.clone(),
        QwenUpstream::new("https://chat.qwen.ai"),
        config,
    );
    (orchestrator, pool, client)
}

fn request(json: &str) -> ChatCompletionRequest {
    serde_json::from_str(json).unwrap()
}

async fn read_stream(response: ProxyResponse) -> Vec<String> {
    let ProxyResponse::Stream { body } = response else {
        panic!("expected a streaming response");
    };
    let mut stream = body.stream;
    let mut frames = Vec::new();
    while let Some(item) = stream.next().await {
        frames.push(String::from_utf8(item.unwrap().to_vec()).unwrap());
    }
    frames
}

fn delta_content(frame: &str) -> Option<String> {
    let payload = frame.trim_start_matches("data: ").trim();
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value["choices"][0]["delta"]["content"]
        .as_str()
        .map(str::to_string)
}

const CREATE_OK: Scripted = Scripted::Json {
    status: 200,
    body: r#"{"success":true,"data":{"id":"C1"}}"#,
};

#[tokio::test]
async fn single_turn_stream_end_to_end() {
    let (orchestrator, pool, client) = setup(
        vec![
            CREATE_OK,
            Scripted::Stream {
                frames: vec![
                    Ok(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
                    Ok(r#"{"choices":[{"delta":{"content":"he"}}]}"#),
                    Ok(r#"{"choices":[{"delta":{"content":"llo"}}]}"#),
                    Ok("[DONE]"),
                ],
            },
        ],
        1,
    )
    .await;

    let req = request(r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}]}"#);
    let response = orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap();
    let frames = read_stream(response).await;

    // Role chunk first, then both content deltas in upstream order.
    let first: serde_json::Value =
        serde_json::from_str(frames[0].trim_start_matches("data: ").trim()).unwrap();
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
    let contents: Vec<String> = frames.iter().filter_map(|f| delta_content(f)).collect();
    assert_eq!(contents, vec!["he", "llo"]);

    // Exactly one [DONE], and it is the final frame.
    assert_eq!(frames.iter().filter(|f| f.contains("[DONE]")).count(), 1);
    assert!(frames.last().unwrap().contains("[DONE]"));
    assert!(frames.iter().any(|f| f.contains("\"finish_reason\":\"stop\"")));

    // The completion URL carried the chat id from create-chat.
    let urls = client.urls();
    assert!(urls[0].ends_with("/api/v2/chats/new"));
    assert!(urls[1].ends_with("/api/v2/chat/completions?chat_id=C1"));

    let status = pool.identity_statuses();
    assert!(status[0].last_success.is_some());
    assert_eq!(status[0].health, Health::Healthy);
}

#[tokio::test]
async fn identity_failover_retries_once_with_fresh_chat() {
    let (orchestrator, pool, client) = setup(
        vec![
            // Identity A: create-chat rejected with 401 before any bytes.
            Scripted::Json {
                status: 401,
                body: r#"{"message":"unauthorized"}"#,
            },
            // Identity B: fresh create-chat, then a clean stream.
            Scripted::Json {
                status: 200,
                body: r#"{"data":{"id":"C2"}}"#,
            },
            Scripted::Stream {
                frames: vec![
                    Ok(r#"{"choices":[{"delta":{"content":"ok"}}]}"#),
                    Ok("[DONE]"),
                ],
            },
        ],
        2,
    )
    .await;

    let req = request(r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}]}"#);
    let response = orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap();
    let frames = read_stream(response).await;
    assert!(frames.iter().any(|f| delta_content(f).as_deref() == Some("ok")));

    // Retry happened exactly once: one failed create plus one full pass.
    let urls = client.urls();
    assert_eq!(urls.len(), 3);
    assert!(urls[2].contains("chat_id=C2"));

    let statuses = pool.identity_statuses();
    assert_eq!(statuses[0].health, Health::Quarantined);
    assert!(statuses[0].needs_refresh);
    assert_eq!(statuses[1].health, Health::Healthy);
    assert!(statuses[1].last_success.is_some());
}

#[tokio::test]
async fn mid_stream_failure_yields_synthetic_chunk_then_done() {
    let (orchestrator, _pool, _client) = setup(
        vec![
            CREATE_OK,
            Scripted::Stream {
                frames: vec![
                    Ok(r#"{"choices":[{"delta":{"content":"par"}}]}"#),
                    Err("connection reset by upstream"),
                ],
            },
        ],
        1,
    )
    .await;

    let req = request(r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}]}"#);
    let response = orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap();
    let frames = read_stream(response).await;

    let contents: Vec<String> = frames.iter().filter_map(|f| delta_content(f)).collect();
    assert_eq!(contents[0], "par");
    assert!(contents[1].contains("connection reset"));
    assert!(frames.iter().any(|f| f.contains("\"finish_reason\":\"stop\"")));
    assert_eq!(frames.iter().filter(|f| f.contains("[DONE]")).count(), 1);
    assert!(frames.last().unwrap().contains("[DONE]"));
}

#[tokio::test]
async fn empty_pool_fails_without_touching_upstream() {
    let (orchestrator, _pool, client) = setup(Vec::new(), 0).await;
    let req = request(r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}]}"#);
    let err = orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::UpstreamUnavailable));
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(client.urls().is_empty());
}

#[tokio::test]
async fn empty_messages_never_reach_upstream() {
    let (orchestrator, _pool, client) = setup(Vec::new(), 1).await;
    let req = request(r#"{"model":"qwen-max","messages":[]}"#);
    let err = orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::BadRequest(_)));
    assert!(client.urls().is_empty());
}

#[tokio::test]
async fn failover_stops_after_three_attempts() {
    let (orchestrator, pool, client) = setup(
        vec![
            Scripted::Json { status: 500, body: "boom" },
            Scripted::Json { status: 500, body: "boom" },
            Scripted::Json { status: 500, body: "boom" },
        ],
        3,
    )
    .await;

    let req = request(r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}]}"#);
    let err = orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Upstream { status: 500, .. }));
    assert_eq!(client.urls().len(), 3);
    assert!(
        pool.identity_statuses()
            .iter()
            .all(|s| s.health == Health::Degraded)
    );
}

#[tokio::test]
async fn create_chat_without_id_is_a_502() {
    let (orchestrator, _pool, _client) = setup(
        vec![Scripted::Json {
            status: 200,
            body: r#"{"data":{}}"#,
        }],
        1,
    )
    .await;

    let req = request(r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}]}"#);
    let err = orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::CreateChatFailed(_)));
    assert_eq!(err.kind(), "upstream_create_chat_failed");
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn invalid_token_body_quarantines_before_retrying() {
    let (orchestrator, pool, _client) = setup(
        vec![
            Scripted::Json {
                status: 400,
                body: r#"{"message":"Invalid token"}"#,
            },
            Scripted::Json {
                status: 200,
                body: r#"{"data":{"id":"C3"}}"#,
            },
            Scripted::Stream {
                frames: vec![
                    Ok(r#"{"choices":[{"delta":{"content":"x"}}]}"#),
                    Ok("[DONE]"),
                ],
            },
        ],
        2,
    )
    .await;

    let req = request(r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}]}"#);
    orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap();

    let statuses = pool.identity_statuses();
    assert_eq!(statuses[0].health, Health::Quarantined);
    assert!(statuses[0].needs_refresh);
}

#[tokio::test]
async fn client_mode_credentials_do_not_mark_the_pool() {
    let (orchestrator, pool, client) = setup(
        vec![Scripted::Json {
            status: 401,
            body: "unauthorized",
        }],
        1,
    )
    .await;

    let req = request(r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}]}"#);
    let auth = ClientAuth::Direct {
        token: "their-token".to_string(),
        cookie: String::new(),
    };
    let err = orchestrator
        .execute_chat(&req, &auth, "req-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Upstream { status: 401, .. }));

    // Per-request credentials are not retried and never touch pool health.
    assert_eq!(client.urls().len(), 1);
    assert_eq!(pool.identity_statuses()[0].health, Health::Healthy);
}

#[tokio::test]
async fn buffered_mode_collects_the_same_stream() {
    let (orchestrator, _pool, _client) = setup(
        vec![
            CREATE_OK,
            Scripted::Stream {
                frames: vec![
                    Ok(r#"{"choices":[{"delta":{"content":"deep","phase":"thinking"}}]}"#),
                    Ok(r#"{"choices":[{"delta":{"content":"42","phase":"answer"}}]}"#),
                    Ok(r#"{"choices":[{"delta":{"status":"finished"}}]}"#),
                    Ok("[DONE]"),
                ],
            },
        ],
        1,
    )
    .await;

    let req = request(
        r#"{"model":"qwen-max","messages":[{"role":"user","content":"hi"}],"stream":false}"#,
    );
    let response = orchestrator
        .execute_chat(&req, &ClientAuth::Pool, "req-1")
        .await
        .unwrap();
    let ProxyResponse::Json { status, body } = response else {
        panic!("expected a buffered response");
    };
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["object"], "chat.completion");
    assert_eq!(
        value["choices"][0]["message"]["content"],
        "<think>deep</think>42"
    );
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn models_listing_falls_back_when_upstream_is_empty() {
    let (orchestrator, _pool, _client) = setup(
        vec![Scripted::Json {
            status: 200,
            body: r#"{"data":[]}"#,
        }],
        1,
    )
    .await;
    let list = orchestrator.list_models(&ClientAuth::Pool).await;
    assert!(!list.data.is_empty());
}

#[tokio::test]
async fn models_listing_expands_capabilities() {
    let (orchestrator, _pool, _client) = setup(
        vec![Scripted::Json {
            status: 200,
            body: r#"{"data":[{"id":"qwen-max","info":{"meta":{
                "capabilities":{"thinking":true},"chat_type":["t2t","t2i"]}}}]}"#,
        }],
        1,
    )
    .await;
    let list = orchestrator.list_models(&ClientAuth::Pool).await;
    let ids: Vec<&str> = list.data.iter().map(|m| m.id.as_str()).collect();
    assert!(ids.contains(&"qwen-max"));
    assert!(ids.contains(&"qwen-max-thinking"));
    assert!(ids.contains(&"qwen-max-image"));
    assert!(ids.contains(&"qwen-max-image_edit"));
}
