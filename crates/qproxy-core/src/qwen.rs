use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use qproxy_pool::{ExchangeError, Identity, TokenExchanger};
use qproxy_protocol::qwen::chat::{ChatType, NewChatRequest, NewChatResponse};

use crate::headers::{self, BROWSER_USER_AGENT};
use crate::upstream_client::{HttpMethod, UpstreamClient, UpstreamHttpRequest};

/// Builders for the upstream web-chat operations. Building is separate from
/// sending so the orchestrator (and tests) control dispatch.
#[derive(Debug, Clone)]
pub struct QwenUpstream {
    base_url: String,
}

impl QwenUpstream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn create_chat(
        &self,
        identity: &Identity,
        model: &str,
        chat_type: ChatType,
        timestamp_ms: i64,
    ) -> UpstreamHttpRequest {
        let body = NewChatRequest::new(model, chat_type, timestamp_ms);
        let payload = serde_json::to_vec(&body).unwrap_or_default();
        UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}/api/v2/chats/new", self.base_url),
            headers: self.headers_for(identity),
            body: Some(Bytes::from(payload)),
            is_stream: false,
        }
    }

    /// The completion call; the upstream always answers with SSE, so the
    /// response is read as a stream regardless of the downstream choice.
    pub fn completion(
        &self,
        identity: &Identity,
        chat_id: &str,
        envelope: Bytes,
        fingerprint: bool,
    ) -> UpstreamHttpRequest {
        let mut headers = self.headers_for(identity);
        if fingerprint {
            headers::add_browser_fingerprint(&mut headers, &self.base_url);
        }
        UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!(
                "{}/api/v2/chat/completions?chat_id={chat_id}",
                self.base_url
            ),
            headers,
            body: Some(envelope),
            is_stream: true,
        }
    }

    pub fn list_models(&self, identity: &Identity) -> UpstreamHttpRequest {
        UpstreamHttpRequest {
            method: HttpMethod::Get,
            url: format!("{}/api/models", self.base_url),
            headers: self.headers_for(identity),
            body: None,
            is_stream: false,
        }
    }

    pub fn list_chats(&self, identity: &Identity, page: u32) -> UpstreamHttpRequest {
        UpstreamHttpRequest {
            method: HttpMethod::Get,
            url: format!("{}/api/v2/chats/?page={page}", self.base_url),
            headers: self.headers_for(identity),
            body: None,
            is_stream: false,
        }
    }

    pub fn delete_chat(&self, identity: &Identity, chat_id: &str) -> UpstreamHttpRequest {
        UpstreamHttpRequest {
            method: HttpMethod::Delete,
            url: format!("{}/api/v2/chats/{chat_id}", self.base_url),
            headers: self.headers_for(identity),
            body: None,
            is_stream: false,
        }
    }

    fn headers_for(&self, identity: &Identity) -> crate::headers::Headers {
        headers::chat_headers(
            &identity.token,
            &identity.cookie,
            &Uuid::new_v4().to_string(),
        )
    }
}

/// Extracts `data.id` from a create-chat response body.
pub fn parse_chat_id(body: &Bytes) -> Option<String> {
    let parsed: NewChatResponse = serde_json::from_slice(body).ok()?;
    parsed.data?.id.filter(|id| !id.is_empty())
}

/// Default cookie→token exchange: the session cookie is presented to the
/// auth endpoint, which answers with a refreshed bearer token.
pub struct CookieTokenExchanger {
    client: Arc<dyn UpstreamClient>,
    base_url: String,
}

impl CookieTokenExchanger {
    pub fn new(client: Arc<dyn UpstreamClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TokenExchanger for CookieTokenExchanger {
    async fn exchange(&self, cookie: &str) -> Result<String, ExchangeError> {
        if cookie.is_empty() {
            return Err(ExchangeError::NoCookie);
        }
        let mut req_headers = Vec::new();
        headers::header_set(&mut req_headers, "Cookie", cookie);
        headers::header_set(&mut req_headers, "User-Agent", BROWSER_USER_AGENT);
        headers::header_set(&mut req_headers, "accept", "application/json");
        headers::header_set(&mut req_headers, "source", "web");

        let request = UpstreamHttpRequest {
            method: HttpMethod::Get,
            url: format!("{}/api/v1/auths/", self.base_url),
            headers: req_headers,
            body: None,
            is_stream: false,
        };

        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| ExchangeError::Failed(err.to_string()))?;
        let status = response.status;
        let body = response.into_bytes().await;
        if !(200..300).contains(&status) {
            return Err(ExchangeError::Failed(format!(
                "auth endpoint returned {status}"
            )));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| ExchangeError::Failed(format!("auth body not json: {err}")))?;
        parsed
            .get("token")
            .or_else(|| parsed.pointer("/data/token"))
            .and_then(|token| token.as_str())
            .filter(|token| !token.is_empty())
            .map(|token| token.to_string())
            .ok_or_else(|| ExchangeError::Failed("auth body carried no token".to_string()))
    }
}
