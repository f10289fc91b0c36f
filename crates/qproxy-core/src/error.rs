use http::StatusCode;

use qproxy_translate::TranslateError;

/// Request-level error taxonomy. Retryability is a property of the variant,
/// not of the message; the HTTP mapping lives in `status_code`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid api key or credentials")]
    AuthInvalid,
    #[error("no upstream identity available")]
    UpstreamUnavailable,
    #[error("upstream create-chat returned no id: {0}")]
    CreateChatFailed(String),
    #[error("upstream returned status {status}")]
    Upstream { status: u16, body: String },
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("translation produced an inconsistent request: {0}")]
    Translation(String),
}

impl ProxyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::AuthRequired => "auth_required",
            ProxyError::AuthInvalid => "auth_invalid",
            ProxyError::UpstreamUnavailable => "upstream_unavailable",
            ProxyError::CreateChatFailed(_) => "upstream_create_chat_failed",
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::Transport(_) => "upstream_error",
            ProxyError::Translation(_) => "translation_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::AuthRequired | ProxyError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ProxyError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::CreateChatFailed(_) | ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream { status, .. } => {
                // Mirror the upstream status when it is a meaningful error
                // code, otherwise cap at 502.
                StatusCode::from_u16(*status)
                    .ok()
                    .filter(|code| code.is_client_error() || code.is_server_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Translation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a different identity is worth trying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::Upstream { .. }
                | ProxyError::Transport(_)
                | ProxyError::CreateChatFailed(_)
        )
    }

    pub fn body_json(&self, request_id: &str) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind(),
            "details": self.to_string(),
            "requestId": request_id,
        })
    }
}

impl From<TranslateError> for ProxyError {
    fn from(err: TranslateError) -> Self {
        match err {
            TranslateError::EmptyMessages | TranslateError::NoUserMessage => {
                ProxyError::BadRequest(err.to_string())
            }
            TranslateError::Invalid(reason) => ProxyError::Translation(reason.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_is_mirrored_but_capped() {
        let known = ProxyError::Upstream {
            status: 429,
            body: String::new(),
        };
        assert_eq!(known.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let weird = ProxyError::Upstream {
            status: 200,
            body: String::new(),
        };
        assert_eq!(weird.status_code(), StatusCode::BAD_GATEWAY);

        let garbage = ProxyError::Upstream {
            status: 999,
            body: String::new(),
        };
        assert_eq!(garbage.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn retryability_follows_the_variant() {
        assert!(ProxyError::Transport("reset".into()).is_retryable());
        assert!(ProxyError::CreateChatFailed("{}".into()).is_retryable());
        assert!(!ProxyError::BadRequest("empty".into()).is_retryable());
        assert!(!ProxyError::Translation("fid".into()).is_retryable());
    }

    #[test]
    fn body_carries_kind_details_and_request_id() {
        let body = ProxyError::UpstreamUnavailable.body_json("req-1");
        assert_eq!(body["error"], "upstream_unavailable");
        assert_eq!(body["requestId"], "req-1");
        assert!(body["details"].as_str().unwrap().contains("identity"));
    }
}
