use http::HeaderMap;

use qproxy_common::{AuthMode, GlobalConfig};

use crate::error::ProxyError;

/// Where the upstream credentials for a request come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuth {
    /// Server mode: identities come from the pool.
    Pool,
    /// Client mode: the request carried its own token and cookie.
    Direct { token: String, cookie: String },
}

/// Authenticates a downstream request.
///
/// Server mode checks the configured api key against the bearer, the
/// `X-API-Key` header, an `api_key`/`key` query param, or the body field.
/// Client mode expects a semicolon tuple in the bearer: `api_key;token;cookie`
/// (the api_key segment is absent when no server key is configured).
pub fn authenticate(
    config: &GlobalConfig,
    headers: &HeaderMap,
    query: Option<&str>,
    body_api_key: Option<&str>,
) -> Result<ClientAuth, ProxyError> {
    match config.auth_mode {
        AuthMode::Server => {
            let Some(expected) = config.api_key.as_deref() else {
                return Ok(ClientAuth::Pool);
            };
            let presented = bearer_token(headers)
                .or_else(|| header_value(headers, "x-api-key"))
                .or_else(|| query_api_key(query))
                .or_else(|| body_api_key.map(str::to_string));
            match presented {
                None => Err(ProxyError::AuthRequired),
                Some(key) if key == expected => Ok(ClientAuth::Pool),
                Some(_) => Err(ProxyError::AuthInvalid),
            }
        }
        AuthMode::Client => {
            let bearer = bearer_token(headers).ok_or(ProxyError::AuthRequired)?;
            parse_client_tuple(&bearer, config.api_key.as_deref())
        }
    }
}

fn parse_client_tuple(bearer: &str, expected_key: Option<&str>) -> Result<ClientAuth, ProxyError> {
    // The cookie is the final segment and may itself contain semicolons, so
    // only split off the leading segments.
    let (token, cookie) = match expected_key {
        Some(expected) => {
            let mut parts = bearer.splitn(3, ';');
            let key = parts.next().unwrap_or_default();
            if key != expected {
                return Err(ProxyError::AuthInvalid);
            }
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        }
        None => {
            let mut parts = bearer.splitn(2, ';');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        }
    };

    if token.is_empty() {
        return Err(ProxyError::AuthInvalid);
    }
    Ok(ClientAuth::Direct {
        token,
        cookie: cookie.trim().to_string(),
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

fn query_api_key(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let (name, value) = pair.split_once('=')?;
        if (name == "api_key" || name == "key") && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}
