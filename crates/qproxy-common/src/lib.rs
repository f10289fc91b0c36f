use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid credential entry: {0}")]
    InvalidCredential(String),
}

/// Downstream authentication mode.
///
/// In `Server` mode the proxy owns the upstream credentials and optionally
/// checks a configured api key. In `Client` mode every request carries its
/// own `api_key;token;cookie` tuple in the bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Server,
    Client,
}

impl AuthMode {
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("server") {
            Some(AuthMode::Server)
        } else if value.eq_ignore_ascii_case("client") {
            Some(AuthMode::Client)
        } else {
            None
        }
    }
}

/// One upstream login: a bearer token plus the browser cookie string it was
/// minted for. The cookie may be empty (token-only credentials cannot be
/// refreshed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub token: String,
    #[serde(default)]
    pub cookie: String,
}

impl CredentialPair {
    /// Parses a `token[:cookie]` entry. The first `:` separates token from
    /// cookie; JWTs never contain `:`, cookies may.
    pub fn parse(entry: &str) -> Result<Self, GlobalConfigError> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(GlobalConfigError::InvalidCredential(
                "empty entry".to_string(),
            ));
        }
        match entry.split_once(':') {
            Some((token, cookie)) => Ok(Self {
                token: token.trim().to_string(),
                cookie: cookie.trim().to_string(),
            }),
            None => Ok(Self {
                token: entry.to_string(),
                cookie: String::new(),
            }),
        }
    }

    /// Parses a `|`-separated list of `token[:cookie]` entries.
    pub fn parse_list(value: &str) -> Result<Vec<Self>, GlobalConfigError> {
        value
            .split('|')
            .filter(|entry| !entry.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Upstream base url, no trailing slash.
    pub base_url: String,
    /// Optional downstream api key. `None` disables the key check in server
    /// mode and shortens the client-mode bearer tuple.
    pub api_key: Option<String>,
    pub auth_mode: AuthMode,
    /// Upstream credentials loaded into the identity pool at startup.
    pub credentials: Vec<CredentialPair>,
    /// Model substituted when image content hits a non-vision model.
    pub vision_fallback_model: Option<String>,
    pub disable_vision_fallback: bool,
    /// Token refresh scheduler period.
    pub refresh_interval_hours: u64,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub auth_mode: Option<AuthMode>,
    pub credentials: Option<Vec<CredentialPair>>,
    pub vision_fallback_model: Option<String>,
    pub disable_vision_fallback: Option<bool>,
    pub refresh_interval_hours: Option<u64>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.base_url.is_some() {
            self.base_url = other.base_url;
        }
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.auth_mode.is_some() {
            self.auth_mode = other.auth_mode;
        }
        if other.credentials.is_some() {
            self.credentials = other.credentials;
        }
        if other.vision_fallback_model.is_some() {
            self.vision_fallback_model = other.vision_fallback_model;
        }
        if other.disable_vision_fallback.is_some() {
            self.disable_vision_fallback = other.disable_vision_fallback;
        }
        if other.refresh_interval_hours.is_some() {
            self.refresh_interval_hours = other.refresh_interval_hours;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3000),
            base_url: self
                .base_url
                .unwrap_or_else(|| "https://chat.qwen.ai".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: self.api_key.filter(|key| !key.is_empty()),
            auth_mode: self.auth_mode.unwrap_or(AuthMode::Server),
            credentials: self.credentials.unwrap_or_default(),
            vision_fallback_model: self
                .vision_fallback_model
                .filter(|model| !model.is_empty()),
            disable_vision_fallback: self.disable_vision_fallback.unwrap_or(false),
            refresh_interval_hours: self.refresh_interval_hours.unwrap_or(24),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            base_url: Some(value.base_url),
            api_key: value.api_key,
            auth_mode: Some(value.auth_mode),
            credentials: Some(value.credentials),
            vision_fallback_model: value.vision_fallback_model,
            disable_vision_fallback: Some(value.disable_vision_fallback),
            refresh_interval_hours: Some(value.refresh_interval_hours),
        }
    }
}

pub fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

pub fn now_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}
