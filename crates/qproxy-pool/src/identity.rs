use serde::Serialize;

use qproxy_common::now_epoch_seconds;

use crate::jwt::token_expiry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Quarantined,
}

/// A (token, cookie) credential pair impersonating one logged-in upstream
/// session, plus the health metadata driving selection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub token: String,
    pub cookie: String,
    pub health: Health,
    pub consecutive_failures: u32,
    pub refresh_failures: u32,
    pub last_success: Option<i64>,
    pub last_failure: Option<i64>,
    pub last_refresh: Option<i64>,
    pub quarantined_at: Option<i64>,
    /// Set by a strong auth failure; cleared by a successful refresh.
    pub needs_refresh: bool,
}

impl Identity {
    pub fn new(id: String, token: String, cookie: String) -> Self {
        Self {
            id,
            token,
            cookie,
            health: Health::Healthy,
            consecutive_failures: 0,
            refresh_failures: 0,
            last_success: None,
            last_failure: None,
            last_refresh: None,
            quarantined_at: None,
            needs_refresh: false,
        }
    }

    pub fn token_expiry(&self) -> Option<i64> {
        token_expiry(&self.token)
    }

    /// Expired with a 60s safety margin, mirroring how the upstream rejects
    /// tokens slightly before their nominal deadline.
    pub fn token_expired(&self) -> bool {
        match self.token_expiry() {
            Some(exp) => now_epoch_seconds() >= exp.saturating_sub(60),
            None => self.token.is_empty(),
        }
    }

    /// Remaining token lifetime in seconds; `None` for non-expiring tokens.
    pub fn token_remaining(&self) -> Option<i64> {
        self.token_expiry()
            .map(|exp| exp.saturating_sub(now_epoch_seconds()))
    }

    pub fn expires_within(&self, window_secs: i64) -> bool {
        match self.token_remaining() {
            Some(remaining) => remaining <= window_secs,
            None => self.token.is_empty(),
        }
    }
}
