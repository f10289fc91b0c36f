use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use qproxy_common::{CredentialPair, now_epoch_seconds};

use crate::identity::{Health, Identity};

/// Exchanges a browser cookie for a fresh bearer token. The HTTP transaction
/// lives outside the pool; this is the seam it is injected through.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, cookie: &str) -> Result<String, ExchangeError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("identity has no cookie to exchange")]
    NoCookie,
    #[error("token exchange failed: {0}")]
    Failed(String),
}

/// How an upstream failure presented. Strong auth signals quarantine the
/// identity immediately; everything else counts toward the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// Upstream said the token itself is invalid (401/403 or an explicit
    /// invalid-token body).
    Auth,
    Status(u16),
    Transport,
}

impl FailureSignal {
    pub fn is_strong_auth(&self) -> bool {
        matches!(self, FailureSignal::Auth | FailureSignal::Status(401 | 403))
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub degrade_threshold: u32,
    pub quarantine_threshold: u32,
    /// Quarantined identities re-enter selection (as degraded) after this
    /// long without a successful refresh.
    pub quarantine_cooldown_secs: i64,
    /// Tokens expiring within this window are refreshed proactively.
    pub refresh_warning_window_secs: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            degrade_threshold: 1,
            quarantine_threshold: 3,
            quarantine_cooldown_secs: 30 * 60,
            refresh_warning_window_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub quarantined: usize,
    pub needs_refresh: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityStatus {
    pub id: String,
    pub health: Health,
    pub consecutive_failures: u32,
    pub refresh_failures: u32,
    pub token_expires_in: Option<i64>,
    pub last_success: Option<i64>,
    pub last_failure: Option<i64>,
    pub needs_refresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub id: String,
    pub refreshed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PoolInner {
    identities: Vec<Identity>,
    cursor: usize,
    initialized: bool,
}

/// Shared registry of upstream identities. A single mutex guards the vector
/// and the selection cursor; it is never held across I/O.
pub struct IdentityPool {
    inner: Mutex<PoolInner>,
    config: PoolConfig,
}

impl IdentityPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                identities: Vec::new(),
                cursor: 0,
                initialized: false,
            }),
            config,
        }
    }

    // Identity state stays consistent even if a holder panicked mid-update.
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loads credential pairs, exchanging cookies for tokens where the token
    /// is missing or already expired. Safe to call once at startup; later
    /// calls are no-ops.
    pub async fn initialize(&self, pairs: &[CredentialPair], exchanger: &dyn TokenExchanger) {
        {
            let inner = self.lock();
            if inner.initialized {
                return;
            }
        }

        let mut identities = Vec::with_capacity(pairs.len());
        for (index, pair) in pairs.iter().enumerate() {
            let mut identity = Identity::new(
                format!("identity-{}", index + 1),
                pair.token.clone(),
                pair.cookie.clone(),
            );
            if identity.token_expired() {
                match self.exchange_for(&identity, exchanger).await {
                    Ok(token) => {
                        identity.token = token;
                        identity.last_refresh = Some(now_epoch_seconds());
                        info!(event = "identity_admitted", id = %identity.id, refreshed = true);
                    }
                    Err(err) => {
                        identity.health = Health::Quarantined;
                        identity.quarantined_at = Some(now_epoch_seconds());
                        identity.needs_refresh = true;
                        warn!(event = "identity_admit_failed", id = %identity.id, error = %err);
                    }
                }
            }
            identities.push(identity);
        }

        let mut inner = self.lock();
        if inner.initialized {
            return;
        }
        inner.identities = identities;
        inner.initialized = true;
    }

    /// Round-robin selection over non-quarantined identities, healthy before
    /// degraded. Never blocks; `None` means the request must fail upstream-
    /// unavailable. There is no exclusive lease: concurrent callers may
    /// share an identity when few are selectable.
    pub fn acquire(&self) -> Option<Identity> {
        let mut inner = self.lock();
        let len = inner.identities.len();
        if len == 0 {
            return None;
        }
        let now = now_epoch_seconds();

        // Quarantine cool-down: eligible again, but only at degraded
        // priority until a success or refresh clears it.
        let cooldown = self.config.quarantine_cooldown_secs;
        for identity in &mut inner.identities {
            if identity.health == Health::Quarantined
                && let Some(at) = identity.quarantined_at
                && now - at >= cooldown
            {
                identity.health = Health::Degraded;
                identity.quarantined_at = None;
            }
        }

        for wanted in [Health::Healthy, Health::Degraded] {
            for offset in 0..len {
                let index = (inner.cursor + offset) % len;
                if inner.identities[index].health == wanted {
                    inner.cursor = (index + 1) % len;
                    return Some(inner.identities[index].clone());
                }
            }
        }
        None
    }

    pub fn mark_success(&self, id: &str) {
        let mut inner = self.lock();
        if let Some(identity) = inner.identities.iter_mut().find(|i| i.id == id) {
            identity.consecutive_failures = 0;
            identity.health = Health::Healthy;
            identity.quarantined_at = None;
            identity.last_success = Some(now_epoch_seconds());
        }
    }

    pub fn mark_failure(&self, id: &str, signal: FailureSignal) {
        let mut inner = self.lock();
        let degrade = self.config.degrade_threshold;
        let quarantine = self.config.quarantine_threshold;
        if let Some(identity) = inner.identities.iter_mut().find(|i| i.id == id) {
            let now = now_epoch_seconds();
            identity.consecutive_failures += 1;
            identity.last_failure = Some(now);

            if signal.is_strong_auth() {
                identity.health = Health::Quarantined;
                identity.quarantined_at = Some(now);
                identity.needs_refresh = true;
                warn!(event = "identity_quarantined", id = %identity.id, reason = "auth");
                return;
            }

            if identity.consecutive_failures >= quarantine {
                if identity.health != Health::Quarantined {
                    identity.quarantined_at = Some(now);
                }
                identity.health = Health::Quarantined;
                warn!(
                    event = "identity_quarantined",
                    id = %identity.id,
                    failures = identity.consecutive_failures
                );
            } else if identity.consecutive_failures >= degrade {
                if identity.health == Health::Healthy {
                    identity.health = Health::Degraded;
                }
                debug!(
                    event = "identity_degraded",
                    id = %identity.id,
                    failures = identity.consecutive_failures
                );
            }
        }
    }

    /// True when some non-quarantined identity other than `exclude` exists,
    /// which is what makes a failover attempt worthwhile.
    pub fn has_alternative(&self, exclude: &str) -> bool {
        let inner = self.lock();
        inner
            .identities
            .iter()
            .any(|i| i.id != exclude && i.health != Health::Quarantined)
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.lock();
        let mut status = PoolStatus {
            total: inner.identities.len(),
            ..Default::default()
        };
        for identity in &inner.identities {
            match identity.health {
                Health::Healthy => status.healthy += 1,
                Health::Degraded => status.degraded += 1,
                Health::Quarantined => status.quarantined += 1,
            }
            if identity.needs_refresh {
                status.needs_refresh += 1;
            }
        }
        status
    }

    pub fn identity_statuses(&self) -> Vec<IdentityStatus> {
        let inner = self.lock();
        inner
            .identities
            .iter()
            .map(|identity| IdentityStatus {
                id: identity.id.clone(),
                health: identity.health,
                consecutive_failures: identity.consecutive_failures,
                refresh_failures: identity.refresh_failures,
                token_expires_in: identity.token_remaining(),
                last_success: identity.last_success,
                last_failure: identity.last_failure,
                needs_refresh: identity.needs_refresh,
            })
            .collect()
    }

    /// Refreshes identities whose token is expired, expiring within the
    /// warning window, or flagged by a strong auth failure. With `force`,
    /// every identity is attempted. Exchanges run without the pool lock;
    /// only the per-identity state updates take it.
    pub async fn refresh_expired(
        &self,
        exchanger: &dyn TokenExchanger,
        force: bool,
    ) -> Vec<RefreshOutcome> {
        let window = self.config.refresh_warning_window_secs;
        let candidates: Vec<Identity> = {
            let inner = self.lock();
            inner
                .identities
                .iter()
                .filter(|i| force || i.needs_refresh || i.expires_within(window))
                .cloned()
                .collect()
        };

        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.exchange_for(&candidate, exchanger).await {
                Ok(token) => {
                    let mut inner = self.lock();
                    if let Some(identity) =
                        inner.identities.iter_mut().find(|i| i.id == candidate.id)
                    {
                        identity.token = token;
                        identity.last_refresh = Some(now_epoch_seconds());
                        identity.needs_refresh = false;
                        identity.consecutive_failures = 0;
                        identity.health = Health::Healthy;
                        identity.quarantined_at = None;
                    }
                    info!(event = "identity_refreshed", id = %candidate.id);
                    outcomes.push(RefreshOutcome {
                        id: candidate.id,
                        refreshed: true,
                        error: None,
                    });
                }
                Err(err) => {
                    let mut inner = self.lock();
                    if let Some(identity) =
                        inner.identities.iter_mut().find(|i| i.id == candidate.id)
                    {
                        identity.refresh_failures += 1;
                    }
                    warn!(event = "identity_refresh_failed", id = %candidate.id, error = %err);
                    outcomes.push(RefreshOutcome {
                        id: candidate.id,
                        refreshed: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        outcomes
    }

    async fn exchange_for(
        &self,
        identity: &Identity,
        exchanger: &dyn TokenExchanger,
    ) -> Result<String, ExchangeError> {
        if identity.cookie.is_empty() {
            return Err(ExchangeError::NoCookie);
        }
        exchanger.exchange(&identity.cookie).await
    }
}
