use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, interval_at};
use tracing::{info, warn};

use crate::state::AppState;

const CLEANUP_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Periodic cookie→token refresh for identities that are expired, expiring
/// within the warning window, or flagged by an auth failure. Detached and
/// best-effort; iteration errors never kill the loop.
pub fn spawn_token_refresh(state: Arc<AppState>) {
    tokio::spawn(async move {
        let hours = state.config.load().refresh_interval_hours.max(1);
        let period = Duration::from_secs(hours * 3600);
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let outcomes = state
                .pool
                .refresh_expired(state.exchanger.as_ref(), false)
                .await;
            let refreshed = outcomes.iter().filter(|o| o.refreshed).count();
            info!(
                event = "token_refresh_cycle",
                attempted = outcomes.len(),
                refreshed,
                failed = outcomes.len() - refreshed
            );
        }
    });
}

/// Hourly deletion of stale upstream chats, skipped when the pool has no
/// healthy identity.
pub fn spawn_chat_cleanup(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + CLEANUP_PERIOD, CLEANUP_PERIOD);
        loop {
            ticker.tick().await;
            match state.orchestrator.cleanup_chats().await {
                Ok(deleted) => info!(event = "chat_cleanup_cycle", deleted),
                Err(err) => warn!(event = "chat_cleanup_failed", error = %err),
            }
        }
    });
}
