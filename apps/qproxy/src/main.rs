use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qproxy_common::{AuthMode, CredentialPair, GlobalConfigPatch};
use qproxy_core::AppState;
use qproxy_core::scheduler;
use qproxy_core::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Parser)]
#[command(
    name = "qproxy",
    version,
    about = "OpenAI-compatible proxy for the Qwen web chat"
)]
struct CliArgs {
    /// Bind host.
    #[arg(long, env = "QPROXY_HOST")]
    host: Option<String>,

    /// Bind port.
    #[arg(long, env = "QPROXY_PORT")]
    port: Option<u16>,

    /// Upstream base url.
    #[arg(long, env = "QPROXY_BASE_URL")]
    base_url: Option<String>,

    /// Downstream api key; omit to disable the key check.
    #[arg(long, env = "QPROXY_API_KEY")]
    api_key: Option<String>,

    /// "server" (pooled credentials) or "client" (per-request tuple).
    #[arg(long, env = "QPROXY_AUTH_MODE")]
    auth_mode: Option<String>,

    /// Upstream credential `token[:cookie]`; repeatable.
    #[arg(long = "credential", env = "QPROXY_CREDENTIALS", value_delimiter = '|')]
    credentials: Vec<String>,

    /// Model substituted when image content hits a non-vision model.
    #[arg(long, env = "QPROXY_VISION_FALLBACK_MODEL")]
    vision_fallback_model: Option<String>,

    /// Disable the vision fallback entirely.
    #[arg(long, env = "QPROXY_DISABLE_VISION_FALLBACK")]
    disable_vision_fallback: bool,

    /// Token refresh period in hours.
    #[arg(long, env = "QPROXY_REFRESH_INTERVAL_HOURS")]
    refresh_interval_hours: Option<u64>,
}

impl CliArgs {
    fn into_patch(self) -> anyhow::Result<GlobalConfigPatch> {
        let auth_mode = match self.auth_mode.as_deref() {
            Some(value) => Some(
                AuthMode::parse(value)
                    .with_context(|| format!("unknown auth mode: {value}"))?,
            ),
            None => None,
        };
        let credentials = if self.credentials.is_empty() {
            None
        } else {
            Some(
                self.credentials
                    .iter()
                    .map(|entry| CredentialPair::parse(entry))
                    .collect::<Result<Vec<_>, _>>()
                    .context("parse credentials")?,
            )
        };
        Ok(GlobalConfigPatch {
            host: self.host,
            port: self.port,
            base_url: self.base_url,
            api_key: self.api_key,
            auth_mode,
            credentials,
            vision_fallback_model: self.vision_fallback_model,
            disable_vision_fallback: if self.disable_vision_fallback {
                Some(true)
            } else {
                None
            },
            refresh_interval_hours: self.refresh_interval_hours,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = args
        .into_patch()?
        .into_config()
        .context("finalize config")?;

    let client = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::default())
            .context("build upstream client")?,
    );
    let state = Arc::new(AppState::new(config, client));
    state.initialize_pool().await;

    let pool_status = state.pool.status();
    info!(
        event = "startup",
        identities = pool_status.total,
        healthy = pool_status.healthy,
        quarantined = pool_status.quarantined
    );

    scheduler::spawn_token_refresh(state.clone());
    scheduler::spawn_chat_cleanup(state.clone());

    let app = qproxy_router::router(state.clone());
    let config = state.config.load();
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "listening", addr = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
