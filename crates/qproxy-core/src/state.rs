use std::sync::Arc;

use arc_swap::ArcSwap;

use qproxy_common::GlobalConfig;
use qproxy_pool::{IdentityPool, PoolConfig, TokenExchanger};

use crate::execute::Orchestrator;
use crate::qwen::{CookieTokenExchanger, QwenUpstream};
use crate::upstream_client::UpstreamClient;

/// Everything the handlers and schedulers share.
pub struct AppState {
    pub config: Arc<ArcSwap<GlobalConfig>>,
    pub pool: Arc<IdentityPool>,
    pub exchanger: Arc<dyn TokenExchanger>,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(config: GlobalConfig, client: Arc<dyn UpstreamClient>) -> Self {
        let base_url = config.base_url.clone();
        let config = Arc::new(ArcSwap::from_pointee(config));
        let pool = Arc::new(IdentityPool::new(PoolConfig::default()));
        let exchanger: Arc<dyn TokenExchanger> =
            Arc::new(CookieTokenExchanger::new(client.clone(), base_url.clone()));
        let orchestrator = Orchestrator::new(
            client,
            pool.clone(),
            QwenUpstream::new(base_url),
            config.clone(),
        );
        Self {
            config,
            pool,
            exchanger,
            orchestrator,
        }
    }

    /// Loads the configured credentials into the pool, exchanging cookies
    /// for missing tokens. Call once at startup, before serving.
    pub async fn initialize_pool(&self) {
        let credentials = self.config.load().credentials.clone();
        self.pool
            .initialize(&credentials, self.exchanger.as_ref())
            .await;
    }
}
