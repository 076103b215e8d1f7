use std::sync::Arc;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::models::ModelsCache;
use crate::oidc::OidcAuthenticator;
use crate::proxy::ProxyCore;
use crate::ratelimit::KvStore;
use crate::registry::ProviderRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ProviderRegistry>,
    pub models_cache: Arc<ModelsCache>,
    pub proxy: Arc<ProxyCore>,
    pub kv_store: Arc<dyn KvStore>,
    pub authenticator: Option<Arc<OidcAuthenticator>>,
    pub metrics: Metrics,
}
