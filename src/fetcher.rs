use reqwest::header::AUTHORIZATION;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::ProviderConfig;
use crate::models::{Model, ModelsCache, ProviderModelsList};
use crate::registry::ProviderRegistry;

/// Periodically refreshes the aggregated models cache with one concurrent
/// fetch per enabled provider. The first refresh runs immediately; a tick
/// does not start until the previous fan-out has drained.
pub struct ModelFetcher {
    registry: Arc<ProviderRegistry>,
    cache: Arc<ModelsCache>,
    period: Duration,
}

impl ModelFetcher {
    pub fn new(registry: Arc<ProviderRegistry>, cache: Arc<ModelsCache>, period: Duration) -> Self {
        Self {
            registry,
            cache,
            period,
        }
    }

    pub fn start(self) -> FetcherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.refresh_all().await,
                    _ = shutdown_rx.changed() => {
                        info!("model fetcher stopped");
                        return;
                    }
                }
            }
        });
        FetcherHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// One fan-out/join pass over all enabled providers.
    pub async fn refresh_all(&self) {
        let mut tasks = JoinSet::new();
        for provider in self.registry.all_enabled() {
            let Some(client) = self.registry.client(&provider.name) else {
                continue;
            };
            let client = client.clone();
            let cache = self.cache.clone();
            tasks.spawn(async move {
                fetch_provider_models(&client, &provider, &cache).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

/// Stops the refresh loop; an in-flight fan-out drains first.
pub struct FetcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FetcherHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn fetch_provider_models(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    cache: &ModelsCache,
) {
    let url = format!("{}/v1/models", provider.target_url.trim_end_matches('/'));
    let mut request = client.get(&url);
    if !provider.api_key.is_empty() {
        request = request.header(AUTHORIZATION, format!("Bearer {}", provider.api_key));
    }

    // Any failure leaves the previously cached list for this provider
    // untouched.
    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(provider = %provider.name, error = %err, "model fetch failed");
            return;
        }
    };
    if !response.status().is_success() {
        warn!(
            provider = %provider.name,
            status = %response.status(),
            "model fetch returned non-success status"
        );
        return;
    }

    let list: ProviderModelsList = match response.json().await {
        Ok(list) => list,
        Err(err) => {
            warn!(provider = %provider.name, error = %err, "invalid models response");
            return;
        }
    };

    let models: Vec<Model> = list
        .data
        .into_iter()
        .map(|m| Model {
            id: format!("{}/{}", provider.name, m.id),
            object: m.object,
            created: m.created,
            owned_by: m.owned_by,
            provider: provider.name.clone(),
        })
        .collect();

    info!(provider = %provider.name, count = models.len(), "updated provider models");
    cache.set_models(&provider.name, models);
}
