use std::collections::HashMap;

use crate::config::{ModelConfig, ProviderConfig};

/// Immutable map of enabled providers to their configuration and a
/// timeout-bound outbound HTTP client. Built once at startup.
pub struct ProviderRegistry {
    clients: HashMap<String, reqwest::Client>,
    configs: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new(providers: &[ProviderConfig]) -> Result<Self, String> {
        let mut clients = HashMap::new();
        let mut configs = HashMap::new();

        for provider in providers {
            if !provider.enabled {
                continue;
            }
            let client = reqwest::Client::builder()
                .timeout(provider.timeout())
                .build()
                .map_err(|e| format!("client build error for provider {}: {}", provider.name, e))?;
            clients.insert(provider.name.clone(), client);
            configs.insert(provider.name.clone(), provider.clone());
        }

        Ok(Self { clients, configs })
    }

    pub fn client(&self, name: &str) -> Option<&reqwest::Client> {
        self.clients.get(name)
    }

    pub fn config(&self, name: &str) -> Option<&ProviderConfig> {
        self.configs.get(name)
    }

    pub fn all_enabled(&self) -> Vec<ProviderConfig> {
        self.configs.values().cloned().collect()
    }

    /// Looks a model up by its configured (namespaced) name across all
    /// enabled providers.
    pub fn find_model(&self, model_name: &str) -> Option<&ModelConfig> {
        self.configs
            .values()
            .flat_map(|provider| provider.models.iter())
            .find(|model| model.name == model_name)
    }
}
