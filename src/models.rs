use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// A model as exposed by the gateway. The `id` carries the provider
/// namespace: `"<provider>/<upstream_id>"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub provider: String,
}

/// A model entry as returned by a provider's `/v1/models` endpoint,
/// before namespacing.
#[derive(Debug, Deserialize)]
pub struct ProviderModel {
    pub id: String,
    #[serde(default = "default_model_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
}

#[derive(Debug, Deserialize)]
pub struct ProviderModelsList {
    pub data: Vec<ProviderModel>,
}

#[derive(Debug, Serialize)]
pub struct ModelsListResponse {
    pub object: String,
    pub data: Vec<Model>,
}

fn default_model_object() -> String {
    "model".to_string()
}

/// Aggregated model lists keyed by provider. Writers replace a provider's
/// whole slice; readers take a snapshot of the union.
#[derive(Default)]
pub struct ModelsCache {
    inner: RwLock<HashMap<String, Vec<Model>>>,
}

impl ModelsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_models(&self, provider: &str, models: Vec<Model>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(provider.to_string(), models);
    }

    pub fn get_all(&self) -> Vec<Model> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.values().flat_map(|models| models.iter().cloned()).collect()
    }

    pub fn find(&self, id: &str) -> Option<Model> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .values()
            .flat_map(|models| models.iter())
            .find(|model| model.id == id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(provider: &str, name: &str) -> Model {
        Model {
            id: format!("{}/{}", provider, name),
            object: "model".to_string(),
            created: 1_700_000_000,
            owned_by: provider.to_string(),
            provider: provider.to_string(),
        }
    }

    #[test]
    fn set_models_replaces_whole_provider_slice() {
        let cache = ModelsCache::new();
        cache.set_models("openai", vec![model("openai", "gpt-4o"), model("openai", "gpt-4o-mini")]);
        cache.set_models("openai", vec![model("openai", "gpt-5")]);

        let all = cache.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "openai/gpt-5");
    }

    #[test]
    fn get_all_flattens_across_providers() {
        let cache = ModelsCache::new();
        cache.set_models("openai", vec![model("openai", "gpt-4o")]);
        cache.set_models("anthropic", vec![model("anthropic", "claude-sonnet")]);

        let mut ids: Vec<String> = cache.get_all().into_iter().map(|m| m.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["anthropic/claude-sonnet", "openai/gpt-4o"]);
    }

    #[test]
    fn cached_ids_carry_provider_prefix() {
        let cache = ModelsCache::new();
        cache.set_models("mock", vec![model("mock", "gpt-x")]);
        for m in cache.get_all() {
            assert!(m.id.starts_with(&format!("{}/", m.provider)));
        }
    }

    #[test]
    fn find_returns_matching_model() {
        let cache = ModelsCache::new();
        cache.set_models("openai", vec![model("openai", "gpt-4o")]);

        let found = cache.find("openai/gpt-4o").expect("model");
        assert_eq!(found.provider, "openai");
        assert!(cache.find("openai/other").is_none());
    }
}
