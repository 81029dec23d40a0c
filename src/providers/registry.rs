use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;

use super::{
    ProviderAdapter, anthropic::AnthropicAdapter, google::GoogleAdapter, groq::GroqAdapter,
    openai::OpenAiAdapter,
};
use crate::{
    config::Config,
    errors::{ChatError, ChatResult},
    models::Provider,
};

/// Maps a provider tag to its streaming adapter.
///
/// Selection happens by tag lookup rather than branching in the dispatcher,
/// so adding a provider means registering one more adapter here.
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Build the standard four adapters from configuration, sharing one
    /// pooled HTTP client.
    pub fn from_config(config: &Config, http_client: Client) -> ChatResult<Self> {
        let endpoints = &config.providers;
        let groq_key = endpoints.groq.api_key.clone().ok_or_else(|| {
            ChatError::Config("providers.groq.api_key is required (service key for free models)".to_string())
        })?;

        let mut registry = Self::empty();
        registry.register(Arc::new(GroqAdapter::new(
            http_client.clone(),
            endpoints.groq.api_base.clone(),
            groq_key,
        )));
        registry.register(Arc::new(OpenAiAdapter::new(
            http_client.clone(),
            endpoints.openai.api_base.clone(),
        )));
        registry.register(Arc::new(AnthropicAdapter::new(
            http_client.clone(),
            endpoints.anthropic.api_base.clone(),
        )));
        registry.register(Arc::new(GoogleAdapter::new(
            http_client,
            endpoints.google.api_base.clone(),
        )));
        Ok(registry)
    }

    /// Registry with no adapters; used by tests that register their own.
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register (or replace) the adapter for its provider tag.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> ChatResult<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned().ok_or_else(|| {
            ChatError::internal(format!("no adapter registered for provider {provider}"))
        })
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.adapters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn from_config_registers_all_four_providers() {
        let mut config = Config::for_tests();
        config.providers.groq.api_key = Some("gsk-test-key".to_string());
        let registry = AdapterRegistry::from_config(&config, Client::new()).unwrap();
        for provider in Provider::ALL {
            assert!(registry.get(provider).is_ok(), "missing {provider}");
        }
    }

    #[test]
    fn missing_groq_service_key_is_a_config_error() {
        let mut config = Config::for_tests();
        config.providers.groq.api_key = None;
        let err = AdapterRegistry::from_config(&config, Client::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn unregistered_provider_is_an_internal_error() {
        let registry = AdapterRegistry::empty();
        let err = registry.get(Provider::Groq).err().unwrap();
        assert_eq!(err.kind(), "internal_error");
    }
}
