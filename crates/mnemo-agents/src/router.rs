use std::collections::HashMap;
use std::sync::Arc;

use mnemo_common::{Error, Result};
use tracing::{info, warn};

use crate::providers::{GenerationRequest, ModelInfo, ModelProvider};

/// Ordered fallback chain over model providers.
///
/// The first provider is primary; on a retriable remote-API failure the next
/// one is tried. Success returns the text together with the name of the
/// model that served it so callers can log which backend answered.
pub struct ModelRouter {
    providers: Vec<Arc<dyn ModelProvider>>,
}

impl ModelRouter {
    pub fn new(providers: Vec<Arc<dyn ModelProvider>>) -> Self {
        Self { providers }
    }

    pub fn primary_name(&self) -> Option<String> {
        self.providers.first().map(|p| p.info().name)
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
        use_fallbacks: bool,
    ) -> Result<(String, String)> {
        if self.providers.is_empty() {
            return Err(Error::provider("router", "no model providers configured"));
        }

        let mut last_error = None;
        for provider in &self.providers {
            let name = provider.info().name;
            match provider.generate(request).await {
                Ok(text) => return Ok((text, name)),
                Err(e) if use_fallbacks && e.is_provider_fallback() => {
                    warn!("model {name} failed, trying next provider: {e}");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::provider("router", "all model providers failed")))
    }

    /// Names of the providers that currently answer an availability probe.
    pub async fn available_models(&self) -> Vec<String> {
        let probes = self.providers.iter().map(|provider| async move {
            (provider.info().name, provider.is_available().await)
        });
        futures::future::join_all(probes)
            .await
            .into_iter()
            .filter_map(|(name, up)| up.then_some(name))
            .collect()
    }

    pub fn model_info(&self, name: &str) -> Option<ModelInfo> {
        self.providers
            .iter()
            .map(|p| p.info())
            .find(|info| info.name == name)
    }

    /// Sweep every provider's response cache; returns removed-entry counts
    /// keyed by model name.
    pub fn clear_all_caches(&self) -> HashMap<String, usize> {
        let mut cleared = HashMap::new();
        for provider in &self.providers {
            let info = provider.info();
            let count = provider.clear_cache(None);
            if count > 0 {
                info!("cleared {count} cached responses for {}", info.name);
            }
            cleared.insert(info.name, count);
        }
        cleared
    }
}
