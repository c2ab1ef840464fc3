pub mod perplexity;
pub mod serp;
pub mod tavily;

use std::sync::Arc;

use crate::core::config::{ProviderKind, Settings};
use crate::search::SearchProvider;

/// Construct the provider selected by configuration.
pub fn build_provider(settings: &Settings, client: reqwest::Client) -> Arc<dyn SearchProvider> {
    let key = settings.search_provider_key().to_string();
    match settings.search_provider {
        ProviderKind::Serp => Arc::new(serp::SerpProvider::new(client, key)),
        ProviderKind::Tavily => Arc::new(tavily::TavilyProvider::new(client, key)),
        ProviderKind::Perplexity => Arc::new(perplexity::PerplexityProvider::new(client, key)),
    }
}
