//! Shared application state: the validated settings plus every constructed
//! collaborator. Built once at startup and shared read-only across stages.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::Settings;
use crate::core::error::{PipelineError, PipelineResult};
use crate::llm::embedding::{Embedder, HttpEmbedder};
use crate::llm::gateway::{HttpLlmTransport, LlmGateway, LlmTransport};
use crate::nlp::rerank::Reranker;
use crate::scraping::{HttpPageFetcher, PageFetcher, Scraper};
use crate::search::providers::build_provider;
use crate::search::{SearchProvider, SearchService};
use crate::store::VectorStore;

pub struct AppState {
    pub settings: Settings,
    pub http_client: reqwest::Client,
    pub gateway: Arc<LlmGateway>,
    pub embedder: Arc<dyn Embedder>,
    pub search: SearchService,
    pub scraper: Scraper,
    pub reranker: Reranker,
    pub store: VectorStore,
}

impl AppState {
    /// Production wiring from validated settings.
    pub fn new(settings: Settings) -> PipelineResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .connect_timeout(Duration::from_secs(settings.http_connect_timeout_secs))
            .build()
            .map_err(|e| PipelineError::ConfigInvalid(format!("HTTP client: {e}")))?;

        let transport: Arc<dyn LlmTransport> = Arc::new(HttpLlmTransport::new(
            http_client.clone(),
            settings.llm_endpoint.clone(),
            settings.llm_api_key.clone(),
        ));
        let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
            http_client.clone(),
            settings.llm_endpoint.clone(),
            settings.llm_api_key.clone(),
            settings.embedding_model.clone(),
        ));
        let provider = build_provider(&settings, http_client.clone());
        let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpPageFetcher::new(
            http_client.clone(),
            settings.markdown_service_url.clone(),
            settings.scrape_api_url.clone(),
            settings.scrape_api_key.clone(),
        ));
        let store = VectorStore::open(Path::new(&settings.vector_db_path))?;

        Ok(Self::assemble_state(
            settings, http_client, transport, embedder, provider, fetcher, store,
        ))
    }

    /// Wiring with injected seams: used by the scenario tests, same
    /// construction path as production.
    pub fn with_components(
        settings: Settings,
        transport: Arc<dyn LlmTransport>,
        embedder: Arc<dyn Embedder>,
        provider: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        store: VectorStore,
    ) -> Self {
        let http_client = reqwest::Client::new();
        Self::assemble_state(settings, http_client, transport, embedder, provider, fetcher, store)
    }

    fn assemble_state(
        settings: Settings,
        http_client: reqwest::Client,
        transport: Arc<dyn LlmTransport>,
        embedder: Arc<dyn Embedder>,
        provider: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        store: VectorStore,
    ) -> Self {
        let gateway = Arc::new(LlmGateway::new(
            transport,
            settings.llm_max_retries,
            settings.prompt_policy_include,
        ));
        let search = SearchService::new(
            provider,
            settings.exclude_domain_list(),
            settings.search_results_per_query,
        );
        let scraper = Scraper::new(
            fetcher,
            settings.preserve_tables,
            Duration::from_secs(settings.scrape_timeout_secs),
            settings.scrape_parallel,
        );
        let reranker = if settings.use_reranker {
            Reranker::new(
                http_client.clone(),
                settings.reranker_url.clone(),
                settings.reranker_model.clone(),
                settings.reranker_api_key.clone(),
            )
        } else {
            Reranker::disabled(http_client.clone())
        };

        Self {
            settings,
            http_client,
            gateway,
            embedder,
            search,
            scraper,
            reranker,
            store,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("search_provider", &self.settings.search_provider.as_str())
            .field("verify_claims", &self.settings.verify_claims)
            .field("max_iterations", &self.settings.max_iterations)
            .finish()
    }
}
