use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use super::error::{PipelineError, PipelineResult};

// ---------------------------------------------------------------------------
// Settings: file-based options record (dossier.json) with env-var fallback
// ---------------------------------------------------------------------------

/// Which search vendor backs C4 for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Serp,
    Tavily,
    Perplexity,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serp => "serp",
            Self::Tavily => "tavily",
            Self::Perplexity => "perplexity",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serp" => Some(Self::Serp),
            "tavily" => Some(Self::Tavily),
            "perplexity" => Some(Self::Perplexity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Text,
}

/// The full options record. Every field resolves file → env var → default;
/// the env var name is the field name uppercased (`llm_api_key` →
/// `LLM_API_KEY`). Immutable once validated: stages receive it by reference
/// and never mutate it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    // LLM gateway
    pub llm_api_key: String,
    pub llm_endpoint: String,
    pub default_model: String,
    pub llm_max_retries: u32,
    pub prompt_policy_include: bool,

    // Per-stage model overrides (None = default_model)
    pub intent_model: Option<String>,
    pub planner_model: Option<String>,
    pub context_model: Option<String>,
    pub reflection_model: Option<String>,
    pub report_model: Option<String>,
    pub verify_model: Option<String>,

    // Summarizer model routing (mrs = model routing for summaries)
    pub mrs_default: Option<String>,
    pub mrs_code: Option<String>,
    pub mrs_research: Option<String>,
    pub mrs_news: Option<String>,
    pub mrs_documentation: Option<String>,
    pub mrs_general: Option<String>,

    // Search
    pub search_provider: ProviderKind,
    pub serp_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,
    /// Comma-separated domain exclusion list.
    pub exclude_domains: String,
    pub search_results_per_query: usize,

    // Ranking ratios, both in (0.0, 1.0]
    pub top_k_url: f64,
    pub top_k_sum: f64,

    // Vector store & embeddings
    pub vector_db_path: String,
    pub embedding_model: String,

    // External reranker
    pub use_reranker: bool,
    pub reranker_url: Option<String>,
    pub reranker_model: Option<String>,
    pub reranker_api_key: Option<String>,

    // Verification
    pub verify_claims: bool,
    pub verify_threshold: f32,

    // Iteration & report bounds
    pub max_iterations: usize,
    pub report_max_tokens: u32,

    // Concurrency caps
    pub search_parallel: usize,
    pub scrape_parallel: usize,
    pub summary_parallel: usize,

    // Scraper
    pub output_format: OutputFormat,
    pub preserve_tables: bool,
    pub scrape_timeout_secs: u64,
    /// Fallback-1: JS-capable markdown-extractor service. Unset = tier skipped.
    pub markdown_service_url: Option<String>,
    /// Fallback-2: external scrape API. Unset = tier skipped.
    pub scrape_api_url: Option<String>,
    pub scrape_api_key: Option<String>,

    // Summarizer tables
    pub enable_table_aware: bool,
    pub table_topk_rows: usize,
    pub table_max_rows_verbatim: usize,
    pub table_max_cols_verbatim: usize,

    // HTTP client
    pub http_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,

    /// Extra host → content-type pairs feeding the URL classifier.
    pub content_hosts: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_api_key: String::new(),
            llm_endpoint: "https://api.openai.com/v1".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            llm_max_retries: 3,
            prompt_policy_include: true,
            intent_model: None,
            planner_model: None,
            context_model: None,
            reflection_model: None,
            report_model: None,
            verify_model: None,
            mrs_default: None,
            mrs_code: None,
            mrs_research: None,
            mrs_news: None,
            mrs_documentation: None,
            mrs_general: None,
            search_provider: ProviderKind::Serp,
            serp_api_key: None,
            tavily_api_key: None,
            perplexity_api_key: None,
            exclude_domains: String::new(),
            search_results_per_query: 10,
            top_k_url: 0.3,
            top_k_sum: 0.5,
            vector_db_path: "dossier.db".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            use_reranker: false,
            reranker_url: None,
            reranker_model: None,
            reranker_api_key: None,
            verify_claims: false,
            verify_threshold: 0.7,
            max_iterations: 2,
            report_max_tokens: 4000,
            search_parallel: 1,
            scrape_parallel: 5,
            summary_parallel: 1,
            output_format: OutputFormat::Markdown,
            preserve_tables: true,
            scrape_timeout_secs: 15,
            markdown_service_url: None,
            scrape_api_url: None,
            scrape_api_key: None,
            enable_table_aware: true,
            table_topk_rows: 10,
            table_max_rows_verbatim: 15,
            table_max_cols_verbatim: 8,
            http_timeout_secs: 45,
            http_connect_timeout_secs: 10,
            content_hosts: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings: `path` (or `./dossier.json` when unset) → env vars →
    /// defaults, then validate. A missing default-location file is fine; a
    /// missing explicit `--config` path is a configuration error.
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        let mut settings = match path {
            Some(p) => {
                let contents = std::fs::read_to_string(p).map_err(|e| {
                    PipelineError::ConfigInvalid(format!("cannot read {}: {}", p.display(), e))
                })?;
                serde_json::from_str::<Self>(&contents).map_err(|e| {
                    PipelineError::ConfigInvalid(format!("parse error in {}: {}", p.display(), e))
                })?
            }
            None => match std::fs::read_to_string("dossier.json") {
                Ok(contents) => serde_json::from_str::<Self>(&contents).map_err(|e| {
                    PipelineError::ConfigInvalid(format!("parse error in dossier.json: {}", e))
                })?,
                Err(_) => Self::default(),
            },
        };

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        env_string(&mut self.llm_api_key, "LLM_API_KEY");
        env_string(&mut self.llm_endpoint, "LLM_ENDPOINT");
        env_string(&mut self.default_model, "DEFAULT_MODEL");
        env_parse(&mut self.llm_max_retries, "LLM_MAX_RETRIES");
        env_bool(&mut self.prompt_policy_include, "PROMPT_POLICY_INCLUDE");

        env_opt(&mut self.intent_model, "INTENT_MODEL");
        env_opt(&mut self.planner_model, "PLANNER_MODEL");
        env_opt(&mut self.context_model, "CONTEXT_MODEL");
        env_opt(&mut self.reflection_model, "REFLECTION_MODEL");
        env_opt(&mut self.report_model, "REPORT_MODEL");
        env_opt(&mut self.verify_model, "VERIFY_MODEL");

        env_opt(&mut self.mrs_default, "MRS_DEFAULT");
        env_opt(&mut self.mrs_code, "MRS_CODE");
        env_opt(&mut self.mrs_research, "MRS_RESEARCH");
        env_opt(&mut self.mrs_news, "MRS_NEWS");
        env_opt(&mut self.mrs_documentation, "MRS_DOCUMENTATION");
        env_opt(&mut self.mrs_general, "MRS_GENERAL");

        if let Ok(v) = std::env::var("SEARCH_PROVIDER") {
            if let Some(kind) = ProviderKind::parse(&v) {
                self.search_provider = kind;
            }
        }
        env_opt(&mut self.serp_api_key, "SERP_API_KEY");
        env_opt(&mut self.tavily_api_key, "TAVILY_API_KEY");
        env_opt(&mut self.perplexity_api_key, "PERPLEXITY_API_KEY");
        env_string(&mut self.exclude_domains, "EXCLUDE_DOMAINS");
        env_parse(&mut self.search_results_per_query, "SEARCH_RESULTS_PER_QUERY");

        env_parse(&mut self.top_k_url, "TOP_K_URL");
        env_parse(&mut self.top_k_sum, "TOP_K_SUM");

        env_string(&mut self.vector_db_path, "VECTOR_DB_PATH");
        env_string(&mut self.embedding_model, "EMBEDDING_MODEL");

        env_bool(&mut self.use_reranker, "USE_RERANKER");
        env_opt(&mut self.reranker_url, "RERANKER_URL");
        env_opt(&mut self.reranker_model, "RERANKER_MODEL");
        env_opt(&mut self.reranker_api_key, "RERANKER_API_KEY");

        env_bool(&mut self.verify_claims, "VERIFY_CLAIMS");
        env_parse(&mut self.verify_threshold, "VERIFY_THRESHOLD");

        env_parse(&mut self.max_iterations, "MAX_ITERATIONS");
        env_parse(&mut self.report_max_tokens, "REPORT_MAX_TOKENS");

        env_parse(&mut self.search_parallel, "SEARCH_PARALLEL");
        env_parse(&mut self.scrape_parallel, "SCRAPE_PARALLEL");
        env_parse(&mut self.summary_parallel, "SUMMARY_PARALLEL");

        if let Ok(v) = std::env::var("OUTPUT_FORMAT") {
            match v.trim().to_ascii_lowercase().as_str() {
                "markdown" => self.output_format = OutputFormat::Markdown,
                "text" => self.output_format = OutputFormat::Text,
                _ => {}
            }
        }
        env_bool(&mut self.preserve_tables, "PRESERVE_TABLES");
        env_parse(&mut self.scrape_timeout_secs, "SCRAPE_TIMEOUT_SECS");
        env_opt(&mut self.markdown_service_url, "MARKDOWN_SERVICE_URL");
        env_opt(&mut self.scrape_api_url, "SCRAPE_API_URL");
        env_opt(&mut self.scrape_api_key, "SCRAPE_API_KEY");

        env_bool(&mut self.enable_table_aware, "ENABLE_TABLE_AWARE");
        env_parse(&mut self.table_topk_rows, "TABLE_TOPK_ROWS");
        env_parse(&mut self.table_max_rows_verbatim, "TABLE_MAX_ROWS_VERBATIM");
        env_parse(&mut self.table_max_cols_verbatim, "TABLE_MAX_COLS_VERBATIM");

        env_parse(&mut self.http_timeout_secs, "HTTP_TIMEOUT_SECS");
        env_parse(&mut self.http_connect_timeout_secs, "HTTP_CONNECT_TIMEOUT_SECS");
    }

    /// Startup validation. Fatal problems are `ConfigInvalid` (exit 2);
    /// merely suspicious values log a WARNING and pass.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.llm_api_key.trim().is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "llm_api_key is required (set LLM_API_KEY or add it to the config file)".into(),
            ));
        }

        let provider_key = match self.search_provider {
            ProviderKind::Serp => &self.serp_api_key,
            ProviderKind::Tavily => &self.tavily_api_key,
            ProviderKind::Perplexity => &self.perplexity_api_key,
        };
        if provider_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(PipelineError::ConfigInvalid(format!(
                "search_provider is '{}' but {}_api_key is unset",
                self.search_provider.as_str(),
                self.search_provider.as_str()
            )));
        }

        for (name, ratio) in [("top_k_url", self.top_k_url), ("top_k_sum", self.top_k_sum)] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(PipelineError::ConfigInvalid(format!(
                    "{} must lie in (0.0, 1.0], got {}",
                    name, ratio
                )));
            }
        }

        if self.max_iterations < 1 {
            return Err(PipelineError::ConfigInvalid(
                "max_iterations must be >= 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.verify_threshold) {
            return Err(PipelineError::ConfigInvalid(format!(
                "verify_threshold must lie in [0.0, 1.0], got {}",
                self.verify_threshold
            )));
        }

        if self.search_results_per_query < 1 {
            return Err(PipelineError::ConfigInvalid(
                "search_results_per_query must be >= 1".into(),
            ));
        }

        for (name, value) in [
            ("search_parallel", self.search_parallel),
            ("scrape_parallel", self.scrape_parallel),
            ("summary_parallel", self.summary_parallel),
        ] {
            if value < 1 {
                return Err(PipelineError::ConfigInvalid(format!(
                    "{} must be >= 1, got {}",
                    name, value
                )));
            }
            if value > 32 {
                warn!("{} = {} exceeds the supported range [1, 32]", name, value);
            }
        }

        // Every summarize worker multiplies LLM spend linearly.
        if self.summary_parallel > 4 {
            warn!(
                "summary_parallel = {} will multiply LLM cost per iteration",
                self.summary_parallel
            );
        }

        if self.table_topk_rows < 1 {
            return Err(PipelineError::ConfigInvalid(
                "table_topk_rows must be >= 1".into(),
            ));
        }

        Ok(())
    }

    /// API key for the selected search provider. Validated non-empty.
    pub fn search_provider_key(&self) -> &str {
        match self.search_provider {
            ProviderKind::Serp => self.serp_api_key.as_deref().unwrap_or(""),
            ProviderKind::Tavily => self.tavily_api_key.as_deref().unwrap_or(""),
            ProviderKind::Perplexity => self.perplexity_api_key.as_deref().unwrap_or(""),
        }
    }

    pub fn exclude_domain_list(&self) -> Vec<String> {
        self.exclude_domains
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn intent_model(&self) -> &str {
        self.intent_model.as_deref().unwrap_or(&self.default_model)
    }
    pub fn planner_model(&self) -> &str {
        self.planner_model.as_deref().unwrap_or(&self.default_model)
    }
    pub fn context_model(&self) -> &str {
        self.context_model.as_deref().unwrap_or(&self.default_model)
    }
    pub fn reflection_model(&self) -> &str {
        self.reflection_model
            .as_deref()
            .unwrap_or(&self.default_model)
    }
    pub fn report_model(&self) -> &str {
        self.report_model.as_deref().unwrap_or(&self.default_model)
    }
    pub fn verify_model(&self) -> &str {
        self.verify_model.as_deref().unwrap_or(&self.default_model)
    }
}

fn env_string(slot: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if !v.trim().is_empty() {
            *slot = v;
        }
    }
}

fn env_opt(slot: &mut Option<String>, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if !v.trim().is_empty() {
            *slot = Some(v);
        }
    }
}

fn env_bool(slot: &mut bool, key: &str) {
    if let Ok(v) = std::env::var(key) {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *slot = true,
            "0" | "false" | "no" | "off" => *slot = false,
            _ => {}
        }
    }
}

fn env_parse<T: std::str::FromStr>(slot: &mut T, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.trim().parse::<T>() {
            *slot = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        Settings {
            llm_api_key: "sk-test".into(),
            serp_api_key: Some("serp-test".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn missing_llm_key_is_config_invalid() {
        let err = Settings::default().validate().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn missing_provider_key_is_config_invalid() {
        let settings = Settings {
            llm_api_key: "sk-test".into(),
            search_provider: ProviderKind::Tavily,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn ratio_bounds_enforced() {
        for bad in [0.0, -0.1, 1.5] {
            let settings = Settings {
                top_k_url: bad,
                ..valid()
            };
            assert!(settings.validate().is_err(), "top_k_url = {bad}");
        }
        let settings = Settings {
            top_k_url: 1.0,
            ..valid()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_parallelism_rejected_oversize_accepted() {
        let settings = Settings {
            scrape_parallel: 0,
            ..valid()
        };
        assert!(settings.validate().is_err());

        // > 32 passes validation (with a logged warning).
        let settings = Settings {
            scrape_parallel: 64,
            ..valid()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn exclude_domains_splits_and_normalizes() {
        let settings = Settings {
            exclude_domains: "Example.com, pinterest.com ,".into(),
            ..valid()
        };
        assert_eq!(
            settings.exclude_domain_list(),
            vec!["example.com".to_string(), "pinterest.com".to_string()]
        );
    }

    #[test]
    fn stage_models_fall_back_to_default() {
        let settings = valid();
        assert_eq!(settings.intent_model(), "gpt-4o-mini");
        let settings = Settings {
            report_model: Some("gpt-4.1".into()),
            ..valid()
        };
        assert_eq!(settings.report_model(), "gpt-4.1");
        assert_eq!(settings.planner_model(), "gpt-4o-mini");
    }
}
