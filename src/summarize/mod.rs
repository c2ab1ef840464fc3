//! Map-reduce summarization with content-type model routing and table-aware
//! preprocessing.
//!
//! Routing fall-through: content-specific model → `mrs_general` →
//! `mrs_default` → `default_model`. Large pipe tables are compacted
//! deterministically before any prompt is built; the model never sees the
//! full table and never computes the aggregates.

pub mod tables;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::core::config::Settings;
use crate::core::types::{ContentType, ResearchPlan, ScrapedContent, Summary};
use crate::llm::gateway::LlmGateway;
use crate::nlp::content_type::classify;
use crate::prompts;
use tables::{preprocess_tables, TableOutcome, TablePolicy};

/// Documents at or under this many words are summarized in one call;
/// anything larger goes through map-reduce.
const WINDOW_WORDS: usize = 3_000;
/// Map-phase chunk size and stride (overlap = window − stride).
const CHUNK_WORDS: usize = 3_000;
const CHUNK_STRIDE_WORDS: usize = 2_700;

const SUMMARY_TEMPERATURE: f32 = 0.2;

// ─────────────────────────────────────────────────────────────────────────────
// Model routing
// ─────────────────────────────────────────────────────────────────────────────

/// Static content-type → model table with the fall-through chain baked in.
#[derive(Debug, Clone)]
pub struct ModelRouting {
    default_model: String,
    mrs_default: Option<String>,
    mrs_general: Option<String>,
    by_type: BTreeMap<ContentType, Option<String>>,
}

impl ModelRouting {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut by_type = BTreeMap::new();
        by_type.insert(ContentType::Code, settings.mrs_code.clone());
        by_type.insert(ContentType::Research, settings.mrs_research.clone());
        by_type.insert(ContentType::News, settings.mrs_news.clone());
        by_type.insert(ContentType::Documentation, settings.mrs_documentation.clone());
        by_type.insert(ContentType::General, settings.mrs_general.clone());
        Self {
            default_model: settings.default_model.clone(),
            mrs_default: settings.mrs_default.clone(),
            mrs_general: settings.mrs_general.clone(),
            by_type,
        }
    }

    pub fn model_for(&self, content_type: ContentType) -> &str {
        self.by_type
            .get(&content_type)
            .and_then(Option::as_deref)
            .or(self.mrs_general.as_deref())
            .or(self.mrs_default.as_deref())
            .unwrap_or(&self.default_model)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summarizer
// ─────────────────────────────────────────────────────────────────────────────

pub struct Summarizer {
    gateway: Arc<LlmGateway>,
    routing: ModelRouting,
    table_policy: Option<TablePolicy>,
    content_hosts: BTreeMap<String, String>,
}

impl Summarizer {
    pub fn new(gateway: Arc<LlmGateway>, settings: &Settings) -> Self {
        let table_policy = settings.enable_table_aware.then_some(TablePolicy {
            topk_rows: settings.table_topk_rows,
            max_rows_verbatim: settings.table_max_rows_verbatim,
            max_cols_verbatim: settings.table_max_cols_verbatim,
        });
        Self {
            gateway,
            routing: ModelRouting::from_settings(settings),
            table_policy,
            content_hosts: settings.content_hosts.clone(),
        }
    }

    /// Summarize one scraped document for the plan's query. `None` means the
    /// document was skipped (unavailable body or an LLM failure): the
    /// pipeline continues without it.
    pub async fn summarize(
        &self,
        scraped: &ScrapedContent,
        plan: &ResearchPlan,
    ) -> Option<Summary> {
        if scraped.is_unavailable() {
            debug!(url = %scraped.url, "skipping unavailable scrape");
            return None;
        }

        let content_type = classify(&scraped.url, &self.content_hosts);
        let model = self.routing.model_for(content_type).to_string();

        let (prepared, table_outcome) = match &self.table_policy {
            Some(policy) => preprocess_tables(&scraped.markdown_body, policy),
            None => (scraped.markdown_body.clone(), TableOutcome::default()),
        };

        let query = &plan.query.text;
        let now = Utc::now();

        let result = if word_count(&prepared) <= WINDOW_WORDS {
            self.gateway
                .complete_text(
                    &prompts::summarize_direct_prompt(
                        now,
                        query,
                        &scraped.url,
                        &scraped.title,
                        &prepared,
                    ),
                    &model,
                    SUMMARY_TEMPERATURE,
                    None,
                )
                .await
        } else {
            self.map_reduce(&prepared, query, &scraped.url, &model).await
        };

        match result {
            Ok(text) => Some(Summary {
                source_url: scraped.url.clone(),
                title: scraped.title.clone(),
                text,
                citations: BTreeSet::from([scraped.url.clone()]),
                content_type,
                preserved_tables: table_outcome.preserved,
                compacted_tables: table_outcome.compacted,
            }),
            Err(e) => {
                warn!(
                    stage = "summarize",
                    item = %scraped.url,
                    error_kind = e.kind(),
                    cause = %e,
                    "summarization failed for document, continuing without it"
                );
                None
            }
        }
    }

    async fn map_reduce(
        &self,
        content: &str,
        query: &str,
        url: &str,
        model: &str,
    ) -> crate::core::error::PipelineResult<String> {
        let chunks = chunk_words(content, CHUNK_WORDS, CHUNK_STRIDE_WORDS);
        let total = chunks.len();
        debug!(url, chunks = total, "map-reduce summarization");
        let now = Utc::now();

        let mut partials = Vec::with_capacity(total);
        for (i, chunk) in chunks.iter().enumerate() {
            let partial = self
                .gateway
                .complete_text(
                    &prompts::summarize_map_prompt(now, query, url, i + 1, total, chunk),
                    model,
                    SUMMARY_TEMPERATURE,
                    None,
                )
                .await?;
            partials.push(partial);
        }

        self.gateway
            .complete_text(
                &prompts::summarize_reduce_prompt(now, query, url, &partials),
                model,
                SUMMARY_TEMPERATURE,
                None,
            )
            .await
    }
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Overlapping word-window chunks: `window` words per chunk, advancing
/// `stride` words, so consecutive chunks share `window − stride` words.
fn chunk_words(text: &str, window: usize, stride: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    if words.len() <= window {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < words.len() {
        let end = (start + window).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += stride;
    }
    chunks
}
