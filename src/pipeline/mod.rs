//! Pipeline orchestrator: the explicit state machine that sequences
//! classify → plan → (search → url-rerank → scrape → summarize → reflect)*
//! → assemble → report → verify.
//!
//! The orchestrator exclusively owns the mutable accumulators
//! (`all_search_results`, scraped content, `all_summaries`); stages receive
//! read-only views and return new artifacts. Reflection extends the
//! accumulators, never edits them.
//!
//! Single-writer contract: the vector store is written by the ASSEMBLE stage
//! only, which runs strictly single-threaded after the research loop. No
//! other stage may write: the underlying embedded database is single-writer
//! and will contend or corrupt otherwise. Enforced by architecture: the
//! store handle is lent to `assemble` alone.

pub mod assemble;
pub mod intent;
pub mod plan;
pub mod reflect;
pub mod report;
pub mod verify;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::app_state::AppState;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::{
    effective_count, ContextPackage, Query, ReflectionResult, Report, ResearchPlan, ScrapedContent,
    SearchQuery, SearchResult, Summary, VerificationSummary,
};
use crate::prompts;
use crate::search::kind_for_intent;
use crate::summarize::Summarizer;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Print the research plan before executing it.
    pub show_plan: bool,
}

#[derive(Debug)]
pub struct ResearchOutcome {
    pub report: Report,
    pub verification: Option<VerificationSummary>,
}

/// Pipeline states. Transitions are linear except the research loop, which
/// REFLECT re-enters at SEARCH while iterations remain. The optional VERIFY
/// stage hangs off REPORT and cannot loop, so it runs as the report's tail
/// call rather than a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Classify,
    Plan,
    Search,
    RerankUrls,
    Scrape,
    Summarize,
    Reflect,
    Assemble,
    Report,
}

/// Mutable run state. Artifacts are created monotonically forward.
#[derive(Default)]
struct RunState {
    query: Option<Query>,
    plan: Option<ResearchPlan>,
    iteration: usize,
    pending_queries: Vec<SearchQuery>,
    seen_urls: HashSet<String>,
    all_search_results: Vec<SearchResult>,
    iter_new_results: Vec<SearchResult>,
    iter_selected_urls: Vec<String>,
    iter_scraped: Vec<ScrapedContent>,
    all_scraped: HashMap<String, ScrapedContent>,
    all_summaries: Vec<Summary>,
    last_reflection: Option<ReflectionResult>,
    context: Option<ContextPackage>,
    warnings: Vec<String>,
}

pub struct Orchestrator {
    state: Arc<AppState>,
    summarizer: Summarizer,
}

impl Orchestrator {
    pub fn new(state: Arc<AppState>) -> Self {
        let summarizer = Summarizer::new(state.gateway.clone(), &state.settings);
        Self { state, summarizer }
    }

    pub async fn run(
        &self,
        query_text: &str,
        cancel: CancellationToken,
        options: RunOptions,
    ) -> PipelineResult<ResearchOutcome> {
        let started = Instant::now();
        let settings = &self.state.settings;
        let max_iterations = settings.max_iterations.max(1);

        let mut rs = RunState::default();
        let mut stage = Stage::Classify;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            match stage {
                // ── CLASSIFY ──────────────────────────────────────────────
                Stage::Classify => {
                    let query =
                        intent::classify_intent(&self.state.gateway, settings, query_text).await;
                    info!(intent = query.intent.as_str(), "intent classified");
                    rs.query = Some(query);
                    stage = Stage::Plan;
                }

                // ── PLAN ──────────────────────────────────────────────────
                Stage::Plan => {
                    let query = rs.query.as_ref().expect("classified before planning");
                    let plan = plan::build_plan(&self.state.gateway, settings, query).await?;
                    info!(
                        sections = plan.sections.len(),
                        queries = plan.search_queries.len(),
                        "research plan ready"
                    );
                    if options.show_plan {
                        println!("Research plan for: {}", query.text);
                        println!("Sections:");
                        for s in &plan.sections {
                            println!("  - {}", s);
                        }
                        println!("Search queries:\n{}", prompts::format_queries(&plan.search_queries));
                    }
                    rs.pending_queries = plan.search_queries.clone();
                    rs.plan = Some(plan);
                    rs.iteration = 1;
                    stage = Stage::Search;
                }

                // ── SEARCH: one worker per query, bounded fan-out ─────────
                Stage::Search => {
                    let query = rs.query.as_ref().expect("classified");
                    let kind = kind_for_intent(query.intent);

                    let mut queries = std::mem::take(&mut rs.pending_queries);
                    // Stable by priority: 1 (highest) runs and ranks first.
                    queries.sort_by_key(|q| q.priority);
                    info!(
                        iteration = rs.iteration,
                        queries = queries.len(),
                        kind = kind.as_str(),
                        "search fan-out"
                    );

                    let mut batches: Vec<(usize, Vec<SearchResult>)> =
                        stream::iter(queries.iter().cloned().enumerate())
                            .map(|(i, q)| {
                                let search = &self.state.search;
                                async move { (i, search.run(&q, kind).await) }
                            })
                            .buffer_unordered(settings.search_parallel)
                            .collect()
                            .await;
                    // Fan-in re-imposes query order regardless of completion order.
                    batches.sort_by_key(|(i, _)| *i);

                    rs.iter_new_results.clear();
                    for (_, batch) in batches {
                        for result in batch {
                            // Cross-iteration dedup by canonical URL, first
                            // seen keeps its rank.
                            if rs.seen_urls.insert(result.url.clone()) {
                                rs.all_search_results.push(result.clone());
                                rs.iter_new_results.push(result);
                            }
                        }
                    }

                    info!(
                        iteration = rs.iteration,
                        new_results = rs.iter_new_results.len(),
                        total_results = rs.all_search_results.len(),
                        "search fan-in"
                    );

                    // Hard failure: nothing to research and nothing gathered.
                    if rs.iteration == 1
                        && rs.iter_new_results.is_empty()
                        && rs.all_summaries.is_empty()
                    {
                        return Err(PipelineError::NoResults);
                    }

                    stage = Stage::RerankUrls;
                }

                // ── URL_RERANK: pick the slice worth scraping ─────────────
                Stage::RerankUrls => {
                    let query = rs.query.as_ref().expect("classified");
                    let n_new = rs.iter_new_results.len();
                    let k = effective_count(settings.top_k_url, n_new);

                    let reranked = self
                        .state
                        .reranker
                        .rerank(&query.text, std::mem::take(&mut rs.iter_new_results), k)
                        .await;
                    rs.iter_selected_urls =
                        reranked.into_iter().map(|r| r.item.url).collect();

                    info!(
                        candidates = n_new,
                        selected = rs.iter_selected_urls.len(),
                        "urls selected for scraping"
                    );
                    stage = Stage::Scrape;
                }

                // ── SCRAPE: bounded, single-flight, failure-isolated ──────
                Stage::Scrape => {
                    let scraped_map = self
                        .state
                        .scraper
                        .scrape_many(&rs.iter_selected_urls, &cancel)
                        .await;

                    // Downstream order follows the URL-rerank ranking, not
                    // scrape completion order.
                    rs.iter_scraped = rs
                        .iter_selected_urls
                        .iter()
                        .filter_map(|url| scraped_map.get(url).cloned())
                        .collect();
                    for (url, content) in scraped_map {
                        rs.all_scraped.insert(url, content);
                    }

                    let unavailable = rs.iter_scraped.iter().filter(|s| s.is_unavailable()).count();
                    if unavailable > 0 {
                        rs.warnings
                            .push(format!("{unavailable} URL(s) yielded no content"));
                    }
                    stage = Stage::Summarize;
                }

                // ── SUMMARIZE: one worker per document ────────────────────
                Stage::Summarize => {
                    let plan = rs.plan.as_ref().expect("planned");
                    let docs: Vec<&ScrapedContent> = rs
                        .iter_scraped
                        .iter()
                        .filter(|s| !s.is_unavailable())
                        .collect();

                    let mut results: Vec<(usize, Option<Summary>)> =
                        stream::iter(docs.iter().enumerate())
                            .map(|(i, doc)| {
                                let summarizer = &self.summarizer;
                                async move { (i, summarizer.summarize(doc, plan).await) }
                            })
                            .buffer_unordered(settings.summary_parallel)
                            .collect()
                            .await;
                    results.sort_by_key(|(i, _)| *i);

                    let before = rs.all_summaries.len();
                    rs.all_summaries
                        .extend(results.into_iter().filter_map(|(_, s)| s));
                    info!(
                        iteration = rs.iteration,
                        new_summaries = rs.all_summaries.len() - before,
                        total_summaries = rs.all_summaries.len(),
                        "summarization done"
                    );

                    // The final iteration never reflects: the loop cannot
                    // re-enter anyway.
                    stage = if rs.iteration >= max_iterations {
                        Stage::Assemble
                    } else {
                        Stage::Reflect
                    };
                }

                // ── REFLECT: terminate or extend the loop ─────────────────
                Stage::Reflect => {
                    let query = rs.query.as_ref().expect("classified");
                    let plan = rs.plan.as_ref().expect("planned");
                    let reflection = reflect::reflect(
                        &self.state.gateway,
                        settings,
                        query,
                        &plan.sections,
                        &rs.all_summaries,
                    )
                    .await?;

                    if reflection.complete {
                        rs.last_reflection = Some(reflection);
                        stage = Stage::Assemble;
                    } else {
                        info!(
                            iteration = rs.iteration,
                            follow_ups = reflection.additional_queries.len(),
                            "coverage incomplete, re-entering search"
                        );
                        rs.pending_queries = reflection.additional_queries.clone();
                        rs.last_reflection = Some(reflection);
                        rs.iteration += 1;
                        stage = Stage::Search;
                    }
                }

                // ── ASSEMBLE: sole vector-store writer, single-threaded ───
                Stage::Assemble => {
                    if rs.all_summaries.is_empty() {
                        // Search found URLs but nothing survived scraping and
                        // summarizing; an unsourced report would be
                        // hallucinated.
                        warn!(
                            stage = "assemble",
                            item = query_text,
                            error_kind = "no_results",
                            cause = "zero summaries after research loop",
                            "refusing to generate a report without sources"
                        );
                        return Err(PipelineError::NoResults);
                    }

                    let query = rs.query.as_ref().expect("classified");
                    let context = assemble::assemble(
                        self.state.embedder.as_ref(),
                        &self.state.store,
                        &self.state.reranker,
                        settings,
                        &query.text,
                        &rs.all_summaries,
                    )
                    .await?;
                    rs.context = Some(context);
                    stage = Stage::Report;
                }

                // ── REPORT ────────────────────────────────────────────────
                Stage::Report => {
                    let query = rs.query.as_ref().expect("classified");
                    let plan = rs.plan.as_ref().expect("planned");
                    let context = rs.context.as_ref().expect("assembled");

                    let limitations = rs
                        .last_reflection
                        .as_ref()
                        .map(|r| r.gaps.clone())
                        .unwrap_or_default();

                    let mut metadata = BTreeMap::new();
                    metadata.insert("iterations".into(), serde_json::json!(rs.iteration));
                    metadata.insert(
                        "search_results".into(),
                        serde_json::json!(rs.all_search_results.len()),
                    );
                    metadata.insert("urls_scraped".into(), serde_json::json!(rs.all_scraped.len()));
                    metadata.insert(
                        "summaries".into(),
                        serde_json::json!(rs.all_summaries.len()),
                    );
                    metadata.insert(
                        "search_provider".into(),
                        serde_json::json!(self.state.search.provider_tag()),
                    );
                    metadata.insert(
                        "scrape_tiers".into(),
                        serde_json::to_value(self.state.scraper.usage())
                            .unwrap_or(serde_json::Value::Null),
                    );
                    if !rs.warnings.is_empty() {
                        metadata.insert("warnings".into(), serde_json::json!(rs.warnings));
                    }
                    metadata.insert(
                        "duration_ms".into(),
                        serde_json::json!(started.elapsed().as_millis() as u64),
                    );

                    let generated = report::generate_report(
                        &self.state.gateway,
                        settings,
                        query,
                        &plan.sections,
                        context,
                        limitations,
                        metadata,
                    )
                    .await?;

                    info!(
                        sections = generated.sections.len(),
                        sources = generated.sources.len(),
                        "report generated"
                    );

                    if settings.verify_claims {
                        return self.finish_with_verification(generated, cancel).await;
                    }
                    return Ok(ResearchOutcome {
                        report: generated,
                        verification: None,
                    });
                }
            }
        }
    }

    async fn finish_with_verification(
        &self,
        mut report: Report,
        cancel: CancellationToken,
    ) -> PipelineResult<ResearchOutcome> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match verify::verify_report(
            &self.state.gateway,
            &self.state.settings,
            &report,
            &self.state.scraper,
        )
        .await
        {
            Ok(summary) => {
                info!(
                    claims = summary.total,
                    flagged = summary.flagged.len(),
                    "verification done"
                );
                Ok(ResearchOutcome {
                    report,
                    verification: Some(summary),
                })
            }
            Err(e) => {
                warn!(
                    stage = "verify",
                    item = %report.query,
                    error_kind = e.kind(),
                    cause = %e,
                    "verification unavailable, shipping report without appendix"
                );
                report.metadata.insert(
                    "verification".into(),
                    serde_json::json!(format!("unavailable: {e}")),
                );
                Ok(ResearchOutcome {
                    report,
                    verification: None,
                })
            }
        }
    }
}
