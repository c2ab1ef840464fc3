//! End-to-end pipeline scenarios over injected seams: scripted search
//! provider, scripted page fetcher, scripted LLM transport, counting
//! embedder. The orchestration, caching, ranking, and validation logic under
//! test is the production code path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use dossier::core::config::Settings;
use dossier::core::error::{PipelineError, PipelineResult};
use dossier::core::types::SearchResult;
use dossier::llm::embedding::Embedder;
use dossier::llm::gateway::{LlmRequest, LlmTransport, TransportError};
use dossier::pipeline::{Orchestrator, RunOptions};
use dossier::scraping::PageFetcher;
use dossier::search::{SearchKind, SearchProvider};
use dossier::store::VectorStore;
use dossier::AppState;

// ─────────────────────────────────────────────────────────────────────────────
// Stubs
// ─────────────────────────────────────────────────────────────────────────────

/// Routes each prompt to a canned response by stage fingerprint.
struct StageTransport {
    plan_json: String,
    report_body: String,
    reflections: Mutex<Vec<String>>,
    summarize_calls: AtomicU32,
    reflect_calls: AtomicU32,
    verify_prompts: Mutex<Vec<String>>,
}

impl StageTransport {
    fn new(plan_json: &str, report_body: &str, reflections: Vec<&str>) -> Self {
        Self {
            plan_json: plan_json.to_string(),
            report_body: report_body.to_string(),
            reflections: Mutex::new(reflections.into_iter().rev().map(String::from).collect()),
            summarize_calls: AtomicU32::new(0),
            reflect_calls: AtomicU32::new(0),
            verify_prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmTransport for StageTransport {
    async fn complete(&self, request: &LlmRequest) -> Result<String, TransportError> {
        let p = &request.prompt;
        if p.contains("Classify the research query") {
            return Ok(r#"{"intent": "informational"}"#.to_string());
        }
        if p.contains("Plan a research report") {
            return Ok(self.plan_json.clone());
        }
        if p.contains("Summarize the source below") || p.contains("part ") {
            self.summarize_calls.fetch_add(1, Ordering::SeqCst);
            return Ok("HTTP/3 is the third major HTTP version, carried over QUIC.".to_string());
        }
        if p.contains("auditing research coverage") {
            self.reflect_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.reflections.lock().unwrap().pop();
            return Ok(next.unwrap_or_else(|| r#"{"complete": true, "gaps": []}"#.to_string()));
        }
        if p.contains("Write a research report") {
            return Ok(self.report_body.clone());
        }
        if p.contains("Extract every checkable cited claim") {
            return Ok(r#"{"claims": [
                {"claim_text": "President X signed the bill", "source_number": 2,
                 "claim_type": "factual", "context": "lead paragraph"}
            ]}"#
                .to_string());
        }
        if p.contains("Verify each claim") {
            self.verify_prompts.lock().unwrap().push(p.clone());
            return Ok(r#"{"verdicts": [
                {"claim": 1, "verdict": "supported", "confidence": 0.93,
                 "evidence": "President X signed the bill", "reasoning": "verbatim in source"}
            ]}"#
                .to_string());
        }
        Err(TransportError::Transient(format!(
            "unscripted prompt: {}",
            p.chars().take(80).collect::<String>()
        )))
    }
}

struct CountingEmbedder {
    batches: AtomicU32,
    batch_sizes: Mutex<Vec<usize>>,
}

impl CountingEmbedder {
    fn new() -> Self {
        Self {
            batches: AtomicU32::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(texts.len());
        Ok(texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                vec![
                    if t.to_lowercase().contains("http") { 1.0 } else { 0.2 },
                    (i as f32 * 0.01).sin(),
                    0.3,
                ]
            })
            .collect())
    }
}

/// Pops one scripted result batch per search call; empty script = no results.
struct ScriptedProvider {
    batches: Mutex<Vec<Vec<SearchResult>>>,
    calls: AtomicU32,
    queries: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(batches: Vec<Vec<SearchResult>>) -> Self {
        let mut batches = batches;
        batches.reverse();
        Self {
            batches: Mutex::new(batches),
            calls: AtomicU32::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SearchProvider for ScriptedProvider {
    fn tag(&self) -> &'static str {
        "scripted"
    }

    async fn search(
        &self,
        query: &str,
        _kind: SearchKind,
        _n: usize,
        _exclude: &[String],
    ) -> anyhow::Result<Vec<SearchResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self.batches.lock().unwrap().pop().unwrap_or_default())
    }
}

/// Serves canned HTML (tier 1) and canned rendered Markdown (tier 2).
#[derive(Default)]
struct MapFetcher {
    html: HashMap<String, String>,
    rendered: HashMap<String, String>,
}

#[async_trait]
impl PageFetcher for MapFetcher {
    async fn fetch_html(&self, url: &str) -> anyhow::Result<String> {
        self.html
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404"))
    }
    async fn fetch_rendered_markdown(&self, url: &str) -> anyhow::Result<String> {
        self.rendered
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("service miss"))
    }
    async fn fetch_via_api(&self, _url: &str) -> anyhow::Result<(String, String)> {
        anyhow::bail!("api unavailable")
    }
    fn markdown_service_configured(&self) -> bool {
        !self.rendered.is_empty()
    }
    fn scrape_api_configured(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

const PLAN_JSON: &str = r#"{
    "sections": ["Overview"],
    "search_queries": [{"text": "http3 overview", "purpose": "base coverage", "priority": 1}],
    "rationale": "single focused query"
}"#;

fn result(url: &str, rank: u32) -> SearchResult {
    SearchResult {
        url: url.to_string(),
        title: format!("Result {rank}"),
        snippet: "about http3".to_string(),
        rank,
        provider_tag: "scripted".to_string(),
    }
}

fn article_html(title: &str) -> String {
    format!(
        "<html><head><title>{title}</title></head><body><article><p>{}</p></article></body></html>",
        "HTTP/3 is carried over QUIC, a UDP-based transport with built-in encryption. "
            .repeat(12)
    )
}

fn base_settings() -> Settings {
    Settings {
        llm_api_key: "sk-test".into(),
        serp_api_key: Some("serp-test".into()),
        search_results_per_query: 4,
        top_k_url: 0.5,
        top_k_sum: 0.5,
        max_iterations: 1,
        verify_claims: false,
        ..Settings::default()
    }
}

fn build_state(
    settings: Settings,
    transport: Arc<StageTransport>,
    embedder: Arc<CountingEmbedder>,
    provider: Arc<ScriptedProvider>,
    fetcher: MapFetcher,
) -> Arc<AppState> {
    Arc::new(AppState::with_components(
        settings,
        transport,
        embedder,
        provider,
        Arc::new(fetcher),
        VectorStore::open_in_memory().unwrap(),
    ))
}

fn citation_numbers(body: &str) -> Vec<usize> {
    Regex::new(r"\[Source (\d+)\]")
        .unwrap()
        .captures_iter(body)
        .map(|c| c[1].parse().unwrap())
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario A: happy path, single iteration
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_happy_path_single_iteration() {
    let transport = Arc::new(StageTransport::new(
        PLAN_JSON,
        // One valid citation and one dangling citation the validator must strip.
        "## Overview\n\nHTTP/3 runs over QUIC [Source 1]. Extra claim [Source 9].",
        vec![],
    ));
    let embedder = Arc::new(CountingEmbedder::new());
    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        result("https://a.org/one", 1),
        result("https://a.org/two", 2),
        result("https://a.org/three", 3),
        result("https://a.org/four", 4),
    ]]));

    // Bodies exist only for the top-2; with top_k_url = 0.5 over 4 results,
    // only those two are ever fetched.
    let mut fetcher = MapFetcher::default();
    fetcher.html.insert("https://a.org/one".into(), article_html("One"));
    fetcher.html.insert("https://a.org/two".into(), article_html("Two"));

    let state = build_state(base_settings(), transport.clone(), embedder.clone(), provider.clone(), fetcher);
    let outcome = Orchestrator::new(state.clone())
        .run("What is HTTP/3?", CancellationToken::new(), RunOptions::default())
        .await
        .unwrap();

    // Two summaries made it through; the context kept ceil(0.5 × 2) = 1.
    assert_eq!(transport.summarize_calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.report.sources.len(), 1);
    assert!(!outcome.report.sections.is_empty());

    // Invariant: every surviving [Source N] resolves to a listed source.
    for section in &outcome.report.sections {
        for n in citation_numbers(&section.markdown_body) {
            assert!(n >= 1 && n <= outcome.report.sources.len(), "dangling [Source {n}]");
        }
        assert!(!section.markdown_body.contains("[Source 9]"));
    }

    // Exactly one embedding batch: 2 summaries + 1 query = 3 texts.
    assert_eq!(embedder.batches.load(Ordering::SeqCst), 1);
    assert_eq!(embedder.batch_sizes.lock().unwrap()[0], 3);

    // max_iterations = 1: the reflector never ran, search ran once.
    assert_eq!(transport.reflect_calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // Scrape selection honored top_k_url: only the two scripted URLs fetched.
    assert_eq!(state.scraper.usage().primary, 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario B: reflection re-entry
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_b_reflection_reenters_search_once() {
    let transport = Arc::new(StageTransport::new(
        PLAN_JSON,
        "## Overview\n\nCovered [Source 1].",
        vec![
            r#"{"complete": false, "gaps": ["adoption data"],
                "additional_queries": [{"text": "http3 adoption statistics", "purpose": "fill gap", "priority": 2}],
                "rationale": "missing adoption numbers"}"#,
        ],
    ));
    let embedder = Arc::new(CountingEmbedder::new());
    let provider = Arc::new(ScriptedProvider::new(vec![
        // Iteration 1.
        vec![result("https://a.org/one", 1), result("https://a.org/two", 2)],
        // Iteration 2: one duplicate (dropped by cross-iteration dedup), one new.
        vec![result("https://a.org/one", 1), result("https://b.org/fresh", 2)],
    ]));

    let mut fetcher = MapFetcher::default();
    for url in ["https://a.org/one", "https://a.org/two", "https://b.org/fresh"] {
        fetcher.html.insert(url.into(), article_html(url));
    }

    let settings = Settings {
        max_iterations: 2,
        top_k_url: 1.0,
        ..base_settings()
    };
    let state = build_state(settings, transport.clone(), embedder.clone(), provider.clone(), fetcher);
    let outcome = Orchestrator::new(state)
        .run("What is HTTP/3?", CancellationToken::new(), RunOptions::default())
        .await
        .unwrap();

    // SEARCH ran twice; the follow-up query drove the second pass.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        provider.queries.lock().unwrap()[1],
        "http3 adoption statistics"
    );

    // Summaries accumulate monotonically: 2 from iteration 1 + 1 new.
    assert_eq!(transport.summarize_calls.load(Ordering::SeqCst), 3);

    // ASSEMBLE ran exactly once, over all summaries (3 + query = 4 texts).
    assert_eq!(embedder.batches.load(Ordering::SeqCst), 1);
    assert_eq!(embedder.batch_sizes.lock().unwrap()[0], 4);

    // One reflection only: iteration 2 is the cap and never reflects.
    assert_eq!(transport.reflect_calls.load(Ordering::SeqCst), 1);

    // The gap surfaced as a research limitation.
    assert_eq!(outcome.report.limitations, vec!["adoption data".to_string()]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario C: zero results on iteration 1
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_c_zero_results_aborts_with_no_results() {
    let transport = Arc::new(StageTransport::new(PLAN_JSON, "unused", vec![]));
    let embedder = Arc::new(CountingEmbedder::new());
    let provider = Arc::new(ScriptedProvider::new(vec![vec![]]));

    let state = build_state(
        base_settings(),
        transport,
        embedder.clone(),
        provider,
        MapFetcher::default(),
    );
    let err = Orchestrator::new(state)
        .run("What is HTTP/3?", CancellationToken::new(), RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NoResults));
    assert_eq!(err.exit_code(), 3);
    // The pipeline stopped before ASSEMBLE: no embedding calls at all.
    assert_eq!(embedder.batches.load(Ordering::SeqCst), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario D: scraper tier fallback
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_d_short_primary_body_uses_fallback1() {
    let transport = Arc::new(StageTransport::new(
        PLAN_JSON,
        "## Overview\n\nAll three scraped [Source 1].",
        vec![],
    ));
    let embedder = Arc::new(CountingEmbedder::new());
    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        result("https://a.org/one", 1),
        result("https://b.org/short", 2),
        result("https://c.org/three", 3),
    ]]));

    let mut fetcher = MapFetcher::default();
    fetcher.html.insert("https://a.org/one".into(), article_html("One"));
    // URL B's primary fetch yields under 200 chars of converted body.
    fetcher
        .html
        .insert("https://b.org/short".into(), "<html><body><p>stub</p></body></html>".into());
    fetcher.html.insert("https://c.org/three".into(), article_html("Three"));
    // Fallback-1 serves a valid Markdown body for URL B.
    fetcher.rendered.insert(
        "https://b.org/short".into(),
        format!("# Rendered B\n\n{}", "fallback markdown body with substance. ".repeat(12)),
    );

    let settings = Settings {
        top_k_url: 1.0,
        ..base_settings()
    };
    let state = build_state(settings, transport, embedder, provider, fetcher);
    let outcome = Orchestrator::new(state.clone())
        .run("What is HTTP/3?", CancellationToken::new(), RunOptions::default())
        .await
        .unwrap();

    // URL B came from the markdown-extractor tier.
    let cached = state.scraper.cache().get("https://b.org/short").await.unwrap();
    assert_eq!(
        cached.extractor_tier,
        dossier::core::types::ExtractorTier::Fallback1
    );
    assert_eq!(cached.title, "Rendered B");

    // Aggregate counters: three primary attempts, one fallback-1 use.
    let usage = state.scraper.usage();
    assert_eq!(usage.primary, 3);
    assert_eq!(usage.fallback1, 1);
    assert_eq!(usage.fallback2, 0);

    assert_eq!(outcome.report.sources.len(), 2); // ceil(0.5 × 3)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario E: verification trusts the source over training data
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_e_verification_supports_post_cutoff_claim() {
    let transport = Arc::new(StageTransport::new(
        PLAN_JSON,
        "## Overview\n\nBackground [Source 1]. President X signed the bill [Source 2].",
        vec![],
    ));
    let embedder = Arc::new(CountingEmbedder::new());
    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        result("https://a.org/background", 1),
        result("https://news.example/bill", 2),
    ]]));

    let mut fetcher = MapFetcher::default();
    fetcher
        .html
        .insert("https://a.org/background".into(), article_html("Background"));
    fetcher.html.insert(
        "https://news.example/bill".into(),
        format!(
            "<html><head><title>Bill signed</title></head><body><article><p>President X signed the bill into law on Tuesday. {}</p></article></body></html>",
            "Further coverage of the ceremony and reactions from lawmakers. ".repeat(8)
        ),
    );

    let settings = Settings {
        top_k_url: 1.0,
        top_k_sum: 1.0,
        verify_claims: true,
        ..base_settings()
    };
    let state = build_state(settings, transport.clone(), embedder, provider, fetcher);
    let outcome = Orchestrator::new(state)
        .run("Did President X sign the bill?", CancellationToken::new(), RunOptions::default())
        .await
        .unwrap();

    let verification = outcome.verification.expect("verification ran");
    assert_eq!(verification.total, 1);
    assert_eq!(verification.supported, 1);
    let checked = &verification.results[0];
    assert!(checked.confidence >= 0.8);
    assert!(verification.flagged.is_empty());

    // The verification prompt declared the source authoritative and dated.
    let prompts = transport.verify_prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("authoritative over your training data"));
    assert!(prompts[0].contains(&format!("{}", chrono::Utc::now().format("%Y-%m-%d"))));
    assert!(prompts[0].contains("President X signed the bill"));
}
