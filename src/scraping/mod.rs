//! Three-tier scraping with a run-scoped single-flight cache.
//!
//! Tier cascade per URL: local HTML fetch + Markdown conversion → external
//! markdown-extractor service (JS-capable) → external scrape API. A tier is
//! abandoned on HTTP error, a converted body under 200 chars, or timeout.
//! Every URL yields a `ScrapedContent`; an empty body marks a URL that
//! exhausted the cascade.

pub mod cache;
pub mod markdown;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::types::{ExtractorTier, ScrapedContent};
use crate::summarize::tables::parse_pipe_tables;
use cache::ScrapeCache;
use markdown::html_to_markdown;

/// A converted body below this size triggers the next tier.
const MIN_BODY_CHARS: usize = 200;

// ─────────────────────────────────────────────────────────────────────────────
// Fetch seam
// ─────────────────────────────────────────────────────────────────────────────

/// Raw page access for the three tiers. The cascade, cache, and counters live
/// in [`Scraper`]; implementations only move bytes.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Tier 1: fetch raw HTML locally.
    async fn fetch_html(&self, url: &str) -> anyhow::Result<String>;

    /// Tier 2: JS-capable extractor service returning Markdown.
    async fn fetch_rendered_markdown(&self, url: &str) -> anyhow::Result<String>;

    /// Tier 3: scrape API returning `(markdown, title)`.
    async fn fetch_via_api(&self, url: &str) -> anyhow::Result<(String, String)>;

    fn markdown_service_configured(&self) -> bool {
        true
    }
    fn scrape_api_configured(&self) -> bool {
        true
    }
}

pub struct HttpPageFetcher {
    client: reqwest::Client,
    markdown_service_url: Option<String>,
    scrape_api_url: Option<String>,
    scrape_api_key: Option<String>,
}

impl HttpPageFetcher {
    pub fn new(
        client: reqwest::Client,
        markdown_service_url: Option<String>,
        scrape_api_url: Option<String>,
        scrape_api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            markdown_service_url,
            scrape_api_url,
            scrape_api_key,
        }
    }
}

const USER_AGENT: &str = concat!("dossier/", env!("CARGO_PKG_VERSION"));

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_html(&self, url: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "text/html,application/xhtml+xml")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {}", status);
        }
        Ok(response.text().await?)
    }

    async fn fetch_rendered_markdown(&self, url: &str) -> anyhow::Result<String> {
        let Some(base) = &self.markdown_service_url else {
            anyhow::bail!("markdown service not configured");
        };
        // Reader-style service: GET {base}/{url} returns the page as Markdown.
        let endpoint = format!("{}/{}", base.trim_end_matches('/'), url);
        let response = self
            .client
            .get(&endpoint)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("markdown service HTTP {}", status);
        }
        Ok(response.text().await?)
    }

    async fn fetch_via_api(&self, url: &str) -> anyhow::Result<(String, String)> {
        let Some(base) = &self.scrape_api_url else {
            anyhow::bail!("scrape API not configured");
        };
        let mut request = self
            .client
            .post(base)
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({ "url": url, "format": "markdown" }));
        if let Some(key) = &self.scrape_api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("scrape API HTTP {}", status);
        }
        let envelope: serde_json::Value = response.json().await?;
        let content = envelope["content"].as_str().unwrap_or_default().to_string();
        let title = envelope["title"].as_str().unwrap_or_default().to_string();
        Ok((content, title))
    }

    fn markdown_service_configured(&self) -> bool {
        self.markdown_service_url.is_some()
    }

    fn scrape_api_configured(&self) -> bool {
        self.scrape_api_url.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tier usage accounting (observability only)
// ─────────────────────────────────────────────────────────────────────────────

/// Estimated cost per call, USD. Tier 1 is local and free.
const FALLBACK1_COST: f64 = 0.001;
const FALLBACK2_COST: f64 = 0.002;

#[derive(Default)]
pub struct TierUsage {
    primary: AtomicU64,
    fallback1: AtomicU64,
    fallback2: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TierUsageSnapshot {
    pub primary: u64,
    pub fallback1: u64,
    pub fallback2: u64,
    pub estimated_cost_usd: f64,
}

impl TierUsage {
    fn record(&self, tier: ExtractorTier) {
        match tier {
            ExtractorTier::Primary => self.primary.fetch_add(1, Ordering::Relaxed),
            ExtractorTier::Fallback1 => self.fallback1.fetch_add(1, Ordering::Relaxed),
            ExtractorTier::Fallback2 => self.fallback2.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> TierUsageSnapshot {
        let fallback1 = self.fallback1.load(Ordering::Relaxed);
        let fallback2 = self.fallback2.load(Ordering::Relaxed);
        TierUsageSnapshot {
            primary: self.primary.load(Ordering::Relaxed),
            fallback1,
            fallback2,
            estimated_cost_usd: fallback1 as f64 * FALLBACK1_COST
                + fallback2 as f64 * FALLBACK2_COST,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scraper
// ─────────────────────────────────────────────────────────────────────────────

pub struct Scraper {
    fetcher: Arc<dyn PageFetcher>,
    cache: ScrapeCache,
    usage: Arc<TierUsage>,
    preserve_tables: bool,
    tier_timeout: Duration,
    parallel: usize,
}

impl Scraper {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        preserve_tables: bool,
        tier_timeout: Duration,
        parallel: usize,
    ) -> Self {
        Self {
            fetcher,
            cache: ScrapeCache::new(),
            usage: Arc::new(TierUsage::default()),
            preserve_tables,
            tier_timeout,
            parallel: parallel.max(1),
        }
    }

    /// The run-scoped cache, shared with the verifier.
    pub fn cache(&self) -> &ScrapeCache {
        &self.cache
    }

    pub fn usage(&self) -> TierUsageSnapshot {
        self.usage.snapshot()
    }

    /// Scrape one canonical URL through the cache. Concurrent calls for the
    /// same URL perform exactly one fetch cascade.
    pub async fn scrape_url(&self, url: &str) -> ScrapedContent {
        self.cache.get_or_fetch(url, self.cascade(url)).await
    }

    /// Scrape many URLs with bounded parallelism. One failing URL never
    /// cancels the batch. Gather order is completion order; callers re-impose
    /// their upstream ranking.
    pub async fn scrape_many(
        &self,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> HashMap<String, ScrapedContent> {
        info!(
            urls = urls.len(),
            parallel = self.parallel,
            "starting scrape batch"
        );

        let results: Vec<Option<(String, ScrapedContent)>> = stream::iter(urls.iter().cloned())
            .map(|url| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let content = self.scrape_url(&url).await;
                    Some((url, content))
                }
            })
            .buffer_unordered(self.parallel)
            .collect()
            .await;

        results.into_iter().flatten().collect()
    }

    async fn cascade(&self, url: &str) -> ScrapedContent {
        // ── Tier 1: local fetch + conversion ─────────────────────────────
        self.usage.record(ExtractorTier::Primary);
        match tokio::time::timeout(self.tier_timeout, self.fetcher.fetch_html(url)).await {
            Ok(Ok(html)) => {
                if let Ok(base) = url::Url::parse(url) {
                    let outcome = html_to_markdown(&html, &base, self.preserve_tables);
                    if outcome.markdown.chars().count() >= MIN_BODY_CHARS {
                        return ScrapedContent {
                            url: url.to_string(),
                            title: outcome.title,
                            markdown_body: outcome.markdown,
                            retrieved_at: Utc::now(),
                            extractor_tier: ExtractorTier::Primary,
                            tables_found: outcome.tables_found,
                            tables_converted: outcome.tables_converted,
                        };
                    }
                    debug!(url, chars = outcome.markdown.chars().count(), "primary body below minimum");
                }
            }
            Ok(Err(e)) => warn!(
                stage = "scrape",
                item = url,
                error_kind = "scrape_failed",
                cause = %e,
                "primary tier failed"
            ),
            Err(_) => warn!(
                stage = "scrape",
                item = url,
                error_kind = "scrape_failed",
                cause = "timeout",
                "primary tier timed out"
            ),
        }

        // ── Tier 2: markdown-extractor service ───────────────────────────
        if self.fetcher.markdown_service_configured() {
            self.usage.record(ExtractorTier::Fallback1);
            match tokio::time::timeout(self.tier_timeout, self.fetcher.fetch_rendered_markdown(url))
                .await
            {
                Ok(Ok(md)) if md.chars().count() >= MIN_BODY_CHARS => {
                    return self.from_markdown(url, md, None, ExtractorTier::Fallback1);
                }
                Ok(Ok(md)) => {
                    debug!(url, chars = md.chars().count(), "fallback1 body below minimum")
                }
                Ok(Err(e)) => warn!(
                    stage = "scrape",
                    item = url,
                    error_kind = "scrape_failed",
                    cause = %e,
                    "fallback1 tier failed"
                ),
                Err(_) => warn!(
                    stage = "scrape",
                    item = url,
                    error_kind = "scrape_failed",
                    cause = "timeout",
                    "fallback1 tier timed out"
                ),
            }
        } else {
            debug!(url, "fallback1 tier not configured, skipping");
        }

        // ── Tier 3: scrape API (last tier, accept what it returns) ────────
        if self.fetcher.scrape_api_configured() {
            self.usage.record(ExtractorTier::Fallback2);
            match tokio::time::timeout(self.tier_timeout, self.fetcher.fetch_via_api(url)).await {
                Ok(Ok((md, title))) => {
                    let title = if title.is_empty() { None } else { Some(title) };
                    return self.from_markdown(url, md, title, ExtractorTier::Fallback2);
                }
                Ok(Err(e)) => warn!(
                    stage = "scrape",
                    item = url,
                    error_kind = "scrape_failed",
                    cause = %e,
                    "fallback2 tier failed"
                ),
                Err(_) => warn!(
                    stage = "scrape",
                    item = url,
                    error_kind = "scrape_failed",
                    cause = "timeout",
                    "fallback2 tier timed out"
                ),
            }
        } else {
            debug!(url, "fallback2 tier not configured, skipping");
        }

        // Cascade exhausted: empty body, downstream treats as unavailable.
        ScrapedContent {
            url: url.to_string(),
            title: String::new(),
            markdown_body: String::new(),
            retrieved_at: Utc::now(),
            extractor_tier: ExtractorTier::Fallback2,
            tables_found: 0,
            tables_converted: 0,
        }
    }

    fn from_markdown(
        &self,
        url: &str,
        markdown: String,
        title: Option<String>,
        tier: ExtractorTier,
    ) -> ScrapedContent {
        let tables = parse_pipe_tables(&markdown).len();
        let title = title
            .or_else(|| title_from_markdown(&markdown))
            .or_else(|| url::Url::parse(url).ok()?.host_str().map(str::to_string))
            .unwrap_or_default();
        ScrapedContent {
            url: url.to_string(),
            title,
            markdown_body: markdown,
            retrieved_at: Utc::now(),
            extractor_tier: tier,
            tables_found: tables,
            tables_converted: tables,
        }
    }
}

fn title_from_markdown(md: &str) -> Option<String> {
    md.lines()
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Per-URL scripted fetcher used to drive the cascade.
    #[derive(Default)]
    struct ScriptedFetcher {
        html: Mutex<HashMap<String, anyhow::Result<String>>>,
        rendered: Mutex<HashMap<String, anyhow::Result<String>>>,
        api: Mutex<HashMap<String, anyhow::Result<(String, String)>>>,
        markdown_service: bool,
        scrape_api: bool,
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_html(&self, url: &str) -> anyhow::Result<String> {
            self.html
                .lock()
                .unwrap()
                .remove(url)
                .unwrap_or_else(|| Err(anyhow::anyhow!("no script")))
        }
        async fn fetch_rendered_markdown(&self, url: &str) -> anyhow::Result<String> {
            self.rendered
                .lock()
                .unwrap()
                .remove(url)
                .unwrap_or_else(|| Err(anyhow::anyhow!("no script")))
        }
        async fn fetch_via_api(&self, url: &str) -> anyhow::Result<(String, String)> {
            self.api
                .lock()
                .unwrap()
                .remove(url)
                .unwrap_or_else(|| Err(anyhow::anyhow!("no script")))
        }
        fn markdown_service_configured(&self) -> bool {
            self.markdown_service
        }
        fn scrape_api_configured(&self) -> bool {
            self.scrape_api
        }
    }

    fn long_markdown() -> String {
        format!("# Rendered Title\n\n{}", "substantive content ".repeat(30))
    }

    fn article_html() -> String {
        format!(
            "<html><head><title>Primary Title</title></head><body><article><p>{}</p></article></body></html>",
            "plenty of readable article prose here to satisfy readability and the size gate. "
                .repeat(10)
        )
    }

    fn scraper(fetcher: ScriptedFetcher) -> Scraper {
        Scraper::new(
            Arc::new(fetcher),
            true,
            Duration::from_secs(15),
            4,
        )
    }

    #[tokio::test]
    async fn primary_tier_succeeds_without_touching_fallbacks() {
        let fetcher = ScriptedFetcher {
            markdown_service: true,
            scrape_api: true,
            ..Default::default()
        };
        fetcher
            .html
            .lock()
            .unwrap()
            .insert("https://a.org/x".into(), Ok(article_html()));

        let s = scraper(fetcher);
        let got = s.scrape_url("https://a.org/x").await;
        assert_eq!(got.extractor_tier, ExtractorTier::Primary);
        assert_eq!(got.title, "Primary Title");

        let usage = s.usage();
        assert_eq!(usage.primary, 1);
        assert_eq!(usage.fallback1, 0);
        assert_eq!(usage.fallback2, 0);
        assert_eq!(usage.estimated_cost_usd, 0.0);
    }

    #[tokio::test]
    async fn short_primary_body_falls_through_to_markdown_service() {
        let fetcher = ScriptedFetcher {
            markdown_service: true,
            scrape_api: true,
            ..Default::default()
        };
        // Under 200 converted chars → tier transition.
        fetcher
            .html
            .lock()
            .unwrap()
            .insert("https://b.org/y".into(), Ok("<html><body><p>tiny</p></body></html>".into()));
        fetcher
            .rendered
            .lock()
            .unwrap()
            .insert("https://b.org/y".into(), Ok(long_markdown()));

        let s = scraper(fetcher);
        let got = s.scrape_url("https://b.org/y").await;
        assert_eq!(got.extractor_tier, ExtractorTier::Fallback1);
        assert_eq!(got.title, "Rendered Title");

        let usage = s.usage();
        assert_eq!(usage.primary, 1);
        assert_eq!(usage.fallback1, 1);
        assert_eq!(usage.fallback2, 0);
        assert!((usage.estimated_cost_usd - FALLBACK1_COST).abs() < 1e-12);
    }

    #[tokio::test]
    async fn exhausted_cascade_yields_empty_fallback2_content() {
        let fetcher = ScriptedFetcher {
            markdown_service: true,
            scrape_api: true,
            ..Default::default()
        };
        let s = scraper(fetcher);
        let got = s.scrape_url("https://dead.org/z").await;
        assert!(got.is_unavailable());
        assert_eq!(got.extractor_tier, ExtractorTier::Fallback2);
    }

    #[tokio::test]
    async fn unconfigured_tiers_are_skipped_without_usage() {
        let fetcher = ScriptedFetcher::default(); // no fallbacks configured
        let s = scraper(fetcher);
        let got = s.scrape_url("https://dead.org/z").await;
        assert!(got.is_unavailable());
        let usage = s.usage();
        assert_eq!(usage.primary, 1);
        assert_eq!(usage.fallback1, 0);
        assert_eq!(usage.fallback2, 0);
    }

    #[tokio::test]
    async fn scrape_many_is_failure_isolated() {
        let fetcher = ScriptedFetcher {
            markdown_service: false,
            scrape_api: false,
            ..Default::default()
        };
        fetcher
            .html
            .lock()
            .unwrap()
            .insert("https://ok.org/a".into(), Ok(article_html()));
        // dead.org has no script → fails, but the batch completes.

        let s = scraper(fetcher);
        let cancel = CancellationToken::new();
        let got = s
            .scrape_many(
                &["https://ok.org/a".to_string(), "https://dead.org/b".to_string()],
                &cancel,
            )
            .await;
        assert_eq!(got.len(), 2);
        assert!(!got["https://ok.org/a"].is_unavailable());
        assert!(got["https://dead.org/b"].is_unavailable());
    }
}
