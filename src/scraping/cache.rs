//! Run-scoped scrape cache with single-flight semantics.
//!
//! Keyed by canonical URL. Concurrent requests for the same key join the one
//! in-flight fetch instead of issuing their own; the verifier consults the
//! same cache so verification never re-fetches what the pipeline already
//! scraped. Discarded at end of run.

use std::future::Future;

use crate::core::types::ScrapedContent;

#[derive(Clone)]
pub struct ScrapeCache {
    inner: moka::future::Cache<String, ScrapedContent>,
}

impl Default for ScrapeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrapeCache {
    pub fn new() -> Self {
        Self {
            inner: moka::future::Cache::builder().max_capacity(10_000).build(),
        }
    }

    /// Return the cached entry for `url`, or run `fetch` exactly once;
    /// concurrent callers for the same key await the same in-flight future.
    /// Empty-bodied results are cached too: a URL that failed all tiers is
    /// not retried within the run.
    pub async fn get_or_fetch<F>(&self, url: &str, fetch: F) -> ScrapedContent
    where
        F: Future<Output = ScrapedContent>,
    {
        self.inner.get_with(url.to_string(), fetch).await
    }

    /// Read-only lookup (verifier path).
    pub async fn get(&self, url: &str) -> Option<ScrapedContent> {
        self.inner.get(url).await
    }

    pub async fn contains(&self, url: &str) -> bool {
        self.inner.contains_key(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExtractorTier;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn content(url: &str) -> ScrapedContent {
        ScrapedContent {
            url: url.into(),
            title: "t".into(),
            markdown_body: "body text long enough".into(),
            retrieved_at: chrono::Utc::now(),
            extractor_tier: ExtractorTier::Primary,
            tables_found: 0,
            tables_converted: 0,
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let cache = ScrapeCache::new();
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("https://example.org/page", async {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        // Hold the flight open long enough for others to join.
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        content("https://example.org/page")
                    })
                    .await
            }));
        }

        for handle in handles {
            let got = handle.await.unwrap();
            assert_eq!(got.url, "https://example.org/page");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_results_are_cached_not_retried() {
        let cache = ScrapeCache::new();
        let fetches = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let fetches = fetches.clone();
            cache
                .get_or_fetch("https://example.org/dead", async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    ScrapedContent {
                        markdown_body: String::new(),
                        extractor_tier: ExtractorTier::Fallback2,
                        ..content("https://example.org/dead")
                    }
                })
                .await;
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(cache.get("https://example.org/dead").await.unwrap().is_unavailable());
    }
}
