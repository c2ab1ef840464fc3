pub mod providers;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::types::{IntentKind, SearchQuery, SearchResult};

// ─────────────────────────────────────────────────────────────────────────────
// Provider capability
// ─────────────────────────────────────────────────────────────────────────────

/// Which vendor endpoint family a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchKind {
    Web,
    News,
    Scholar,
}

impl SearchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::News => "news",
            Self::Scholar => "scholar",
        }
    }
}

/// Search kind for a classified intent: news → news, research → scholar,
/// everything else → web.
pub fn kind_for_intent(intent: IntentKind) -> SearchKind {
    match intent {
        IntentKind::News => SearchKind::News,
        IntentKind::Research => SearchKind::Scholar,
        _ => SearchKind::Web,
    }
}

/// Uniform search capability over concrete vendors. Implementations map
/// `kind` to their native endpoint, apply the exclusion list natively where
/// the vendor supports it (and as `-site:` hints otherwise), and return raw
/// vendor-ranked results with 1-based positions.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn tag(&self) -> &'static str;

    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        n: usize,
        exclude_domains: &[String],
    ) -> anyhow::Result<Vec<SearchResult>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// URL canonicalization
// ─────────────────────────────────────────────────────────────────────────────

/// Canonical form used for deduplication and as the scrape-cache key:
/// lowercase scheme+host, no fragment, common tracking params dropped, no
/// trailing slash.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = url::Url::parse(trimmed) else {
        return trimmed.trim_end_matches('/').to_string();
    };

    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| {
                let k = k.to_ascii_lowercase();
                !(k.starts_with("utm_")
                    || matches!(
                        k.as_str(),
                        "gclid" | "fbclid" | "yclid" | "mc_cid" | "mc_eid" | "ref" | "ref_src"
                    ))
            })
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            let mut sorted = kept;
            sorted.sort();
            parsed.set_query(None);
            let mut qp = parsed.query_pairs_mut();
            for (k, v) in sorted {
                qp.append_pair(&k, &v);
            }
        }
    }

    let mut s = parsed.to_string();
    while s.ends_with('/') && !s.ends_with("://") {
        s.pop();
    }
    s
}

/// True when the URL's host is the excluded domain or one of its subdomains.
pub fn host_excluded(url: &str, exclude_domains: &[String]) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    exclude_domains
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
}

/// Append `-site:` hints for vendors without a native exclusion parameter.
pub fn with_site_exclusions(query: &str, exclude_domains: &[String]) -> String {
    if exclude_domains.is_empty() {
        return query.to_string();
    }
    let hints = exclude_domains
        .iter()
        .map(|d| format!("-site:{}", d))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{} {}", query, hints)
}

// ─────────────────────────────────────────────────────────────────────────────
// SearchService: provider wrapper with post-filtering and a per-run cache
// ─────────────────────────────────────────────────────────────────────────────

/// Wraps the selected provider with the discipline every caller relies on:
/// per-query failures never propagate (empty result + one WARNING record),
/// results are canonicalized and domain-post-filtered, ranks are renumbered
/// contiguous from 1, and identical queries within a run hit a cache instead
/// of the vendor.
pub struct SearchService {
    provider: Arc<dyn SearchProvider>,
    exclude_domains: Vec<String>,
    results_per_query: usize,
    cache: moka::future::Cache<String, Vec<SearchResult>>,
}

impl SearchService {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        exclude_domains: Vec<String>,
        results_per_query: usize,
    ) -> Self {
        Self {
            provider,
            exclude_domains,
            results_per_query,
            cache: moka::future::Cache::builder()
                .max_capacity(1_000)
                .time_to_live(std::time::Duration::from_secs(60 * 10))
                .build(),
        }
    }

    pub fn provider_tag(&self) -> &'static str {
        self.provider.tag()
    }

    /// Run one planned query. Infallible by contract: a vendor failure is a
    /// logged WARNING and an empty result set.
    pub async fn run(&self, query: &SearchQuery, kind: SearchKind) -> Vec<SearchResult> {
        let cache_key = format!("{}|{}|{}", kind.as_str(), self.results_per_query, query.text);
        if let Some(cached) = self.cache.get(&cache_key).await {
            debug!(query = %query.text, "search cache hit");
            return cached;
        }

        let raw = match self
            .provider
            .search(
                &query.text,
                kind,
                self.results_per_query,
                &self.exclude_domains,
            )
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(
                    stage = "search",
                    item = %query.text,
                    error_kind = "search_failed",
                    cause = %e,
                    "provider query failed, continuing with no results"
                );
                return Vec::new();
            }
        };

        let results = self.normalize(raw);
        self.cache.insert(cache_key, results.clone()).await;
        results
    }

    /// Canonicalize, drop excluded domains (belt and braces: the provider
    /// already sent exclusion hints), renumber ranks contiguously from 1.
    fn normalize(&self, raw: Vec<SearchResult>) -> Vec<SearchResult> {
        let mut out = Vec::with_capacity(raw.len());
        for mut r in raw {
            let canonical = canonical_url(&r.url);
            if canonical.is_empty() || !canonical.starts_with("http") {
                continue;
            }
            if host_excluded(&canonical, &self.exclude_domains) {
                debug!(url = %canonical, "dropping excluded domain");
                continue;
            }
            r.url = canonical;
            out.push(r);
        }
        for (i, r) in out.iter_mut().enumerate() {
            r.rank = (i + 1) as u32;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(url: &str, rank: u32) -> SearchResult {
        SearchResult {
            url: url.into(),
            title: format!("title {rank}"),
            snippet: String::new(),
            rank,
            provider_tag: "stub".into(),
        }
    }

    struct StaticProvider(Vec<SearchResult>);

    #[async_trait]
    impl SearchProvider for StaticProvider {
        fn tag(&self) -> &'static str {
            "stub"
        }
        async fn search(
            &self,
            _query: &str,
            _kind: SearchKind,
            _n: usize,
            _exclude: &[String],
        ) -> anyhow::Result<Vec<SearchResult>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn canonical_url_normalizes() {
        assert_eq!(
            canonical_url("HTTPS://Example.COM/Path/#frag"),
            "https://example.com/Path"
        );
        assert_eq!(
            canonical_url("https://example.com/a?utm_source=x&b=1"),
            "https://example.com/a?b=1"
        );
        assert_eq!(canonical_url("https://example.com/"), "https://example.com");
        // Identical pages collapse to one key.
        assert_eq!(
            canonical_url("https://example.com/a/"),
            canonical_url("https://EXAMPLE.com/a#section")
        );
    }

    #[test]
    fn kind_selection_follows_intent() {
        assert_eq!(kind_for_intent(IntentKind::News), SearchKind::News);
        assert_eq!(kind_for_intent(IntentKind::Research), SearchKind::Scholar);
        assert_eq!(kind_for_intent(IntentKind::Code), SearchKind::Web);
        assert_eq!(kind_for_intent(IntentKind::General), SearchKind::Web);
    }

    #[test]
    fn host_exclusion_covers_subdomains() {
        let exclude = vec!["example.com".to_string()];
        assert!(host_excluded("https://example.com/a", &exclude));
        assert!(host_excluded("https://www.example.com/a", &exclude));
        assert!(!host_excluded("https://notexample.com/a", &exclude));
    }

    #[test]
    fn site_exclusion_hints_appended() {
        let q = with_site_exclusions("http3 adoption", &["example.com".into(), "x.org".into()]);
        assert_eq!(q, "http3 adoption -site:example.com -site:x.org");
    }

    #[tokio::test]
    async fn excluded_domains_are_post_filtered_even_if_vendor_ignored_hints() {
        let provider = StaticProvider(vec![
            result("https://example.com/ignored-the-hint", 1),
            result("https://kept.org/a", 2),
            result("https://sub.example.com/also-ignored", 3),
        ]);
        let service = SearchService::new(Arc::new(provider), vec!["example.com".into()], 10);
        let out = service
            .run(
                &SearchQuery {
                    text: "q".into(),
                    purpose: String::new(),
                    priority: 1,
                },
                SearchKind::Web,
            )
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].url, "https://kept.org/a");
        // Ranks renumbered contiguously from 1 after filtering.
        assert_eq!(out[0].rank, 1);
    }
}
