//! Perplexity search provider. No native exclusion parameter, so the
//! exclusion list rides as `-site:` hints; the service-level post-filter
//! catches anything the vendor ignores.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::types::SearchResult;
use crate::search::{with_site_exclusions, SearchKind, SearchProvider};

const BASE_URL: &str = "https://api.perplexity.ai/search";

pub struct PerplexityProvider {
    client: reqwest::Client,
    api_key: String,
}

impl PerplexityProvider {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }

    fn search_mode(kind: SearchKind) -> &'static str {
        match kind {
            SearchKind::Web => "web",
            SearchKind::News => "news",
            SearchKind::Scholar => "academic",
        }
    }
}

#[async_trait]
impl SearchProvider for PerplexityProvider {
    fn tag(&self) -> &'static str {
        "perplexity"
    }

    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        n: usize,
        exclude_domains: &[String],
    ) -> anyhow::Result<Vec<SearchResult>> {
        let body = json!({
            "query": with_site_exclusions(query, exclude_domains),
            "search_mode": Self::search_mode(kind),
            "max_results": n,
        });

        let response = self
            .client
            .post(BASE_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("perplexity HTTP {}", status);
        }
        let envelope: Value = response.json().await?;

        Ok(parse_results(&envelope, n))
    }
}

fn parse_results(envelope: &Value, n: usize) -> Vec<SearchResult> {
    let Some(entries) = envelope["results"].as_array() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries.iter().take(n) {
        let url = entry["url"].as_str().unwrap_or_default();
        if url.is_empty() {
            continue;
        }
        out.push(SearchResult {
            url: url.to_string(),
            title: entry["title"].as_str().unwrap_or_default().to_string(),
            snippet: entry["snippet"].as_str().unwrap_or_default().to_string(),
            rank: (out.len() + 1) as u32,
            provider_tag: "perplexity".to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scholar_maps_to_academic_mode() {
        assert_eq!(PerplexityProvider::search_mode(SearchKind::Scholar), "academic");
        assert_eq!(PerplexityProvider::search_mode(SearchKind::News), "news");
    }

    #[test]
    fn parse_caps_at_n() {
        let envelope = json!({
            "results": [
                {"url": "https://a.org", "title": "A", "snippet": "s"},
                {"url": "https://b.org", "title": "B", "snippet": "s"},
                {"url": "https://c.org", "title": "C", "snippet": "s"}
            ]
        });
        assert_eq!(parse_results(&envelope, 2).len(), 2);
    }
}
