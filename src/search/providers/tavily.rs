//! Tavily provider: JSON POST with a native `exclude_domains` parameter.
//! Tavily has no scholar endpoint; scholar queries run against the general
//! topic, biased with an "academic" hint.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::types::SearchResult;
use crate::search::{SearchKind, SearchProvider};

const BASE_URL: &str = "https://api.tavily.com/search";

pub struct TavilyProvider {
    client: reqwest::Client,
    api_key: String,
}

impl TavilyProvider {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    fn tag(&self) -> &'static str {
        "tavily"
    }

    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        n: usize,
        exclude_domains: &[String],
    ) -> anyhow::Result<Vec<SearchResult>> {
        let (topic, effective_query) = match kind {
            SearchKind::Web => ("general", query.to_string()),
            SearchKind::News => ("news", query.to_string()),
            SearchKind::Scholar => ("general", format!("{} academic paper study", query)),
        };

        let body = json!({
            "api_key": self.api_key,
            "query": effective_query,
            "topic": topic,
            "max_results": n,
            "exclude_domains": exclude_domains,
        });

        let response = self.client.post(BASE_URL).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("tavily HTTP {}", status);
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
            snippet: entry["content"].as_str().unwrap_or_default().to_string(),
            // Tavily returns results ordered but unnumbered.
            rank: (out.len() + 1) as u32,
            provider_tag: "tavily".to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ranks_are_contiguous_from_one() {
        let envelope = json!({
            "results": [
                {"url": "https://a.org", "title": "A", "content": "ca"},
                {"url": "", "title": "skipped"},
                {"url": "https://b.org", "title": "B", "content": "cb"}
            ]
        });
        let out = parse_results(&envelope, 10);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].rank, 1);
        assert_eq!(out[1].rank, 2);
    }
}
