//! SERP-API-style provider: one GET per query, engine selected by kind.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;

use crate::core::types::SearchResult;
use crate::search::{with_site_exclusions, SearchKind, SearchProvider};

const BASE_URL: &str = "https://serpapi.com/search.json";

pub struct SerpProvider {
    client: reqwest::Client,
    api_key: String,
}

impl SerpProvider {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }

    fn engine_for(kind: SearchKind) -> &'static str {
        match kind {
            SearchKind::Web => "google",
            SearchKind::News => "google_news",
            SearchKind::Scholar => "google_scholar",
        }
    }

    /// The results array key differs per engine.
    fn results_key(kind: SearchKind) -> &'static str {
        match kind {
            SearchKind::News => "news_results",
            _ => "organic_results",
        }
    }
}

#[async_trait]
impl SearchProvider for SerpProvider {
    fn tag(&self) -> &'static str {
        "serp"
    }

    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        n: usize,
        exclude_domains: &[String],
    ) -> anyhow::Result<Vec<SearchResult>> {
        let effective = with_site_exclusions(query, exclude_domains);
        let encoded = utf8_percent_encode(&effective, NON_ALPHANUMERIC).to_string();
        let url = format!(
            "{}?engine={}&q={}&num={}&api_key={}",
            BASE_URL,
            Self::engine_for(kind),
            encoded,
            n,
            self.api_key
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("serp HTTP {}", status);
        }
        let body: Value = response.json().await?;

        Ok(parse_results(&body, Self::results_key(kind), n))
    }
}

fn parse_results(body: &Value, key: &str, n: usize) -> Vec<SearchResult> {
    let Some(entries) = body[key].as_array() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries.iter().take(n) {
        let link = entry["link"].as_str().unwrap_or_default();
        if link.is_empty() {
            continue;
        }
        let position = entry["position"]
            .as_u64()
            .unwrap_or((out.len() + 1) as u64);
        out.push(SearchResult {
            url: link.to_string(),
            title: entry["title"].as_str().unwrap_or_default().to_string(),
            snippet: entry["snippet"].as_str().unwrap_or_default().to_string(),
            rank: position as u32,
            provider_tag: "serp".to_string(),
        });
    }
    out
}
