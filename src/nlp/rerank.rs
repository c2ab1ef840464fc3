//! Optional external reranker.
//!
//! When enabled, documents go to a rerank endpoint
//! (`{model, query, documents, top_n}` → indexed relevance scores) and come
//! back reordered. Disabled or failing, the reranker is the identity
//! truncated to `top_k`: original order, no invented scores.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::core::types::{SearchResult, Summary};

/// Anything the reranker can score.
pub trait RerankDoc {
    fn doc_text(&self) -> String;
}

impl RerankDoc for SearchResult {
    fn doc_text(&self) -> String {
        format!("{}\n{}", self.title, self.snippet)
    }
}

impl RerankDoc for Summary {
    fn doc_text(&self) -> String {
        let head: String = self.text.chars().take(1_000).collect();
        format!("{}\n{}", self.title, head)
    }
}

#[derive(Debug, Clone)]
pub struct RerankedItem<T> {
    pub item: T,
    /// Present only when the external reranker actually scored the item.
    pub score: Option<f32>,
}

pub struct Reranker {
    client: reqwest::Client,
    endpoint: Option<String>,
    model: String,
    api_key: Option<String>,
}

impl Reranker {
    /// `endpoint = None` (or `use_reranker = false` upstream) constructs a
    /// permanently-identity reranker.
    pub fn new(
        client: reqwest::Client,
        endpoint: Option<String>,
        model: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            model: model.unwrap_or_else(|| "rerank-base".to_string()),
            api_key,
        }
    }

    pub fn disabled(client: reqwest::Client) -> Self {
        Self::new(client, None, None, None)
    }

    /// Rerank `items` against `query`, returning at most `top_k`. Must not
    /// panic on empty input; any failure degrades to identity order.
    pub async fn rerank<T: RerankDoc>(
        &self,
        query: &str,
        items: Vec<T>,
        top_k: usize,
    ) -> Vec<RerankedItem<T>> {
        if items.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let Some(endpoint) = &self.endpoint else {
            return identity(items, top_k);
        };

        let documents: Vec<String> = items.iter().map(RerankDoc::doc_text).collect();
        let body = json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": top_k,
        });

        let mut request = self.client.post(endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(
                    stage = "rerank",
                    error_kind = "rerank_failed",
                    cause = %r.status(),
                    "reranker returned an error status, using identity order"
                );
                return identity(items, top_k);
            }
            Err(e) => {
                warn!(
                    stage = "rerank",
                    error_kind = "rerank_failed",
                    cause = %e,
                    "reranker unreachable, using identity order"
                );
                return identity(items, top_k);
            }
        };

        let envelope: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    stage = "rerank",
                    error_kind = "rerank_failed",
                    cause = %e,
                    "reranker response unparseable, using identity order"
                );
                return identity(items, top_k);
            }
        };

        if !envelope["results"].is_array() {
            warn!(
                stage = "rerank",
                error_kind = "rerank_failed",
                cause = "no results array",
                "reranker response unusable, using identity order"
            );
            return identity(items, top_k);
        }

        let ordered = order_by_response(items, &envelope, top_k).unwrap_or_default();
        debug!(kept = ordered.len(), "external rerank applied");
        ordered
    }
}

fn identity<T>(items: Vec<T>, top_k: usize) -> Vec<RerankedItem<T>> {
    items
        .into_iter()
        .take(top_k)
        .map(|item| RerankedItem { item, score: None })
        .collect()
}

/// Apply `{"results": [{"index": N, "relevance_score": f}, …]}` to `items`.
/// Entries are taken in response order (the service sorts by score); invalid
/// or duplicate indices are skipped. Returns `None` when the envelope has no
/// results array at all.
fn order_by_response<T>(
    items: Vec<T>,
    envelope: &Value,
    top_k: usize,
) -> Option<Vec<RerankedItem<T>>> {
    let results = envelope["results"].as_array()?;

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut ordered = Vec::new();

    for entry in results {
        if ordered.len() >= top_k {
            break;
        }
        let Some(index) = entry["index"].as_u64().map(|i| i as usize) else {
            continue;
        };
        let score = entry["relevance_score"].as_f64().map(|s| s as f32);
        if let Some(slot) = slots.get_mut(index) {
            if let Some(item) = slot.take() {
                ordered.push(RerankedItem { item, score });
            }
        }
    }

    Some(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(url: &str) -> SearchResult {
        SearchResult {
            url: url.into(),
            title: url.into(),
            snippet: String::new(),
            rank: 1,
            provider_tag: "stub".into(),
        }
    }

    #[tokio::test]
    async fn disabled_reranker_is_identity_truncated() {
        let reranker = Reranker::disabled(reqwest::Client::new());
        let items = vec![result("a"), result("b"), result("c")];
        let out = reranker.rerank("q", items, 2).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].item.url, "a");
        assert_eq!(out[1].item.url, "b");
        assert!(out[0].score.is_none());
    }

    #[tokio::test]
    async fn empty_input_does_not_panic() {
        let reranker = Reranker::disabled(reqwest::Client::new());
        let out: Vec<RerankedItem<SearchResult>> = reranker.rerank("q", vec![], 5).await;
        assert!(out.is_empty());
    }

    #[test]
    fn response_ordering_applies_scores_and_skips_bad_indices() {
        let items = vec![result("a"), result("b"), result("c")];
        let envelope = json!({
            "results": [
                {"index": 2, "relevance_score": 0.97},
                {"index": 99, "relevance_score": 0.9},
                {"index": 0, "relevance_score": 0.41},
                {"index": 2, "relevance_score": 0.40}
            ]
        });
        let out = order_by_response(items, &envelope, 10).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].item.url, "c");
        assert_eq!(out[0].score, Some(0.97));
        assert_eq!(out[1].item.url, "a");
    }

    #[test]
    fn response_ordering_respects_top_k() {
        let items = vec![result("a"), result("b"), result("c")];
        let envelope = json!({
            "results": [
                {"index": 0, "relevance_score": 0.9},
                {"index": 1, "relevance_score": 0.8},
                {"index": 2, "relevance_score": 0.7}
            ]
        });
        let out = order_by_response(items, &envelope, 2).unwrap();
        assert_eq!(out.len(), 2);
    }
}
