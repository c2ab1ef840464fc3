//! Context assembly (ASSEMBLE stage): embed, persist, rank, select.
//!
//! One embedding batch covers the query plus every summary. This stage is
//! the vector store's only writer: see the single-writer contract at
//! [`crate::pipeline::Orchestrator::run`]: and it runs strictly
//! single-threaded.

use std::collections::BTreeMap;

use tracing::{debug, info};
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::error::PipelineResult;
use crate::core::types::{effective_count, ContextPackage, Summary};
use crate::llm::embedding::Embedder;
use crate::nlp::rerank::Reranker;
use crate::store::{StoredChunk, VectorStore};

pub async fn assemble(
    embedder: &dyn Embedder,
    store: &VectorStore,
    reranker: &Reranker,
    settings: &Settings,
    query_text: &str,
    all_summaries: &[Summary],
) -> PipelineResult<ContextPackage> {
    let n = all_summaries.len();
    if n == 0 {
        return Ok(ContextPackage {
            selected_summaries: Vec::new(),
            scores: BTreeMap::new(),
            excluded_count: 0,
        });
    }

    // One batched call: query first, then every summary text in order.
    let mut texts = Vec::with_capacity(n + 1);
    texts.push(query_text.to_string());
    texts.extend(all_summaries.iter().map(|s| s.text.clone()));
    let mut vectors = embedder.embed(&texts).await?;

    let query_embedding = vectors.remove(0);
    debug!(dim = query_embedding.len(), summaries = n, "embeddings ready");

    // Persist chunks; ids key the score mapping back to summaries.
    let mut chunks = Vec::with_capacity(n);
    let mut by_id: BTreeMap<String, &Summary> = BTreeMap::new();
    for (summary, embedding) in all_summaries.iter().zip(vectors) {
        let id = Uuid::new_v4().to_string();
        chunks.push(StoredChunk {
            id: id.clone(),
            source_url: summary.source_url.clone(),
            title: summary.title.clone(),
            text: summary.text.clone(),
            embedding: Some(embedding),
        });
        by_id.insert(id, summary);
    }
    store.upsert(&chunks)?;

    let k = effective_count(settings.top_k_sum, n);
    let ranked = store.top_k(&query_embedding, k)?;

    // Cosine lands in [-1, 1]; scores are reported in [0, 1] with negatives
    // clamped to zero.
    let mut selected: Vec<Summary> = Vec::with_capacity(ranked.len());
    let mut scores = BTreeMap::new();
    for (chunk, score) in &ranked {
        if let Some(summary) = by_id.get(&chunk.id) {
            selected.push((*summary).clone());
            scores.insert(chunk.source_url.clone(), score.max(0.0));
        }
    }

    // Optional external re-ordering of the top-k.
    if settings.use_reranker {
        let reranked = reranker.rerank(query_text, selected, k).await;
        selected = Vec::with_capacity(reranked.len());
        for item in reranked {
            if let Some(score) = item.score {
                scores.insert(item.item.source_url.clone(), score.clamp(0.0, 1.0));
            }
            selected.push(item.item);
        }
    }

    let excluded_count = n - selected.len();
    info!(
        selected = selected.len(),
        excluded = excluded_count,
        "context assembled"
    );

    Ok(ContextPackage {
        selected_summaries: selected,
        scores,
        excluded_count,
    })
}
