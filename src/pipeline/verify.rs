//! Claim extraction + source-grounded verification (VERIFY stage).
//!
//! Claims are extracted from the rendered report, grouped by resolved
//! source, and checked in one LLM call per source against the run's scrape
//! cache. A source that was never scraped is fetched on demand (single-
//! flight through the same cache); a cached-but-empty body is never
//! re-scraped: its claims come back `unverifiable` at confidence 0.0.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::core::config::Settings;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::{
    ClaimType, ExtractedClaim, Report, VerificationResult, VerificationSummary, Verdict,
};
use crate::llm::gateway::LlmGateway;
use crate::prompts;
use crate::scraping::Scraper;

pub async fn verify_report(
    gateway: &LlmGateway,
    settings: &Settings,
    report: &Report,
    scraper: &Scraper,
) -> PipelineResult<VerificationSummary> {
    let body = report
        .sections
        .iter()
        .map(|s| format!("## {}\n\n{}", s.title, s.markdown_body))
        .collect::<Vec<_>>()
        .join("\n\n");

    let claims = extract_claims(gateway, settings, &body, report.sources.len()).await?;
    if claims.is_empty() {
        info!("no checkable cited claims found");
        return Ok(VerificationSummary::default());
    }

    // Group by source number; resolution to URLs goes through the report's
    // numbered source list.
    let mut grouped: BTreeMap<usize, Vec<ExtractedClaim>> = BTreeMap::new();
    for claim in claims {
        grouped.entry(claim.source_number).or_default().push(claim);
    }

    let mut results = Vec::new();
    for (source_number, claims) in grouped {
        let Some(source) = report.sources.get(source_number - 1) else {
            continue;
        };

        // Cache first; only a never-scraped source triggers a fetch.
        let scraped = match scraper.cache().get(&source.url).await {
            Some(cached) => cached,
            None => scraper.scrape_url(&source.url).await,
        };

        if scraped.is_unavailable() {
            // Empty cached body: no re-scrape, claims are unverifiable.
            for claim in &claims {
                results.push(VerificationResult {
                    claim_text: claim.claim_text.clone(),
                    source_url: source.url.clone(),
                    verdict: Verdict::Unverifiable,
                    confidence: 0.0,
                    evidence: None,
                    reasoning: "source body unavailable in scrape cache".into(),
                });
            }
            continue;
        }

        let claim_refs: Vec<&ExtractedClaim> = claims.iter().collect();
        let prompt = prompts::verification_prompt(
            chrono::Utc::now(),
            &source.url,
            scraped.retrieved_at,
            &claim_refs,
            &scraped.markdown_body,
        );

        match gateway
            .complete_json(&prompt, settings.verify_model(), 0.0, None)
            .await
        {
            Ok(value) => {
                results.extend(parse_verdicts(&value, &claims, &source.url));
            }
            Err(e) => {
                warn!(
                    stage = "verify",
                    item = %source.url,
                    error_kind = e.kind(),
                    cause = %e,
                    "verification call failed for source, marking claims unverifiable"
                );
                for claim in &claims {
                    results.push(VerificationResult {
                        claim_text: claim.claim_text.clone(),
                        source_url: source.url.clone(),
                        verdict: Verdict::Unverifiable,
                        confidence: 0.0,
                        evidence: None,
                        reasoning: "verification call failed".into(),
                    });
                }
            }
        }
    }

    Ok(VerificationSummary::from_results(
        results,
        settings.verify_threshold,
    ))
}

/// Extractor substage. A total failure here makes verification unavailable
/// (non-fatal upstream: the report ships without the appendix).
async fn extract_claims(
    gateway: &LlmGateway,
    settings: &Settings,
    report_body: &str,
    source_count: usize,
) -> PipelineResult<Vec<ExtractedClaim>> {
    let value = gateway
        .complete_json(
            &prompts::claim_extraction_prompt(report_body, source_count),
            settings.verify_model(),
            0.0,
            None,
        )
        .await
        .map_err(|e| PipelineError::VerifyUnavailable(e.to_string()))?;

    Ok(parse_claims(&value, source_count))
}

/// Claims without a resolvable citation are discarded.
pub(crate) fn parse_claims(value: &serde_json::Value, source_count: usize) -> Vec<ExtractedClaim> {
    let Some(items) = value["claims"].as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let claim_text = item["claim_text"].as_str()?.trim().to_string();
            if claim_text.is_empty() {
                return None;
            }
            let source_number = item["source_number"].as_u64()? as usize;
            if source_number < 1 || source_number > source_count {
                return None;
            }
            let claim_type = match item["claim_type"].as_str().unwrap_or("factual") {
                "statistic" => ClaimType::Statistic,
                "quote" => ClaimType::Quote,
                "date" => ClaimType::Date,
                _ => ClaimType::Factual,
            };
            Some(ExtractedClaim {
                claim_text,
                source_number,
                claim_type,
                context: item["context"].as_str().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// Match verdict entries to claims by 1-based position; a claim the model
/// skipped comes back `unverifiable`.
pub(crate) fn parse_verdicts(
    value: &serde_json::Value,
    claims: &[ExtractedClaim],
    source_url: &str,
) -> Vec<VerificationResult> {
    let entries = value["verdicts"].as_array().cloned().unwrap_or_default();

    claims
        .iter()
        .enumerate()
        .map(|(i, claim)| {
            let entry = entries
                .iter()
                .find(|e| e["claim"].as_u64() == Some((i + 1) as u64))
                .or_else(|| entries.get(i).filter(|e| e["claim"].is_null()));

            match entry {
                Some(e) => {
                    let verdict = e["verdict"]
                        .as_str()
                        .and_then(Verdict::parse)
                        .unwrap_or(Verdict::Unverifiable);
                    VerificationResult {
                        claim_text: claim.claim_text.clone(),
                        source_url: source_url.to_string(),
                        verdict,
                        confidence: e["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0) as f32,
                        evidence: e["evidence"].as_str().map(str::to_string),
                        reasoning: e["reasoning"].as_str().unwrap_or_default().to_string(),
                    }
                }
                None => VerificationResult {
                    claim_text: claim.claim_text.clone(),
                    source_url: source_url.to_string(),
                    verdict: Verdict::Unverifiable,
                    confidence: 0.0,
                    evidence: None,
                    reasoning: "no verdict returned for claim".into(),
                },
            }
        })
        .collect()
}
