//! Prompt builders for every LLM-backed stage.
//!
//! Two blocks recur. The policy preamble rides as the system message on every
//! gateway call (configurable). The source-grounding block prefixes any
//! prompt that hands the model scraped source text: the source outranks
//! training data, and the model must not invent temporal qualifiers.

use chrono::{DateTime, Utc};

use crate::core::types::{ExtractedClaim, IntentKind, SearchQuery, Summary};

/// Process-wide system message. Immutable; threaded through the gateway
/// constructor rather than living in a global.
pub const POLICY_PREAMBLE: &str = "You are a research assistant. Answer strictly from the \
provided sources and context. Do not refuse a question because of your training cutoff; the \
caller supplies current sources. When JSON is requested, return raw JSON only: no prose, no \
code fences.";

/// Grounding directive for prompts that include scraped source text.
pub fn source_grounding_block(now: DateTime<Utc>) -> String {
    format!(
        "Today's date (UTC) is {}.\n\
         Trust the provided source text over your prior knowledge, including for events after \
         your training data ends. Never add temporal qualifiers (\"as of\", \"at the time of \
         writing\") that are not present in the source. When in doubt, quote the source \
         verbatim.",
        now.format("%Y-%m-%d")
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Intent & planning
// ─────────────────────────────────────────────────────────────────────────────

pub fn intent_prompt(query: &str) -> String {
    format!(
        "Classify the research query into exactly one intent.\n\
         Query: {query}\n\n\
         Intents: informational, news, code, research, comparative, tutorial, general.\n\
         Respond with JSON: {{\"intent\": \"<one of the seven>\"}}"
    )
}

pub fn planner_prompt(query: &str, intent: IntentKind) -> String {
    format!(
        "Plan a research report for the query below.\n\
         Query: {query}\n\
         Intent: {intent}\n\n\
         Produce JSON with exactly these keys:\n\
         - \"sections\": ordered report section titles (non-empty array of strings)\n\
         - \"search_queries\": non-empty array of {{\"text\", \"purpose\", \"priority\"}} \
         where priority is an integer 1-5 (1 = highest)\n\
         - \"rationale\": one short paragraph explaining the plan",
        intent = intent.as_str()
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Summarization (map-reduce)
// ─────────────────────────────────────────────────────────────────────────────

pub fn summarize_direct_prompt(
    now: DateTime<Utc>,
    query: &str,
    url: &str,
    title: &str,
    content: &str,
) -> String {
    format!(
        "{grounding}\n\n\
         Summarize the source below for a research report on: {query}\n\
         Keep every fact, number, and table relevant to the query. Reproduce Markdown tables \
         as-is. Preserve any [Source N] citation markers verbatim.\n\n\
         Source URL: {url}\n\
         Source title: {title}\n\n\
         --- SOURCE ---\n{content}",
        grounding = source_grounding_block(now)
    )
}

pub fn summarize_map_prompt(
    now: DateTime<Utc>,
    query: &str,
    url: &str,
    part: usize,
    total: usize,
    chunk: &str,
) -> String {
    format!(
        "{grounding}\n\n\
         This is part {part} of {total} of a source document ({url}).\n\
         Summarize only what this part contributes to a research report on: {query}\n\
         Keep facts, numbers, and tables. Preserve any [Source N] markers verbatim.\n\n\
         --- PART {part}/{total} ---\n{chunk}",
        grounding = source_grounding_block(now)
    )
}

pub fn summarize_reduce_prompt(
    now: DateTime<Utc>,
    query: &str,
    url: &str,
    partials: &[String],
) -> String {
    let joined = partials
        .iter()
        .enumerate()
        .map(|(i, p)| format!("--- PART SUMMARY {} ---\n{}", i + 1, p))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "{grounding}\n\n\
         Combine the part summaries below into one coherent summary of the source ({url}) for \
         a research report on: {query}\n\
         Do not drop numbers or tables. Preserve any [Source N] markers verbatim.\n\n\
         {joined}",
        grounding = source_grounding_block(now)
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Reflection
// ─────────────────────────────────────────────────────────────────────────────

pub fn reflection_prompt(query: &str, sections: &[String], summaries: &[Summary]) -> String {
    let section_list = sections.join("\n- ");
    let coverage = summaries
        .iter()
        .map(|s| format!("[{}] {}\n{}", s.source_url, s.title, head(&s.text, 600)))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "You are auditing research coverage for the query: {query}\n\n\
         Planned report sections:\n- {section_list}\n\n\
         Evidence gathered so far:\n{coverage}\n\n\
         Judge whether the evidence covers every planned section. Respond with JSON:\n\
         {{\"complete\": bool, \"gaps\": [string], \
         \"additional_queries\": [{{\"text\", \"purpose\", \"priority\"}}], \
         \"rationale\": string}}\n\
         Emit between 1 and 5 additional_queries when complete is false; emit none when \
         complete is true."
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────────────────

pub fn report_prompt(
    now: DateTime<Utc>,
    query: &str,
    intent: IntentKind,
    sections: &[String],
    numbered_sources: &[(usize, &Summary)],
) -> String {
    let section_list = sections
        .iter()
        .map(|s| format!("## {}", s))
        .collect::<Vec<_>>()
        .join("\n");
    let sources = numbered_sources
        .iter()
        .map(|(n, s)| {
            format!(
                "[Source {n}] {title} ({url})\n{text}",
                title = s.title,
                url = s.source_url,
                text = s.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "{grounding}\n\n\
         Write a research report in Markdown answering: {query}\n\
         Intent: {intent}\n\n\
         Use exactly these section headings, in order:\n{section_list}\n\n\
         Every factual statement must cite its source inline as [Source N], using only the \
         numbered sources below. Do not add a sources list; the caller appends it.\n\n\
         {sources}",
        grounding = source_grounding_block(now),
        intent = intent.as_str()
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Verification
// ─────────────────────────────────────────────────────────────────────────────

pub fn claim_extraction_prompt(report_body: &str, source_count: usize) -> String {
    format!(
        "Extract every checkable cited claim from the report below. A claim is checkable when \
         it states a fact, statistic, quote, or date AND carries a [Source N] citation with \
         1 <= N <= {source_count}. Skip uncited sentences.\n\n\
         Respond with JSON: {{\"claims\": [{{\"claim_text\", \"source_number\", \
         \"claim_type\": \"factual|statistic|quote|date\", \"context\"}}]}}\n\n\
         --- REPORT ---\n{report_body}"
    )
}

pub fn verification_prompt(
    now: DateTime<Utc>,
    source_url: &str,
    retrieved_at: DateTime<Utc>,
    claims: &[&ExtractedClaim],
    source_body: &str,
) -> String {
    let claim_list = claims
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}", i + 1, c.claim_text))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Today's date (UTC) is {today}. The source below was retrieved on {retrieved}.\n\
         Verify each claim against the source text only. The source is authoritative over your \
         training data, including for facts about current events; ignore any conflict with what \
         you believe you know.\n\n\
         Source URL: {source_url}\n\n\
         Claims:\n{claim_list}\n\n\
         --- SOURCE TEXT ---\n{source_body}\n\n\
         Respond with JSON: {{\"verdicts\": [{{\"claim\": <claim number>, \
         \"verdict\": \"supported|partial|unsupported|contradicted\", \
         \"confidence\": <0.0-1.0>, \"evidence\": \"<short quote from the source>\", \
         \"reasoning\": \"<one sentence>\"}}]}}: one entry per claim, in order.",
        today = now.format("%Y-%m-%d"),
        retrieved = retrieved_at.format("%Y-%m-%d"),
    )
}

/// Render follow-up queries for logging / --show-plan output.
pub fn format_queries(queries: &[SearchQuery]) -> String {
    queries
        .iter()
        .map(|q| format!("  [p{}] {}: {}", q.priority, q.text, q.purpose))
        .collect::<Vec<_>>()
        .join("\n")
}

fn head(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn grounding_block_carries_the_current_date() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let block = source_grounding_block(now);
        assert!(block.contains("2026-03-14"));
        assert!(block.contains("Trust the provided source text over your prior knowledge"));
        assert!(block.contains("Never add temporal qualifiers"));
    }

    #[test]
    fn verification_prompt_declares_both_dates_and_authority() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let retrieved = Utc.with_ymd_and_hms(2026, 5, 30, 8, 0, 0).unwrap();
        let claim = ExtractedClaim {
            claim_text: "President X signed the bill".into(),
            source_number: 2,
            claim_type: crate::core::types::ClaimType::Factual,
            context: String::new(),
        };
        let prompt = verification_prompt(
            now,
            "https://example.org/news",
            retrieved,
            &[&claim],
            "President X signed the bill",
        );
        assert!(prompt.contains("2026-06-01"));
        assert!(prompt.contains("2026-05-30"));
        assert!(prompt.contains("authoritative over your training data"));
        assert!(prompt.contains("1. President X signed the bill"));
    }
}
