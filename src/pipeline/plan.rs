//! Research planning (PLAN stage). The planner must return non-empty
//! `sections` and `search_queries`; either list empty fails the run: there
//! is no outer retry beyond the gateway's own.

use serde_json::Value;

use crate::core::config::Settings;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::{Query, ResearchPlan, SearchQuery};
use crate::llm::gateway::LlmGateway;
use crate::prompts;

pub async fn build_plan(
    gateway: &LlmGateway,
    settings: &Settings,
    query: &Query,
) -> PipelineResult<ResearchPlan> {
    let value = gateway
        .complete_json(
            &prompts::planner_prompt(&query.text, query.intent),
            settings.planner_model(),
            0.3,
            None,
        )
        .await?;

    let sections = string_list(&value["sections"]);
    let search_queries = parse_search_queries(&value["search_queries"]);
    let rationale = value["rationale"].as_str().unwrap_or_default().to_string();

    if sections.is_empty() {
        return Err(PipelineError::PlanningFailed(
            "planner returned no sections".into(),
        ));
    }
    if search_queries.is_empty() {
        return Err(PipelineError::PlanningFailed(
            "planner returned no search queries".into(),
        ));
    }

    Ok(ResearchPlan {
        query: query.clone(),
        sections,
        search_queries,
        rationale,
    })
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Accept both object entries (`{text, purpose, priority}`) and bare strings;
/// priorities clamp into 1..=5.
pub(crate) fn parse_search_queries(value: &Value) -> Vec<SearchQuery> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            if let Some(text) = item.as_str() {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                return Some(SearchQuery {
                    text: text.to_string(),
                    purpose: String::new(),
                    priority: 3,
                });
            }
            let text = item["text"].as_str()?.trim().to_string();
            if text.is_empty() {
                return None;
            }
            Some(SearchQuery {
                text,
                purpose: item["purpose"].as_str().unwrap_or_default().to_string(),
                priority: item["priority"].as_u64().unwrap_or(3).clamp(1, 5) as u8,
            })
        })
        .collect()
}
