//! Gap analysis (REFLECT stage). Judges coverage and either terminates the
//! research loop or emits 1–5 follow-up queries. An incomplete verdict with
//! no follow-up queries is coerced to complete: re-entering SEARCH with
//! nothing to search would loop forever.

use tracing::{debug, warn};

use crate::core::config::Settings;
use crate::core::error::PipelineResult;
use crate::core::types::{Query, ReflectionResult, Summary};
use crate::llm::gateway::LlmGateway;
use crate::pipeline::plan::parse_search_queries;
use crate::prompts;

/// Upper bound on follow-up queries per reflection.
const MAX_FOLLOW_UPS: usize = 5;

pub async fn reflect(
    gateway: &LlmGateway,
    settings: &Settings,
    query: &Query,
    sections: &[String],
    summaries: &[Summary],
) -> PipelineResult<ReflectionResult> {
    let value = gateway
        .complete_json(
            &prompts::reflection_prompt(&query.text, sections, summaries),
            settings.reflection_model(),
            0.3,
            None,
        )
        .await?;

    let complete = value["complete"].as_bool().unwrap_or(true);
    let gaps = value["gaps"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let mut additional_queries = parse_search_queries(&value["additional_queries"]);
    additional_queries.truncate(MAX_FOLLOW_UPS);
    let rationale = value["rationale"].as_str().unwrap_or_default().to_string();

    let mut result = ReflectionResult {
        complete,
        gaps,
        additional_queries,
        rationale,
    };

    if !result.complete && result.additional_queries.is_empty() {
        warn!(
            stage = "reflect",
            item = %query.text,
            error_kind = "empty_follow_ups",
            cause = "complete=false with no additional queries",
            "treating reflection as complete"
        );
        result.complete = true;
    }

    debug!(
        complete = result.complete,
        follow_ups = result.additional_queries.len(),
        "reflection done"
    );
    Ok(result)
}
