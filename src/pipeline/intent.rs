//! Intent classification (CLASSIFY stage). Any failure: gateway exhaustion
//! or an unrecognized label: defaults to `general` with one WARNING.

use tracing::{debug, warn};

use crate::core::config::Settings;
use crate::core::types::{IntentKind, Query};
use crate::llm::gateway::LlmGateway;
use crate::prompts;

pub async fn classify_intent(gateway: &LlmGateway, settings: &Settings, query_text: &str) -> Query {
    let intent = match gateway
        .complete_json(
            &prompts::intent_prompt(query_text),
            settings.intent_model(),
            0.0,
            Some(64),
        )
        .await
    {
        Ok(value) => {
            let label = value["intent"].as_str().unwrap_or_default();
            match IntentKind::parse(label) {
                Some(intent) => intent,
                None => {
                    warn!(
                        stage = "classify",
                        item = query_text,
                        error_kind = "intent_unrecognized",
                        cause = label,
                        "unrecognized intent label, defaulting to general"
                    );
                    IntentKind::General
                }
            }
        }
        Err(e) => {
            warn!(
                stage = "classify",
                item = query_text,
                error_kind = e.kind(),
                cause = %e,
                "intent classification failed, defaulting to general"
            );
            IntentKind::General
        }
    };

    debug!(intent = intent.as_str(), "query classified");
    Query {
        text: query_text.to_string(),
        intent,
    }
}
