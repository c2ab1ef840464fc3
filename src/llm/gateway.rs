//! LLM gateway: text and JSON completions with retry, refusal detection, and
//! JSON salvage over an OpenAI-compatible chat-completions transport.
//!
//! Retry schedule: attempt 1 fires immediately; the sleep after failed
//! attempt n is `2^(n-1)` seconds, giving the 0 s / 1 s / 2 s ladder for the
//! default three attempts. Auth failures never retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::core::error::{PipelineError, PipelineResult};
use crate::llm::salvage::salvage_json;
use crate::prompts;

/// One completion request as seen by the wire transport.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
}

/// Transport failures, split by retryability.
#[derive(Debug)]
pub enum TransportError {
    /// 401/403: surfaced immediately, never retried.
    Auth(String),
    /// Everything else: network errors, 5xx, malformed envelopes.
    Transient(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(e) => write!(f, "auth: {}", e),
            Self::Transient(e) => write!(f, "transient: {}", e),
        }
    }
}

#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Send one completion request; return the assistant message body.
    async fn complete(&self, request: &LlmRequest) -> Result<String, TransportError>;
}

/// Production transport: `POST {endpoint}/chat/completions`.
pub struct HttpLlmTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpLlmTransport {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LlmTransport for HttpLlmTransport {
    async fn complete(&self, request: &LlmRequest) -> Result<String, TransportError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::Auth(format!("HTTP {}: {}", status, text)));
        }
        if !status.is_success() {
            return Err(TransportError::Transient(format!("HTTP {}: {}", status, text)));
        }

        let envelope: Value = serde_json::from_str(&text)
            .map_err(|e| TransportError::Transient(format!("bad completion envelope: {}", e)))?;
        let content = envelope["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(content)
    }
}

/// Stage-facing gateway. Stateless and safe for parallel use.
pub struct LlmGateway {
    transport: Arc<dyn LlmTransport>,
    max_retries: u32,
    include_policy: bool,
}

impl LlmGateway {
    pub fn new(transport: Arc<dyn LlmTransport>, max_retries: u32, include_policy: bool) -> Self {
        Self {
            transport,
            max_retries: max_retries.max(1),
            include_policy,
        }
    }

    pub async fn complete_text(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> PipelineResult<String> {
        self.run(prompt, model, temperature, max_tokens, false)
            .await
            .map(|(text, _)| text)
    }

    pub async fn complete_json(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> PipelineResult<Value> {
        self.run(prompt, model, temperature, max_tokens, true)
            .await
            .map(|(_, value)| value.unwrap_or(Value::Null))
    }

    async fn run(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: Option<u32>,
        json_mode: bool,
    ) -> PipelineResult<(String, Option<Value>)> {
        let request = LlmRequest {
            model: model.to_string(),
            system: self
                .include_policy
                .then(|| prompts::POLICY_PREAMBLE.to_string()),
            prompt: prompt.to_string(),
            temperature,
            max_tokens,
            json_mode,
        };

        let mut last_raw = String::new();

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                let backoff = Duration::from_secs(1u64 << (attempt - 2));
                debug!(attempt, backoff_secs = backoff.as_secs(), "retrying LLM call");
                tokio::time::sleep(backoff).await;
            }

            match self.transport.complete(&request).await {
                Err(TransportError::Auth(e)) => {
                    // Auth problems won't heal with retries.
                    return Err(PipelineError::LlmUnavailable {
                        attempts: attempt,
                        last_response: truncate(&e, 500),
                    });
                }
                Err(TransportError::Transient(e)) => {
                    warn!(attempt, model, "LLM transport failure: {}", e);
                    last_raw = e;
                }
                Ok(body) => {
                    if body.trim().is_empty() {
                        warn!(attempt, model, "LLM returned an empty body");
                        last_raw = body;
                        continue;
                    }
                    if is_refusal(&body) {
                        warn!(attempt, model, "LLM refusal detected, retrying");
                        last_raw = body;
                        continue;
                    }
                    if json_mode {
                        match salvage_json(&body) {
                            Some(value) => return Ok((body, Some(value))),
                            None => {
                                warn!(attempt, model, "LLM output failed JSON salvage");
                                last_raw = body;
                                continue;
                            }
                        }
                    }
                    return Ok((body, None));
                }
            }
        }

        Err(PipelineError::LlmUnavailable {
            attempts: self.max_retries,
            last_response: truncate(&last_raw, 500),
        })
    }
}

/// Refusal heuristics, checked against the opening of the response only so a
/// long legitimate answer containing "I cannot" mid-text is not discarded.
fn is_refusal(body: &str) -> bool {
    let head: String = body
        .trim_start()
        .chars()
        .take(160)
        .collect::<String>()
        .to_lowercase();
    const PATTERNS: &[&str] = &[
        "i cannot",
        "i can't",
        "i am unable",
        "i'm unable",
        "as an ai",
        "as a language model",
        "i apologize, but i",
        "i'm sorry, but i",
    ];
    PATTERNS.iter().any(|p| head.contains(p))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Scripted transport: pops one canned outcome per call.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<String, TransportError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<String, TransportError>>) -> Self {
            let mut script = script;
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmTransport for ScriptedTransport {
        async fn complete(&self, _request: &LlmRequest) -> Result<String, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(TransportError::Transient("script exhausted".into())))
        }
    }

    fn gateway(script: Vec<Result<String, TransportError>>, retries: u32) -> (LlmGateway, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(script));
        (
            LlmGateway::new(transport.clone(), retries, true),
            transport,
        )
    }

    #[tokio::test]
    async fn first_attempt_success_makes_one_call() {
        let (gw, transport) = gateway(vec![Ok("HTTP/3 rides on QUIC.".into())], 3);
        let out = gw.complete_text("q", "m", 0.2, None).await.unwrap();
        assert_eq!(out, "HTTP/3 rides on QUIC.");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_retries_one_means_single_attempt() {
        let (gw, transport) = gateway(
            vec![Err(TransportError::Transient("boom".into()))],
            1,
        );
        let err = gw.complete_text("q", "m", 0.2, None).await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_ladder_is_zero_one_two_seconds() {
        let (gw, transport) = gateway(
            vec![
                Err(TransportError::Transient("1".into())),
                Err(TransportError::Transient("2".into())),
                Err(TransportError::Transient("3".into())),
            ],
            3,
        );
        let started = Instant::now();
        let err = gw.complete_text("q", "m", 0.2, None).await.unwrap_err();
        // Attempt 1 immediate, +1 s before attempt 2, +2 s before attempt 3.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn refusal_is_retried_then_recovers() {
        let (gw, transport) = gateway(
            vec![
                Ok("I cannot help with that request.".into()),
                Ok("QUIC is a UDP-based transport.".into()),
            ],
            3,
        );
        let out = gw.complete_text("q", "m", 0.2, None).await.unwrap();
        assert_eq!(out, "QUIC is a UDP-based transport.");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_error_fails_immediately() {
        let (gw, transport) = gateway(
            vec![
                Err(TransportError::Auth("HTTP 401".into())),
                Ok("never reached".into()),
            ],
            3,
        );
        let err = gw.complete_text("q", "m", 0.2, None).await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn json_mode_salvages_fenced_output() {
        let (gw, _) = gateway(
            vec![Ok("```json\n{\"intent\": \"news\"}\n```".into())],
            3,
        );
        let value = gw.complete_json("q", "m", 0.0, None).await.unwrap();
        assert_eq!(value["intent"], "news");
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_json_retries_then_fails_with_truncated_body() {
        let long_garbage = "x".repeat(900);
        let (gw, transport) = gateway(
            vec![Ok(long_garbage.clone()), Ok(long_garbage.clone())],
            2,
        );
        let err = gw.complete_json("q", "m", 0.0, None).await.unwrap_err();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        match err {
            PipelineError::LlmUnavailable { attempts, last_response } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_response.chars().count(), 500);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn refusal_detector_ignores_mid_answer_phrases() {
        assert!(is_refusal("I cannot assist with that."));
        assert!(is_refusal("  As an AI language model, I..."));
        let genuine = format!(
            "{} Therefore the committee said it cannot rule out delays.",
            "HTTP/3 deployment grew steadily through 2025. ".repeat(4)
        );
        assert!(!is_refusal(&genuine));
    }
}
