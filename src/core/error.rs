use thiserror::Error;

/// Pipeline-level error taxonomy.
///
/// Recoverable per-item failures (a single URL, query, or summary) are logged
/// and dropped where they occur; only failures that would otherwise produce a
/// silent empty report surface through this type.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The LLM gateway exhausted its retries. Carries the last raw response,
    /// truncated to 500 characters.
    #[error("LLM unavailable after {attempts} attempt(s): {last_response}")]
    LlmUnavailable { attempts: u32, last_response: String },

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Iteration 1 produced zero search results and nothing was summarized.
    #[error("no search results for any planned query")]
    NoResults,

    #[error("planner returned an unusable plan: {0}")]
    PlanningFailed(String),

    /// Verification could not run. Non-fatal: the report ships without the
    /// verification appendix.
    #[error("verification unavailable: {0}")]
    VerifyUnavailable(String),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// CLI exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid(_) => 2,
            Self::NoResults => 3,
            Self::LlmUnavailable { .. } => 4,
            _ => 5,
        }
    }

    /// Short machine-readable kind tag used in structured error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::LlmUnavailable { .. } => "llm_unavailable",
            Self::EmbeddingUnavailable(_) => "embedding_unavailable",
            Self::NoResults => "no_results",
            Self::PlanningFailed(_) => "planning_failed",
            Self::VerifyUnavailable(_) => "verify_unavailable",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(PipelineError::ConfigInvalid("x".into()).exit_code(), 2);
        assert_eq!(PipelineError::NoResults.exit_code(), 3);
        assert_eq!(
            PipelineError::LlmUnavailable {
                attempts: 3,
                last_response: String::new()
            }
            .exit_code(),
            4
        );
        assert_eq!(PipelineError::PlanningFailed("empty".into()).exit_code(), 5);
    }
}
