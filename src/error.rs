//! Error taxonomy for the extraction pipeline.
//!
//! Two layers: [`ModelError`] describes a single failed call to the LLM
//! endpoint (transport vs. bad-response), and [`PipelineError`] is what the
//! pipeline surfaces to the HTTP layer. Chapter-level extraction failures
//! never appear here directly: they are logged and swallowed inside the
//! orchestrator, and only escalate as [`PipelineError::Pipeline`] when every
//! chapter fails.

use thiserror::Error;

/// Failure of one request/response cycle against the LLM endpoint.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model endpoint returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("model response is not valid JSON: {detail}")]
    InvalidJson { detail: String },

    #[error("model response is not a JSON object")]
    NotAnObject,
}

/// Pipeline-level failure surfaced to the caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Caller fault: bad upload or malformed template. Maps to 4xx.
    #[error("{0}")]
    Validation(String),

    /// Reserved for catastrophic input errors; segmentation itself is total.
    #[error("segmentation failed: {0}")]
    Segmentation(String),

    /// Every chapter extraction call failed; there is nothing to merge.
    #[error("failed to process any chapters successfully ({attempted} attempted)")]
    Pipeline { attempted: usize },

    /// The final merge call failed. No partial results are surfaced.
    #[error("knowledge merge failed: {source}")]
    Merge {
        #[source]
        source: ModelError,
    },
}

impl PipelineError {
    /// Whether the failure is the caller's fault (4xx) rather than ours (5xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_client_error() {
        assert!(PipelineError::Validation("bad upload".into()).is_client_error());
        assert!(!PipelineError::Pipeline { attempted: 3 }.is_client_error());
    }

    #[test]
    fn pipeline_error_message_names_attempt_count() {
        let err = PipelineError::Pipeline { attempted: 5 };
        assert!(err.to_string().contains("5 attempted"));
    }
}
