//! Error taxonomy for the verification pipeline.
//!
//! Stages return `anyhow::Result`; the variants here are the errors a caller
//! is expected to classify (via `downcast_ref`) to decide whether a failure
//! aborts the run or only degrades the report.

use std::fmt;

/// Errors with pipeline-level meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A required external binary could not be launched.
    ToolMissing {
        /// Program name as configured.
        tool: String,
        /// Install hint shown to the operator.
        hint: String,
    },

    /// The delegated verifier rejected the attestation or signature.
    VerificationFailed {
        /// Stage that rejected the image.
        stage: &'static str,
        /// Sanitized tool output.
        reason: String,
    },

    /// The tool succeeded but its output had an unexpected shape.
    ExtractionFailed {
        /// Stage whose output could not be parsed.
        stage: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A transparency-log entry or image digest could not be found.
    LookupNotFound(String),
}

impl PipelineError {
    /// Returns true for errors that must abort the whole run regardless of
    /// which stage raised them.
    pub fn is_tool_missing(&self) -> bool {
        matches!(self, Self::ToolMissing { .. })
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolMissing { tool, hint } => {
                write!(f, "required tool not found: {tool} ({hint})")
            }
            Self::VerificationFailed { stage, reason } => {
                write!(f, "{stage} verification failed: {reason}")
            }
            Self::ExtractionFailed { stage, reason } => {
                write!(f, "could not extract {stage} fields: {reason}")
            }
            Self::LookupNotFound(what) => write!(f, "not found: {what}"),
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn display_tool_missing_includes_hint() {
        let err = PipelineError::ToolMissing {
            tool: "cosign".into(),
            hint: "https://docs.sigstore.dev".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cosign"));
        assert!(msg.contains("docs.sigstore.dev"));
        assert!(err.is_tool_missing());
    }

    #[test]
    fn display_verification_failed_names_stage() {
        let err = PipelineError::VerificationFailed {
            stage: "provenance",
            reason: "no matching attestations".into(),
        };
        assert_eq!(
            err.to_string(),
            "provenance verification failed: no matching attestations"
        );
        assert!(!err.is_tool_missing());
    }

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = PipelineError::LookupNotFound("log index 7".into()).into();
        let err = err.context("rekor stage");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::LookupNotFound(_))
        ));
    }

    #[test]
    fn pipeline_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
    }
}
