//! Typed error kinds for the coordination core.
//!
//! Workflow code returns `anyhow::Result` and attaches context freely; these
//! variants carry the failure kinds that callers (and the JSON error output)
//! must be able to distinguish without string matching.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{name} lock timeout after {waited_ms}ms: {path}")]
    LockTimeout {
        name: &'static str,
        path: PathBuf,
        waited_ms: u128,
    },

    #[error("metadata version conflict: expected={expected}, current={current}")]
    VersionConflict { expected: u64, current: u64 },

    #[error("stage blocked: {stage}\n{}", format_reasons(.reasons))]
    DependencyBlocked { stage: String, reasons: Vec<String> },

    #[error("stage validation failed: {stage}\n{}", format_reasons(.reasons))]
    ValidationFailed { stage: String, reasons: Vec<String> },

    #[error("requirement already exists: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Stable kind tag used in machine-readable error output.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::LockTimeout { .. } => "lock_timeout",
            CoreError::VersionConflict { .. } => "version_conflict",
            CoreError::DependencyBlocked { .. } => "dependency_blocked",
            CoreError::ValidationFailed { .. } => "validation_failed",
            CoreError::AlreadyExists { .. } => "already_exists",
            CoreError::NotFound(_) => "not_found",
            CoreError::InvalidInput(_) => "invalid_input",
        }
    }
}

/// Kind tag for an arbitrary error chain; `"error"` when no `CoreError` is present.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<CoreError>()
        .map(CoreError::kind)
        .unwrap_or("error")
}

fn format_reasons(reasons: &[String]) -> String {
    reasons
        .iter()
        .map(|reason| format!("- {reason}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        let err = CoreError::VersionConflict {
            expected: 3,
            current: 4,
        };
        assert_eq!(err.kind(), "version_conflict");
        let wrapped = anyhow::Error::new(err).context("save metadata");
        assert_eq!(error_kind(&wrapped), "version_conflict");
    }

    #[test]
    fn blocked_message_lists_reasons() {
        let err = CoreError::DependencyBlocked {
            stage: "tech".to_string(),
            reasons: vec![
                "dependency stage not completed: analysis".to_string(),
                "dependency stage not completed: prd".to_string(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("stage blocked: tech"));
        assert!(text.contains("- dependency stage not completed: prd"));
    }
}
