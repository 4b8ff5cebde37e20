//! Error kinds that callers need to tell apart.
//!
//! Most functions return [`anyhow::Result`]; these variants travel inside
//! the `anyhow::Error` and are recovered with `downcast_ref` where the
//! distinction matters (the runner fails an attempt, the assistant turns a
//! provider error into a "Model Failure" reply).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Stored chunks of one document disagree on their ACL, or the lookup
    /// could not be completed. Fatal for the current write.
    #[error("index corruption for document '{document_id}': {detail}")]
    IndexCorruption { document_id: String, detail: String },

    /// A filter that can never be satisfied or names nothing.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Non-retryable provider failure, or retries exhausted.
    #[error("{provider} error: {message}")]
    Provider { provider: String, message: String },

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    /// A named concurrent sub-task failed.
    #[error("task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },
}

impl CoreError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn corruption(document_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IndexCorruption {
            document_id: document_id.into(),
            detail: detail.into(),
        }
    }
}

/// True if `err` (or anything in its chain) is a provider failure or timeout.
pub fn is_provider_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<CoreError>(),
            Some(CoreError::Provider { .. }) | Some(CoreError::Timeout(_))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_failure_detected_through_context() {
        let err = anyhow::Error::new(CoreError::provider("openai", "quota exceeded"))
            .context("QA chain failed");
        assert!(is_provider_failure(&err));
    }

    #[test]
    fn test_other_errors_are_not_provider_failures() {
        let err = anyhow::Error::new(CoreError::InvalidFilter("empty".into()));
        assert!(!is_provider_failure(&err));
        assert!(!is_provider_failure(&anyhow::anyhow!("plain")));
    }
}
