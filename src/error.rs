//! Error types for the evaluation harness.

use crate::rubric::Criterion;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Errors that can occur while loading inputs or scoring samples.
#[derive(Error, Debug)]
pub enum EvalError {
    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The annotation file does not exist.
    #[error("Annotation file not found at '{0}'")]
    AnnotationsNotFound(PathBuf),

    /// The annotation file could not be parsed or an entry is incomplete.
    #[error("Malformed annotation file '{path}': {message}")]
    MalformedAnnotations { path: PathBuf, message: String },

    /// Two annotation entries share an image id.
    #[error("Duplicate image_id '{0}' in annotation set")]
    DuplicateImageId(String),

    /// The generation result file does not exist.
    #[error("Result file not found at '{0}'")]
    ResultsNotFound(PathBuf),

    /// The generation result table could not be parsed or a row is incomplete.
    #[error("Malformed result set '{source_name}': {message}")]
    MalformedResults { source_name: String, message: String },

    /// The same (image, model, prompt version) appears twice in one result set.
    #[error("Duplicate generation record for image '{image_id}' (model '{model}', prompt '{prompt_version}')")]
    DuplicateRecord {
        image_id: String,
        model: String,
        prompt_version: String,
    },

    /// No metadata or filename yielded a complete run identity.
    #[error("Cannot resolve run identity: {0}")]
    UnresolvedIdentity(String),

    /// The judge returned something unusable for this criterion.
    #[error("Judge error on {criterion} for image '{image_id}': {message}")]
    Judge {
        criterion: Criterion,
        image_id: String,
        message: String,
    },

    /// The judge call exceeded its deadline.
    #[error("Judge call on {criterion} for image '{image_id}' timed out after {timeout_ms}ms")]
    JudgeTimeout {
        criterion: Criterion,
        image_id: String,
        timeout_ms: u64,
    },

    /// LLM API error.
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// LLM response parsing error.
    #[error("Failed to parse LLM response: {0}")]
    LlmParse(String),

    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Configuration file error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EvalError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Structural input errors. These abort a run before any judge call.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::AnnotationsNotFound(_)
                | Self::MalformedAnnotations { .. }
                | Self::DuplicateImageId(_)
                | Self::ResultsNotFound(_)
                | Self::MalformedResults { .. }
                | Self::DuplicateRecord { .. }
                | Self::UnresolvedIdentity(_)
        )
    }

    /// Whether the retry policy applies to this error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::JudgeTimeout { .. })
    }
}

impl From<reqwest::Error> for EvalError {
    fn from(err: reqwest::Error) -> Self {
        EvalError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::LlmParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_classification() {
        assert!(EvalError::DuplicateImageId("a".into()).is_data_error());
        assert!(EvalError::UnresolvedIdentity("x".into()).is_data_error());
        assert!(
            !EvalError::Judge {
                criterion: Criterion::ReferenceCoverage,
                image_id: "a".into(),
                message: "bad".into(),
            }
            .is_data_error()
        );
    }

    #[test]
    fn test_timeout_message_names_criterion() {
        let err = EvalError::JudgeTimeout {
            criterion: Criterion::MustIncludeCoverage,
            image_id: "img_7".into(),
            timeout_ms: 250,
        };
        assert!(err.is_timeout());
        let text = err.to_string();
        assert!(text.contains("must_include_coverage"));
        assert!(text.contains("img_7"));
    }
}
