//! Error Types
//!
//! Errors raised while loading, validating, or running a workflow.
//! A step that exits non-zero is not an error: it is recorded as a
//! failed step in the run report.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::workflow::validator::ValidationError;

/// Errors produced by the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to read workflow file '{}': {source}. Check that the file exists and is readable.", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse workflow YAML: {0}. Check the file format.")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid workflow:\n{}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("Invalid expression '{expression}': {message}")]
    Expression { expression: String, message: String },

    #[error("Invalid matrix for job '{job}': {message}")]
    Matrix { job: String, message: String },

    #[error("Invalid action reference '{reference}': {message}")]
    ActionReference { reference: String, message: String },

    #[error("Action '{action}' failed: {message}")]
    Action { action: String, message: String },

    #[error("Invalid command file line '{line}': {message}")]
    CommandFile { line: String, message: String },

    #[error("Job '{0}' is not defined in the workflow")]
    UnknownJob(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Builds an expression error for the given source text.
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Builds an action failure for the given action reference.
    pub fn action(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Action {
            action: action.into(),
            message: message.into(),
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_problem() {
        let err = RunnerError::Validation(vec![
            ValidationError::NoJobs,
            ValidationError::UnknownNeed {
                job: "test".to_string(),
                need: "build".to_string(),
            },
        ]);

        let message = err.to_string();
        assert!(message.contains("no jobs"));
        assert!(message.contains("'build'"));
        assert_eq!(message.lines().count(), 3);
    }

    #[test]
    fn test_read_error_names_path() {
        let err = RunnerError::Read {
            path: PathBuf::from("missing.yml"),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("missing.yml"));
    }

    #[test]
    fn test_expression_helper() {
        let err = RunnerError::expression("matrix.", "unexpected end");
        assert_eq!(
            err.to_string(),
            "Invalid expression 'matrix.': unexpected end"
        );
    }
}
