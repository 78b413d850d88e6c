use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The validator rule a rejected query violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionRule {
    Empty,
    ForbiddenKeyword,
    MultipleStatements,
    NotSelect,
    UnknownTable,
    Unparseable,
}

impl fmt::Display for RejectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RejectionRule::Empty => "empty query",
            RejectionRule::ForbiddenKeyword => "forbidden keyword",
            RejectionRule::MultipleStatements => "multiple statements",
            RejectionRule::NotSelect => "not a SELECT statement",
            RejectionRule::UnknownTable => "unknown table",
            RejectionRule::Unparseable => "unparseable statement",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Generation unavailable: {reason}")]
    GenerationUnavailable { reason: String, retryable: bool },

    #[error("Query rejected ({rule}): {detail}")]
    QueryRejected { rule: RejectionRule, detail: String },

    #[error("Scope unenforceable: {0}")]
    ScopeUnenforceable(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for AnalyticsError {
    fn from(err: polars::error::PolarsError) -> Self {
        AnalyticsError::Polars(err.to_string())
    }
}

impl AnalyticsError {
    pub fn rejected(rule: RejectionRule, detail: impl Into<String>) -> Self {
        AnalyticsError::QueryRejected {
            rule,
            detail: detail.into(),
        }
    }

    /// Stable label used in logs and JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            AnalyticsError::GenerationUnavailable { .. } => "generation_unavailable",
            AnalyticsError::QueryRejected { .. } => "query_rejected",
            AnalyticsError::ScopeUnenforceable(_) => "scope_unenforceable",
            AnalyticsError::Execution(_) => "execution_error",
            AnalyticsError::PermissionDenied(_) => "permission_denied",
            AnalyticsError::Config(_) => "config_error",
            AnalyticsError::Io(_) => "io_error",
            AnalyticsError::Json(_) => "json_error",
            AnalyticsError::Csv(_) => "csv_error",
            AnalyticsError::Polars(_) => "data_error",
        }
    }

    /// Text safe to show to the person who asked the question.
    ///
    /// Execution diagnostics stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            AnalyticsError::GenerationUnavailable { .. } => {
                "The query assistant is unavailable right now. Try again in a moment.".to_string()
            }
            AnalyticsError::QueryRejected { rule, .. } => {
                format!("I can't run that kind of query ({}). Try rephrasing your question.", rule)
            }
            AnalyticsError::ScopeUnenforceable(reason) => format!(
                "I can't answer that within your access permissions: {}. Try asking about your own records.",
                reason
            ),
            AnalyticsError::Execution(_) => {
                "The query failed to run. Try rephrasing your question.".to_string()
            }
            AnalyticsError::PermissionDenied(reason) => format!("Not allowed: {}.", reason),
            AnalyticsError::Config(_)
            | AnalyticsError::Io(_)
            | AnalyticsError::Json(_)
            | AnalyticsError::Csv(_)
            | AnalyticsError::Polars(_) => {
                "Something went wrong on our side. Please contact an administrator.".to_string()
            }
        }
    }

    /// Only generator timeouts are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnalyticsError::GenerationUnavailable { retryable: true, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_message_hides_diagnostic() {
        let error = AnalyticsError::Execution("unknown function: FOO(sales.revenue)".to_string());
        assert!(!error.user_message().contains("FOO"));
        assert_eq!(error.kind(), "execution_error");
    }

    #[test]
    fn test_messages_are_distinct_per_kind() {
        let generation = AnalyticsError::GenerationUnavailable {
            reason: "timeout".to_string(),
            retryable: true,
        };
        let rejected = AnalyticsError::rejected(RejectionRule::ForbiddenKeyword, "DROP");
        assert!(generation.user_message().contains("Try again in a moment"));
        assert!(rejected.user_message().contains("can't run that kind of query"));
        assert_ne!(generation.user_message(), rejected.user_message());
    }

    #[test]
    fn test_only_generation_timeouts_are_retryable() {
        let timeout = AnalyticsError::GenerationUnavailable {
            reason: "timeout".to_string(),
            retryable: true,
        };
        let http = AnalyticsError::GenerationUnavailable {
            reason: "HTTP 500".to_string(),
            retryable: false,
        };
        assert!(timeout.is_retryable());
        assert!(!http.is_retryable());
        assert!(!AnalyticsError::Execution("x".to_string()).is_retryable());
    }
}
