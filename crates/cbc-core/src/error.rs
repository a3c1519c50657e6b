use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CbcError {
    #[error("not initialized: run 'cbc init'")]
    NotInitialized,

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("invalid trigger event: {0}")]
    InvalidEvent(String),

    #[error("invalid object locator '{0}'")]
    InvalidLocator(String),

    #[error("invalid results report: {0}")]
    InvalidReport(String),

    #[error("object does not exist: {0}")]
    ObjectDoesNotExist(String),

    #[error("compliance status mismatch: expected {expected}, found {actual}")]
    ComplianceMismatch { expected: String, actual: String },

    #[error("evaluation endpoint returned {status}: {body}")]
    SubmissionRejected { status: u16, body: String },

    #[error("publishing evaluation failed: {0}")]
    PublishFailed(String),

    #[error("publishing evaluation failed: result token '{0}' has already been used")]
    ResultTokenUsed(String),

    #[error("upstream service error: {0}")]
    Upstream(String),

    #[error("request signing failed: {0}")]
    Signing(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid state machine definition: {0}")]
    InvalidDefinition(String),

    #[error("run database error: {0}")]
    RunDb(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error classes that retry and catch rules match against.
///
/// Matching is on the class, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ObjectDoesNotExist,
    ComplianceMismatch,
    SubmissionFailed,
    PublishFailed,
    Upstream,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ObjectDoesNotExist => "ObjectDoesNotExist",
            ErrorKind::ComplianceMismatch => "ComplianceMismatch",
            ErrorKind::SubmissionFailed => "SubmissionFailed",
            ErrorKind::PublishFailed => "PublishFailed",
            ErrorKind::Upstream => "Upstream",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CbcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CbcError::ObjectDoesNotExist(_) => ErrorKind::ObjectDoesNotExist,
            CbcError::ComplianceMismatch { .. } => ErrorKind::ComplianceMismatch,
            CbcError::SubmissionRejected { .. } => ErrorKind::SubmissionFailed,
            CbcError::PublishFailed(_) | CbcError::ResultTokenUsed(_) => ErrorKind::PublishFailed,
            CbcError::Upstream(_) | CbcError::Http(_) | CbcError::Signing(_) => {
                ErrorKind::Upstream
            }
            CbcError::InvalidEvent(_)
            | CbcError::InvalidLocator(_)
            | CbcError::InvalidReport(_) => ErrorKind::InvalidInput,
            CbcError::NotInitialized
            | CbcError::RunNotFound(_)
            | CbcError::InvalidConfig(_)
            | CbcError::InvalidDefinition(_)
            | CbcError::RunDb(_)
            | CbcError::Io(_)
            | CbcError::Yaml(_)
            | CbcError::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CbcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absence_and_mismatch_have_distinct_kinds() {
        assert_eq!(
            CbcError::ObjectDoesNotExist("s3://b/k".into()).kind(),
            ErrorKind::ObjectDoesNotExist
        );
        assert_eq!(
            CbcError::ComplianceMismatch {
                expected: "COMPLIANT".into(),
                actual: "unknown".into(),
            }
            .kind(),
            ErrorKind::ComplianceMismatch
        );
    }

    #[test]
    fn upstream_family_collapses_to_one_kind() {
        assert_eq!(CbcError::Upstream("x".into()).kind(), ErrorKind::Upstream);
        assert_eq!(CbcError::Signing("x".into()).kind(), ErrorKind::Upstream);
        assert_eq!(
            CbcError::SubmissionRejected {
                status: 403,
                body: String::new()
            }
            .kind(),
            ErrorKind::SubmissionFailed
        );
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::ObjectDoesNotExist.to_string(), "ObjectDoesNotExist");
        assert_eq!(ErrorKind::PublishFailed.as_str(), "PublishFailed");
    }

    #[test]
    fn reused_token_and_bad_config_classes() {
        assert_eq!(
            CbcError::ResultTokenUsed("tok-1".into()).kind(),
            ErrorKind::PublishFailed
        );
        assert_eq!(
            CbcError::InvalidConfig("endpoint.invoke_url is empty".into()).kind(),
            ErrorKind::Internal
        );
    }
}
