//! Error taxonomy.
//!
//! Inside a scan, peer behaviour is never an error: an unreachable server or
//! a broken certificate becomes a check result. The types here cover
//! everything else — wiring failures at startup, storage failures, and the
//! user-versus-server distinction the submission boundary needs so the HTTP
//! layer can map outcomes to 4xx versus 5xx.

use log::SetLoggerError;
use thiserror::Error;

/// Errors raised while wiring up process-wide resources.
#[derive(Error, Debug)]
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    Logger(#[from] SetLoggerError),

    /// Error initializing an HTTP client.
    #[error("HTTP client initialization error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// A required environment variable is absent.
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
}

/// Errors surfaced by the persistence layer.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQL execution error.
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// A stored row could not be decoded back into its model type.
    #[error("stored row could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DatabaseError {
    /// True when the error means "no such row" rather than a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::Sql(sqlx::Error::RowNotFound))
    }
}

/// Failures at the policy submission boundary.
///
/// Everything except [`SubmissionError::Internal`] is the caller's fault and
/// maps to a 4xx; `Internal` maps to a 5xx and is worth reporting.
#[derive(Error, Debug)]
pub enum SubmissionError {
    /// The caller supplied something malformed or unacceptable.
    #[error("{0}")]
    UserInput(String),

    /// The referenced domain, scan, or token does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The submission conflicts with existing state and cannot be applied.
    #[error("{0}")]
    Conflict(String),

    /// Storage or logic failure on our side.
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl SubmissionError {
    /// True when the failure should be reported back as the caller's error.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, SubmissionError::Internal(_))
    }
}

impl From<DatabaseError> for SubmissionError {
    fn from(e: DatabaseError) -> Self {
        SubmissionError::Internal(anyhow::Error::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_are_distinguished_from_internal() {
        assert!(SubmissionError::UserInput("bad domain".into()).is_user_error());
        assert!(SubmissionError::NotFound("no scan".into()).is_user_error());
        assert!(SubmissionError::Conflict("exists".into()).is_user_error());
        assert!(!SubmissionError::Internal(anyhow::anyhow!("db down")).is_user_error());
    }

    #[test]
    fn row_not_found_is_not_found() {
        assert!(DatabaseError::Sql(sqlx::Error::RowNotFound).is_not_found());
        let decode = serde_json::from_str::<i64>("not json").expect_err("bad json");
        assert!(!DatabaseError::Decode(decode).is_not_found());
    }
}
