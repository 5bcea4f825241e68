use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Failure to obtain markup for a URL. Every variant is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },
    #[error("blocked by remote source at {url} (status {status})")]
    Blocked { url: String, status: u16 },
}

/// Markup that could not be turned into a record. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed markup: {0}")]
    MalformedInput(String),
    #[error("missing required field '{field}'")]
    MissingField { field: String },
}

/// A parsed record that breaks a data contract. Never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("duplicate key {0}")]
    DuplicateKey(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Sink-level failures. Reported per sink, never retried by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink connection failed: {0}")]
    ConnectionFailed(String),
    #[error("conflict detected on key {key}")]
    ConflictDetected { key: String },
    #[error("write failed: {0}")]
    WriteIo(String),
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        Self::WriteIo(e.to_string())
    }
}

impl From<rusqlite::Error> for SinkError {
    fn from(e: rusqlite::Error) -> Self {
        Self::WriteIo(e.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::WriteIo(e.to_string())
    }
}

/// Item-level failure tagged with the step that produced it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(_) => ErrorKind::FetchError,
            Self::Parse(_) => ErrorKind::ParseError,
            Self::Validation(_) => ErrorKind::ValidationError,
        }
    }
}

/// Diagnosable origin of an item failure, carried in batch outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    FetchError,
    ParseError,
    ValidationError,
    SinkError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FetchError => "fetch",
            Self::ParseError => "parse",
            Self::ValidationError => "validation",
            Self::SinkError => "sink",
        };
        f.write_str(s)
    }
}

/// Retryable vs. fatal classification consulted by [`crate::retry::RetryPolicy`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for ParseError {
    fn is_retryable(&self) -> bool {
        false
    }
}

impl Retryable for ValidationError {
    fn is_retryable(&self) -> bool {
        false
    }
}

impl Retryable for StageError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_retryable(),
            Self::Parse(e) => e.is_retryable(),
            Self::Validation(e) => e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_are_retryable() {
        let errors = [
            FetchError::Timeout { url: "u".into() },
            FetchError::Network { url: "u".into(), reason: "reset".into() },
            FetchError::Blocked { url: "u".into(), status: 429 },
        ];
        for e in errors {
            assert!(StageError::from(e).is_retryable());
        }
    }

    #[test]
    fn parse_and_validation_errors_are_fatal() {
        let parse = StageError::from(ParseError::MalformedInput("no table".into()));
        let validation = StageError::from(ValidationError::DuplicateKey("x".into()));
        assert!(!parse.is_retryable());
        assert!(!validation.is_retryable());
    }

    #[test]
    fn kind_tracks_origin() {
        assert_eq!(
            StageError::from(FetchError::Timeout { url: "u".into() }).kind(),
            ErrorKind::FetchError
        );
        assert_eq!(
            StageError::from(ParseError::MissingField { field: "name".into() }).kind(),
            ErrorKind::ParseError
        );
        assert_eq!(
            StageError::from(ValidationError::DuplicateKey("k".into())).kind(),
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn display_is_transparent() {
        let e = StageError::from(FetchError::Blocked { url: "https://x".into(), status: 403 });
        assert_eq!(e.to_string(), "blocked by remote source at https://x (status 403)");
    }
}
