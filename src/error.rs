//! Error types for every engine component

use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure taxonomy of a dispatch attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidUrl,
    InvalidRequest,
    Offline,
    NetworkError,
    CorsBlocked,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Stable code recorded in history entries
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidUrl => "INVALID_URL",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Offline => "OFFLINE_ERROR",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::CorsBlocked => "CORS_ERROR",
            ErrorKind::Cancelled => "ABORT_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A categorized dispatch failure
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DispatchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        DispatchError {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidUrl, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Input validation failures, detected before any network effort.
    pub fn is_validation(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidUrl | ErrorKind::InvalidRequest)
    }
}

/// Persistent store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{store} record `{id}` not found")]
    NotFound { store: &'static str, id: String },
    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
}

/// cURL decoding failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CurlError {
    #[error("URL not found in curl command")]
    MissingUrl,
}

/// JSON import failure
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Document is not a JSON object")]
    NotAnObject,
    #[error("Missing required field `{0}`")]
    MissingField(&'static str),
    #[error("Document is neither a request nor a collection")]
    UnknownShape,
}

/// Failure surfaced by the session orchestrator
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Invalid(#[from] DispatchError),
    #[error("Pre-request script error: {0}")]
    PreRequestScript(String),
    #[error("Auth signature script error: {0}")]
    SignatureScript(String),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Curl(#[from] CurlError),
}
