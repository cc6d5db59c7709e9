use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Closed error taxonomy for the whole crate. Every fallible operation in the
/// core returns one of these; the dispatch layer is the only place that turns
/// a variant into the wire-level `{error, error_type, message, details}` record.
#[derive(Debug)]
pub enum CodeMemoryError {
    Validation { message: String, details: Option<Value> },
    Storage { message: String, details: Option<Value> },
    Indexing { message: String, details: Option<Value> },
    Git { message: String, details: Option<Value> },
    Embedding { message: String, details: Option<Value> },
}

impl CodeMemoryError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), details: None }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into(), details: None }
    }

    pub fn indexing(message: impl Into<String>) -> Self {
        Self::Indexing { message: message.into(), details: None }
    }

    pub fn git(message: impl Into<String>) -> Self {
        Self::Git { message: message.into(), details: None }
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding { message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        match &mut self {
            Self::Validation { details: d, .. }
            | Self::Storage { details: d, .. }
            | Self::Indexing { details: d, .. }
            | Self::Git { details: d, .. }
            | Self::Embedding { details: d, .. } => *d = Some(details),
        }
        self
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Storage { .. } => "storage",
            Self::Indexing { .. } => "indexing",
            Self::Git { .. } => "git",
            Self::Embedding { .. } => "embedding",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation { message, .. }
            | Self::Storage { message, .. }
            | Self::Indexing { message, .. }
            | Self::Git { message, .. }
            | Self::Embedding { message, .. } => message,
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Validation { details, .. }
            | Self::Storage { details, .. }
            | Self::Indexing { details, .. }
            | Self::Git { details, .. }
            | Self::Embedding { details, .. } => details.as_ref(),
        }
    }

    /// The uniform wire-level error record, per the external-interface contract.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            error: true,
            error_type: self.error_type().to_string(),
            message: self.message().to_string(),
            details: self.details().cloned(),
        }
    }
}

impl fmt::Display for CodeMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type(), self.message())
    }
}

impl std::error::Error for CodeMemoryError {}

impl From<rusqlite::Error> for CodeMemoryError {
    fn from(e: rusqlite::Error) -> Self {
        CodeMemoryError::storage(e.to_string())
    }
}

impl From<std::io::Error> for CodeMemoryError {
    fn from(e: std::io::Error) -> Self {
        CodeMemoryError::indexing(e.to_string())
    }
}

impl From<git2::Error> for CodeMemoryError {
    fn from(e: git2::Error) -> Self {
        CodeMemoryError::git(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub error: bool,
    pub error_type: String,
    pub message: String,
    pub details: Option<Value>,
}

/// Builds the uniform error record for any boxed error reaching the dispatch
/// boundary that isn't already a `CodeMemoryError` (e.g. a stray `anyhow::Error`).
pub fn format_error(err: &CodeMemoryError) -> ErrorRecord {
    err.to_record()
}

pub type Result<T> = std::result::Result<T, CodeMemoryError>;
