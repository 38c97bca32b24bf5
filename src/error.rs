//! Error types shared by the store, the execution engine and the remote client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid expected schema, reasons: {}", .0.join("; "))]
    InvalidExpectation(Vec<String>),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Session expired, sign in again")]
    SessionExpired,

    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }

    /// Status code reported for this error, matching the codes the hosted
    /// backend answers with for the same failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) | Error::Json(_) => 400,
            Error::SessionExpired => 401,
            Error::AccessDenied(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) | Error::Sql(_) => 409,
            Error::InvalidExpectation(_) => 422,
            Error::Cancelled => 499,
            Error::Request(_) | Error::Http(_) => 502,
            Error::Timeout(_) => 504,
            Error::Remote { status, .. } => *status,
            Error::Config(_) | Error::Io(_) => 500,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::InvalidInput(format!("invalid regex: {err}"))
    }
}
