//! Error types for the capture, storage, transport and exchange layers.

use std::path::PathBuf;

use thiserror::Error;

/// Reasons the capture guard refuses a capture request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Screenshot already in progress. Please wait for the current screenshot to complete.")]
    AlreadyInProgress,

    #[error(
        "Too many screenshot attempts. Please wait before taking another screenshot. \
         (Max {max_attempts} per {window_secs} seconds)"
    )]
    RateLimited { max_attempts: usize, window_secs: u64 },

    #[error("Please wait {wait_secs} second(s) before taking another screenshot.")]
    Throttled { wait_secs: u64 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to save screenshot to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read screenshot at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to initialize screenshot directory {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// The OS refused screen access. The message is the OS text, unmodified.
    #[error("{0}")]
    PermissionDenied(String),

    #[error("Failed to capture screenshot: {0}")]
    Failed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures from a model transport. Carries enough detail for logging while
/// the `Display` text stays short enough to show to a user.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timed out. Try again.")]
    Timeout,

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Status { code: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    /// The endpoint refused the connection. Carries the full user message.
    #[error("{0}")]
    Unreachable(String),

    #[error("Unexpected API response: {0}")]
    Decode(String),

    #[error("Empty response from API.")]
    EmptyResponse,
}

impl TransportError {
    /// Map an HTTP status and body to a user-facing message.
    pub fn from_status(code: u16, body: &str) -> Self {
        let message = match code {
            400 => "Bad request. Try fewer or smaller screenshots.".to_string(),
            401 | 403 => "Invalid API key. Check your configuration.".to_string(),
            429 => "Rate limited by the model provider. Try again shortly.".to_string(),
            500 | 503 => "API server error. Try again.".to_string(),
            code if body.trim().is_empty() => format!("API error (HTTP {code})."),
            code => format!("API error (HTTP {code}): {}", body.trim()),
        };
        Self::Status { code, message }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("No screenshots to process.")]
    NoScreenshots,

    #[error("A request is already being processed.")]
    Busy,

    #[error("API key not set. Please enter your Gemini API key.")]
    NotConfigured,

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Stream timeout with no data received")]
    StreamTimedOut,

    #[error("No data received from stream")]
    EmptyStream,

    #[error("Request cancelled.")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Background task failed: {0}")]
    Task(String),
}
