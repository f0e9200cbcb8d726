//! Error types for the generation pipeline.

use std::time::Duration;

/// Errors that can occur while generating, fetching or storing an image.
#[derive(Debug, thiserror::Error)]
pub enum FluxViewError {
    /// Request rejected locally before any network call.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// API key missing or rejected by the remote service.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Credential value refused by the credential store.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Remote service rejected the payload (4xx other than 401/403).
    #[error("request rejected: {status} - {message}")]
    Validation { status: u16, message: String },

    /// Remote service returned an unexpected non-success status.
    #[error("API error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Transport failure or request timeout.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Poll budget exhausted before the job reached a terminal status.
    #[error("job did not finish after {0:?}")]
    Timeout(Duration),

    /// Remote job finished in a failed state.
    #[error("generation failed: {0}")]
    Remote(String),

    /// Downloading the generated image returned a non-success status.
    #[error("image download failed with status {status}")]
    Fetch { status: u16 },

    /// I/O error (e.g., saving file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image bytes could not be decoded.
    #[error("image decode error: {0}")]
    Image(#[from] ::image::ImageError),

    /// Configuration value missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Error categories reported to the presentation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any network call.
    InvalidRequest,
    /// Bad or missing credential.
    Auth,
    /// Payload or value refused.
    Validation,
    /// Transport, timeout or unexpected HTTP status on create/poll.
    Network,
    /// The remote job itself failed.
    Remote,
    /// Non-success status while downloading image bytes.
    Fetch,
    /// Local filesystem failure.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid_request",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Remote => "remote",
            Self::Fetch => "fetch",
            Self::Io => "io",
        };
        f.write_str(s)
    }
}

impl FluxViewError {
    /// Returns the category this error is reported under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) | Self::Config(_) => ErrorKind::InvalidRequest,
            Self::Auth(_) => ErrorKind::Auth,
            Self::InvalidCredential(_) | Self::Validation { .. } => ErrorKind::Validation,
            Self::Http { .. } | Self::Network(_) | Self::Timeout(_) | Self::Json(_) => {
                ErrorKind::Network
            }
            Self::Remote(_) => ErrorKind::Remote,
            Self::Fetch { .. } | Self::Image(_) => ErrorKind::Fetch,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Validation { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::Fetch { status } => Some(*status),
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, FluxViewError>;
