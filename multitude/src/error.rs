//! Error taxonomy for the scrape proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors surfaced by the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The scrape request does not name a usable target.
    #[error("malformed scrape request: {0}")]
    MalformedRequest(String),

    /// The exporter for a resolved target could not be built.
    #[error("failed to construct exporter for {target}: {reason}")]
    ConstructionFailure { target: String, reason: String },

    /// Startup configuration or credentials could not be loaded.
    #[error("configuration error: {0}")]
    ConfigurationFailure(String),
}

impl ProxyError {
    /// Create a malformed request error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationFailure(msg.into())
    }

    /// HTTP status used when this error terminates a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::ConstructionFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::ConfigurationFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<multitude_common::Error> for ProxyError {
    fn from(err: multitude_common::Error) -> Self {
        Self::ConfigurationFailure(err.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), format!("{}\n", self)).into_response()
    }
}
