use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors produced while relaying a request to an upstream origin.
///
/// Client input problems map to 400 and are reported before any network call.
/// Upstream transport failures and timeouts map to 500. None of them are
/// retried here; the player owns retry policy.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Missing \"url\" query parameter")]
    MissingUrl,

    #[error("Invalid \"url\" query parameter: {0}")]
    InvalidUrl(String),

    #[error("Origin not allowed: {0}")]
    InvalidOrigin(String),

    #[error("Missing Host header")]
    MissingHost,

    #[error("Upstream request to {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upstream request to {url} timed out")]
    Timeout { url: String },

    #[error("Upstream body from {url} exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },

    #[error("Request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Status code sent to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingUrl
            | RelayError::InvalidUrl(_)
            | RelayError::InvalidOrigin(_)
            | RelayError::MissingHost => StatusCode::BAD_REQUEST,
            RelayError::Upstream { .. } | RelayError::Timeout { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RelayError::BodyTooLarge { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether the origin (not the client) is at fault.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            RelayError::Upstream { .. }
                | RelayError::Timeout { .. }
                | RelayError::BodyTooLarge { .. }
        )
    }

    /// Short failure class used in logs and metrics labels.
    pub fn class(&self) -> &'static str {
        match self {
            RelayError::MissingUrl
            | RelayError::InvalidUrl(_)
            | RelayError::InvalidOrigin(_)
            | RelayError::MissingHost => "client_input",
            RelayError::Upstream { .. }
            | RelayError::Timeout { .. }
            | RelayError::BodyTooLarge { .. } => "upstream",
            RelayError::Cancelled => "cancelled",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            RelayError::Upstream { source, .. } => {
                warn!("{} error: {}", self.class(), self);
                ErrorBody {
                    error: "Proxy Request Failed".to_string(),
                    details: Some(source.to_string()),
                }
            }
            RelayError::Cancelled => {
                debug!("Relay request cancelled before a response was produced");
                ErrorBody {
                    error: self.to_string(),
                    details: None,
                }
            }
            _ => {
                warn!("{} error: {}", self.class(), self);
                ErrorBody {
                    error: self.to_string(),
                    details: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}
