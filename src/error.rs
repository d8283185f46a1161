//! Error taxonomy shared by the CA, the authenticator and the distribution
//! orchestrator.
//!
//! Every variant is surfaced to HTTP callers as a JSON status body; none of
//! them is fatal to the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::Json;

use crate::protocol::{Response, StatusResponse};

pub type Result<T> = std::result::Result<T, BootError>;

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// Missing or wrong Basic credentials, or an unusable token.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed or non-verifying body signature.
    #[error("signature verification failed: {0}")]
    Signature(String),

    /// Malformed PEM/DER for a key, CSR or certificate.
    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("failed to generate key: {0}")]
    KeyGeneration(String),

    /// Certificate template construction or cryptographic signing failed.
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("failed to initialize certificate authority: {0}")]
    CaInitialization(String),

    #[error("failed to allocate serial number: {0}")]
    SerialAllocation(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Outbound HTTP call failure or timeout.
    #[error("transport error calling {target}: {reason}")]
    Transport {
        target: String,
        reason: String,
        timed_out: bool,
    },

    /// One or more distribution targets reported a non-success status.
    #[error("distribution failed for {} target(s)", failed_targets(.0))]
    PartialDistribution(Vec<Response>),

    /// The request payload is structurally unusable (bad JSON, no servers).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

fn failed_targets(responses: &[Response]) -> usize {
    responses.iter().filter(|r| !r.is_success()).count()
}

impl BootError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BootError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn parse(what: &'static str, reason: impl ToString) -> Self {
        BootError::Parse {
            what,
            reason: reason.to_string(),
        }
    }

    /// HTTP status the error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BootError::Authentication(_) => StatusCode::UNAUTHORIZED,
            BootError::Signature(_) => StatusCode::NOT_ACCEPTABLE,
            BootError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BootError {
    fn into_response(self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::warn!("request rejected: {}", self);
        }
        (
            status,
            Json(StatusResponse {
                status: self.to_string(),
            }),
        )
            .into_response()
    }
}
