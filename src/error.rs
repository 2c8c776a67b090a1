//! Error taxonomy for compile attempts and its HTTP mapping.
//!
//! Every way an attempt can fail is one variant here; the HTTP layer never
//! invents statuses of its own. Failure bodies are `{"message": ...}` plus
//! an optional `"log"` carrying the compiler's stderr tail.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

/// Terminal failure of one compile attempt.
///
/// `Display` renders the client-facing message, so variants double as the
/// response body text.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Request declared a non-text content type.
    #[error("Unsupported content type. Use text/plain.")]
    UnsupportedContentType { received: Option<String> },

    /// Body was empty or whitespace-only.
    #[error("Empty LaTeX source.")]
    EmptyBody,

    /// Body contained a NUL byte.
    #[error("Invalid input: contains binary data.")]
    BinaryBody,

    /// Compiler ran and reported failure.
    #[error("LaTeX compilation failed")]
    Compile { log: String },

    /// Compiler claimed success but the artifact is missing or not a PDF.
    #[error("Compilation did not produce a valid PDF")]
    InvalidArtifact { log: String },

    /// The compile deadline elapsed and the compiler was killed.
    #[error("Compilation timed out after {limit_ms} ms.")]
    Timeout { limit_ms: u64 },

    /// The compiler process never started.
    #[error("{message}")]
    Spawn { message: String },

    /// The artifact existed but could not be read back.
    #[error("Internal error reading compiled PDF")]
    ArtifactRead { detail: String },

    /// Attempt infrastructure failed in a way no other variant covers.
    #[error("Internal server error")]
    Internal { detail: String },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<String>,
}

impl CompileError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedContentType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::EmptyBody => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BinaryBody | Self::Compile { .. } | Self::InvalidArtifact { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::Spawn { .. } | Self::ArtifactRead { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Compiler output attached to the body, when there is any.
    fn log(&self) -> Option<&str> {
        match self {
            Self::Compile { log } | Self::InvalidArtifact { log } => {
                (!log.is_empty()).then_some(log.as_str())
            }
            _ => None,
        }
    }

    /// Detail for the server log. Never sent to clients.
    fn detail(&self) -> Option<&str> {
        match self {
            Self::UnsupportedContentType { received } => received.as_deref(),
            Self::ArtifactRead { detail } | Self::Internal { detail } => Some(detail.as_str()),
            _ => None,
        }
    }
}

impl IntoResponse for CompileError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(
                %status,
                message = %self,
                detail = self.detail().unwrap_or_default(),
                "compile attempt failed"
            );
        } else {
            debug!(
                %status,
                message = %self,
                detail = self.detail().unwrap_or_default(),
                "compile attempt rejected"
            );
        }
        let body = ErrorBody {
            message: self.to_string(),
            log: self.log().map(str::to_owned),
        };
        (status, Json(body)).into_response()
    }
}
