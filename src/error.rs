//! Crate-wide error taxonomy for the gateway.
//!
//! Mirrors the error kinds named in the engine specification: `not-found`,
//! `validation`, `upstream-transport`, `upstream-semantic`, `capture-io`,
//! `registry-io`, `codemode-execution`, `codemode-timeout`. Each kind knows
//! how to render itself as an HTTP response for the router and, separately,
//! as a synthesized JSON-RPC error envelope for the proxy engine.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

/// The JSON-RPC error code the proxy engine synthesizes for transport failures.
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("server '{0}' is not registered")]
    NotFound(String),

    #[error("validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("forwarding to upstream '{server}' failed: {source}")]
    UpstreamTransport {
        server: String,
        #[source]
        source: anyhow::Error,
    },

    /// The upstream answered with a well-formed JSON-RPC error. This is never
    /// rewritten; it is passed through to the client verbatim. Carrying it as
    /// a variant lets the proxy engine route it through the same capture/log
    /// plumbing as every other outcome.
    #[error("upstream '{server}' returned JSON-RPC error {code}: {message}")]
    UpstreamSemantic {
        server: String,
        code: i64,
        message: String,
        envelope: Value,
    },

    #[error("failed to write capture record: {0}")]
    CaptureIo(#[source] anyhow::Error),

    #[error("failed to persist registry: {0}")]
    RegistryIo(#[source] anyhow::Error),

    #[error("script execution failed: {0}")]
    CodemodeExecution(String),

    #[error("script execution timed out after {0}ms")]
    CodemodeTimeout(u64),
}

impl GatewayError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Builds the synthesized JSON-RPC error envelope described by the proxy
    /// engine's algorithm step 12. `upstream-semantic` errors are excluded
    /// from this path on purpose — callers should match on that variant and
    /// forward `envelope` unchanged instead.
    pub fn to_jsonrpc_error(&self, id: Value) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": JSONRPC_INTERNAL_ERROR,
                "message": self.to_string(),
            }
        })
    }

    /// A short machine-readable kind, used both in HTTP error bodies and capture records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::Validation { .. } => "validation",
            Self::UpstreamTransport { .. } => "upstream-transport",
            Self::UpstreamSemantic { .. } => "upstream-semantic",
            Self::CaptureIo(_) => "capture-io",
            Self::RegistryIo(_) => "registry-io",
            Self::CodemodeExecution(_) => "codemode-execution",
            Self::CodemodeTimeout(_) => "codemode-timeout",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::RegistryIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamTransport { .. }
            | Self::UpstreamSemantic { .. }
            | Self::CaptureIo(_)
            | Self::CodemodeExecution(_)
            | Self::CodemodeTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
