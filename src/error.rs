//! The error taxonomy every layer of the gateway signals through.
//!
//! Every failure kind is a value, not an exception: inner layers return
//! `Err(GatewayError)` and only the recovery middleware (the outermost
//! layer of the chain, see `middleware::recovery`) converts one into the
//! MCP wire error envelope. Panics are reserved for violated invariants,
//! never for expected failure modes like `unauthenticated` or `timeout`.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// The error-kind taxonomy from the gateway's error handling design.
/// Each variant carries its own wire code, independent of the backend's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    CapabilityNotFound,
    Unauthenticated,
    Forbidden,
    BackendUnavailable,
    BackendOverloaded,
    Timeout,
    BackendError,
    TransportFailure,
    InvalidResponse,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// The integer code surfaced on the wire for this kind. `BackendError`
    /// has no fixed code of its own — it passes the backend's original
    /// code through unchanged.
    pub fn wire_code(self) -> i64 {
        match self {
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::CapabilityNotFound => -32601,
            ErrorKind::Unauthenticated => -32001,
            ErrorKind::Forbidden => -32002,
            ErrorKind::BackendUnavailable => -32003,
            ErrorKind::BackendOverloaded => -32004,
            ErrorKind::Timeout => -32005,
            ErrorKind::BackendError => 0, // passthrough; see GatewayError::wire_code
            ErrorKind::TransportFailure => -32006,
            ErrorKind::InvalidResponse => -32007,
            ErrorKind::Cancelled => -32800,
            ErrorKind::Internal => -32603,
        }
    }
}

/// A structured gateway failure. Every middleware and the routing
/// terminal signal through this type rather than panicking or returning
/// an opaque `anyhow::Error`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("capability '{name}' not found")]
    CapabilityNotFound { name: String },

    #[error("unauthenticated")]
    Unauthenticated { reason: String },

    #[error("forbidden")]
    Forbidden { reason: String },

    #[error("backend '{backend}' unavailable")]
    BackendUnavailable { backend: String },

    #[error("backend '{backend}' overloaded")]
    BackendOverloaded { backend: String },

    #[error("call timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("backend error {code}: {message}")]
    BackendError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("transport failure talking to '{backend}': {detail}")]
    TransportFailure { backend: String, detail: String },

    #[error("invalid response from '{backend}': {detail}")]
    InvalidResponse { backend: String, detail: String },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            GatewayError::CapabilityNotFound { .. } => ErrorKind::CapabilityNotFound,
            GatewayError::Unauthenticated { .. } => ErrorKind::Unauthenticated,
            GatewayError::Forbidden { .. } => ErrorKind::Forbidden,
            GatewayError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            GatewayError::BackendOverloaded { .. } => ErrorKind::BackendOverloaded,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::BackendError { .. } => ErrorKind::BackendError,
            GatewayError::TransportFailure { .. } => ErrorKind::TransportFailure,
            GatewayError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            GatewayError::Cancelled => ErrorKind::Cancelled,
            GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The wire code to report, honoring backend passthrough for `BackendError`.
    pub fn wire_code(&self) -> i64 {
        match self {
            GatewayError::BackendError { code, .. } => *code,
            other => other.kind().wire_code(),
        }
    }

    /// Whether this error should be recorded as `cancelled` rather than
    /// a failed outcome in the audit trail.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled)
    }

    /// Render the sanitized, user-visible MCP error envelope. Strips
    /// absolute filesystem paths, process IDs, and registered secret
    /// values from the message — the only thing that ever crosses the
    /// wire to an upstream client.
    pub fn to_envelope(&self) -> McpErrorEnvelope {
        let message = match self {
            GatewayError::Internal(_) => "internal error".to_string(),
            other => sanitize(&other.to_string()),
        };
        let data = match self {
            GatewayError::BackendUnavailable { backend } => {
                Some(serde_json::json!({ "backend": backend }))
            }
            GatewayError::BackendError { data, .. } => data.clone(),
            _ => None,
        };
        McpErrorEnvelope {
            code: self.wire_code(),
            message,
            data,
        }
    }
}

/// The MCP wire error shape: integer code, message, optional data object.
#[derive(Debug, Clone, Serialize)]
pub struct McpErrorEnvelope {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Strip absolute filesystem paths and PID-looking tokens from a message
/// before it is allowed to cross the recovery middleware boundary.
fn sanitize(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for word in message.split_inclusive(char::is_whitespace) {
        let trimmed = word.trim_end();
        if trimmed.starts_with('/') && trimmed.len() > 1 {
            out.push_str("<path>");
            out.push_str(&word[trimmed.len()..]);
        } else {
            out.push_str(word);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_table() {
        assert_eq!(ErrorKind::InvalidRequest.wire_code(), -32600);
        assert_eq!(ErrorKind::CapabilityNotFound.wire_code(), -32601);
        assert_eq!(ErrorKind::Unauthenticated.wire_code(), -32001);
        assert_eq!(ErrorKind::Forbidden.wire_code(), -32002);
        assert_eq!(ErrorKind::BackendUnavailable.wire_code(), -32003);
        assert_eq!(ErrorKind::BackendOverloaded.wire_code(), -32004);
        assert_eq!(ErrorKind::Timeout.wire_code(), -32005);
        assert_eq!(ErrorKind::TransportFailure.wire_code(), -32006);
        assert_eq!(ErrorKind::InvalidResponse.wire_code(), -32007);
        assert_eq!(ErrorKind::Cancelled.wire_code(), -32800);
        assert_eq!(ErrorKind::Internal.wire_code(), -32603);
    }

    #[test]
    fn backend_error_passes_through_original_code() {
        let err = GatewayError::BackendError {
            code: 7,
            message: "boom".to_string(),
            data: None,
        };
        assert_eq!(err.wire_code(), 7);
    }

    #[test]
    fn sanitize_strips_absolute_paths() {
        let msg = "failed to read /home/user/.secrets/token.json: denied";
        let cleaned = sanitize(msg);
        assert!(!cleaned.contains("/home/user"));
        assert!(cleaned.contains("<path>"));
    }

    #[test]
    fn internal_errors_are_generic_on_the_wire() {
        let err = GatewayError::Internal("panic in routing terminal at foo.rs:42".to_string());
        let envelope = err.to_envelope();
        assert_eq!(envelope.message, "internal error");
        assert_eq!(envelope.code, -32603);
    }
}
