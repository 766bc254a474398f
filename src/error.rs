//! Error types for the MCP server and the wrapped-API dispatch path.
//!
//! Two layers live here. [`Error`] covers protocol and process failures that
//! the server reports as JSON-RPC errors. [`ErrorCode`] and [`ErrorInfo`]
//! describe failed tool operations, which are always returned as data inside
//! a tool result and never escape as JSON-RPC errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Scheme;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// MCP server errors.
#[derive(Error, Debug)]
pub enum Error {
    /// JSON-RPC protocol error.
    #[error("JSON-RPC error: {code} - {message}")]
    JsonRpc {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// Tool not found.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client construction or transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::JsonRpc { code, .. } => *code,
            Error::ToolNotFound(_) => codes::METHOD_NOT_FOUND,
            Error::InvalidParams(_) => codes::INVALID_PARAMS,
            Error::Config(_) => -32000,
            Error::Http(_) => -32001,
            Error::Serialization(_) => codes::PARSE_ERROR,
            Error::Io(_) => -32002,
        }
    }
}

/// Standard JSON-RPC error codes.
pub mod codes {
    /// Parse error.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Machine-readable failure code carried by every failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Local quota bucket exhausted; no network call was made.
    RateLimitLocal,
    /// Upstream answered 429.
    RateLimitExceeded,
    /// The requested scheme has no secret configured.
    CredentialMissing,
    /// Upstream answered 401 or 403.
    AuthError,
    /// Upstream returned a structured domain error.
    ApiError,
    /// Any other transport failure, including timeouts and unexpected statuses.
    RequestFailed,
    /// The operation needs a scheme that is not configured.
    NotSupported,
    /// A required account-level identifier is missing from configuration.
    ConfigError,
    /// Tool arguments failed schema validation.
    InvalidParams,
}

impl ErrorCode {
    /// Wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimitLocal => "RATE_LIMIT_LOCAL",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::CredentialMissing => "CREDENTIAL_MISSING",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::RequestFailed => "REQUEST_FAILED",
            ErrorCode::NotSupported => "NOT_SUPPORTED",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional structured context attached to a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Scheme involved in the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<Scheme>,
    /// HTTP status returned by upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Seconds to wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Upstream's own error code, when it reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_code: Option<String>,
    /// Quota category involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ErrorDetails {
    fn is_empty(&self) -> bool {
        *self == ErrorDetails::default()
    }
}

/// A failed operation, reported as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "ErrorInfo::details_empty")]
    pub details: ErrorDetails,
}

impl ErrorInfo {
    /// Create a failure with no details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: ErrorDetails::default(),
        }
    }

    /// Attach the scheme involved.
    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.details.scheme = Some(scheme);
        self
    }

    /// Attach the upstream HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.details.status = Some(status);
        self
    }

    /// Attach a retry-after hint.
    pub fn with_retry_after(mut self, secs: Option<u64>) -> Self {
        self.details.retry_after_secs = secs;
        self
    }

    /// Attach upstream's own error code.
    pub fn with_upstream_code(mut self, code: impl Into<String>) -> Self {
        self.details.upstream_code = Some(code.into());
        self
    }

    /// Attach the quota category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.details.category = Some(category.into());
        self
    }

    fn details_empty(details: &ErrorDetails) -> bool {
        details.is_empty()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

impl From<Error> for ErrorInfo {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::InvalidParams(_) => ErrorCode::InvalidParams,
            Error::Config(_) => ErrorCode::ConfigError,
            _ => ErrorCode::RequestFailed,
        };
        ErrorInfo::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_in_wire_form() {
        let value = serde_json::to_value(ErrorCode::RateLimitLocal).unwrap();
        assert_eq!(value, "RATE_LIMIT_LOCAL");
        assert_eq!(ErrorCode::NotSupported.to_string(), "NOT_SUPPORTED");
    }

    #[test]
    fn empty_details_are_omitted() {
        let info = ErrorInfo::new(ErrorCode::AuthError, "denied");
        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("details").is_none());

        let info = info.with_status(403).with_scheme(Scheme::TokenBearer);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["details"]["status"], 403);
        assert_eq!(value["details"]["scheme"], "token_bearer");
    }

    #[test]
    fn server_errors_map_to_failure_codes() {
        let info: ErrorInfo = Error::InvalidParams("missing media_id".into()).into();
        assert_eq!(info.code, ErrorCode::InvalidParams);

        let info: ErrorInfo = Error::Config("no account".into()).into();
        assert_eq!(info.code, ErrorCode::ConfigError);
    }
}
