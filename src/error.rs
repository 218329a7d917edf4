//! Error taxonomy for the supervisor and JSON error responses for the API

use crate::process::RuntimeKey;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors from process registry operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No configuration record with this name
    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// A variant was requested that the configuration does not declare
    #[error("variant '{variant}' not configured for '{server}'")]
    VariantNotFound { server: String, variant: String },

    /// The configuration declares variants but none was selected
    #[error("server '{0}' declares env subdomains; select a variant")]
    VariantRequired(String),

    /// No usable port could be obtained
    #[error("no port available for {key}: {reason}")]
    Allocation { key: RuntimeKey, reason: String },

    /// The child process could not be created
    #[error("failed to spawn {key}: {source}")]
    Spawn {
        key: RuntimeKey,
        #[source]
        source: std::io::Error,
    },

    /// Both the graceful signal and the forceful kill failed
    #[error("failed to terminate {key}: {reason}")]
    Termination { key: RuntimeKey, reason: String },

    /// The log file for a key could not be opened or read
    #[error("log file for {key}: {source}")]
    Log {
        key: RuntimeKey,
        #[source]
        source: std::io::Error,
    },

    /// The configuration store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The registry task has exited
    #[error("process registry is not running")]
    RegistryClosed,
}

impl SupervisorError {
    /// API error code for this error
    pub fn code(&self) -> ApiErrorCode {
        match self {
            SupervisorError::ServerNotFound(_)
            | SupervisorError::VariantNotFound { .. }
            | SupervisorError::VariantRequired(_) => ApiErrorCode::NotFound,
            SupervisorError::Allocation { .. } => ApiErrorCode::AllocationFailed,
            SupervisorError::Spawn { .. } => ApiErrorCode::SpawnFailed,
            SupervisorError::Termination { .. } => ApiErrorCode::TerminationFailed,
            SupervisorError::Log { .. }
            | SupervisorError::Store(_)
            | SupervisorError::RegistryClosed => ApiErrorCode::InternalError,
        }
    }
}

/// Errors from the configuration store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("config store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed server config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid server name '{0}'")]
    InvalidName(String),
}

/// Errors from the reverse proxy collaborator
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The proxy process could not be started or never became reachable
    #[error("reverse proxy failed to start: {0}")]
    Start(String),

    /// The admin endpoint could not be reached
    #[error("reverse proxy unreachable: {0}")]
    Unreachable(String),

    /// The proxy refused the pushed configuration
    #[error("reverse proxy rejected config (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("reverse proxy I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal daemon startup errors
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to bind API listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("liveness marker {path}: {source}")]
    LivenessMarker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid daemon configuration: {0}")]
    Config(String),
}

/// Error codes returned by the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Unknown server or undeclared variant
    NotFound,
    /// No free port for the requested start
    AllocationFailed,
    /// The child process could not be created
    SpawnFailed,
    /// The process survived both termination signals
    TerminationFailed,
    /// Malformed request
    BadRequest,
    /// Internal daemon error
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::AllocationFailed => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::SpawnFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::TerminationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Devgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::AllocationFailed => "ALLOCATION_FAILED",
            ApiErrorCode::SpawnFailed => "SPAWN_FAILED",
            ApiErrorCode::TerminationFailed => "TERMINATION_FAILED",
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ApiErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Devgate-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .header("x-devgate-error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_errors_map_to_taxonomy() {
        assert_eq!(
            SupervisorError::ServerNotFound("x".into()).code(),
            ApiErrorCode::NotFound
        );
        assert_eq!(
            SupervisorError::VariantNotFound {
                server: "x".into(),
                variant: "eu".into()
            }
            .code(),
            ApiErrorCode::NotFound
        );
        assert_eq!(
            SupervisorError::VariantRequired("x".into()).code(),
            ApiErrorCode::NotFound
        );
        assert_eq!(
            SupervisorError::Allocation {
                key: RuntimeKey::new("x", None),
                reason: "busy".into()
            }
            .code(),
            ApiErrorCode::AllocationFailed
        );
        assert_eq!(SupervisorError::RegistryClosed.code(), ApiErrorCode::InternalError);
    }

    #[test]
    fn test_error_messages_name_the_key() {
        let err = SupervisorError::VariantNotFound {
            server: "myapp".into(),
            variant: "eu".into(),
        };
        assert_eq!(err.to_string(), "variant 'eu' not configured for 'myapp'");

        let err = SupervisorError::Allocation {
            key: RuntimeKey::new("myapp", Some("sg")),
            reason: "port 3000 is held by myapp[us]".into(),
        };
        assert!(err.to_string().contains("myapp[sg]"));
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ApiErrorCode::NotFound, "server 'web' not found");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"server 'web' not found\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ApiErrorCode::AllocationFailed, "no port");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("x-devgate-error").unwrap(),
            "ALLOCATION_FAILED"
        );
    }
}
