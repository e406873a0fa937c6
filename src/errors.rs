//! Gateway error types.
//!
//! [`StoreError`] is shared by the storage providers, the policy engine and
//! the HTTP boundary.  The typed variants carry the failure semantics the
//! callers branch on; `Io` and `Backend` wrap backend-native failures
//! unmodified.  The enum implements [`axum::response::IntoResponse`] so
//! handlers can simply return `Err(StoreError::NotFound { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Failures of the gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No committed record exists for the id.
    #[error("Blob not found: {id}")]
    NotFound { id: String },

    /// A record already exists for the id.
    #[error("Blob already exists: {id}")]
    AlreadyExists { id: String },

    /// The backend could not be initialized (unreachable, missing bucket, bad root).
    #[error("Storage backend misconfigured: {message}")]
    Configuration { message: String },

    /// Malformed caller input (policy, envelope, id).
    #[error("{message}")]
    Validation { message: String },

    /// The decision engine refused the action.
    #[error("Access to {action} denied")]
    AuthorizationDenied { action: String, authenticated: bool },

    /// The bearer token was present but could not be verified.
    #[error("Invalid token: {message}")]
    Unauthenticated { message: String },

    /// Filesystem or stream I/O failure, passed through as-is.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other backend failure (object store SDK, corrupt metadata).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Build a [`StoreError::Validation`] from anything printable.
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation {
            message: message.into(),
        }
    }

    /// Build a [`StoreError::Configuration`] from anything printable.
    pub fn configuration(message: impl Into<String>) -> Self {
        StoreError::Configuration {
            message: message.into(),
        }
    }

    /// Short machine-readable code, used for logs and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NotFound",
            StoreError::AlreadyExists { .. } => "AlreadyExists",
            StoreError::Configuration { .. } => "ConfigurationError",
            StoreError::Validation { .. } => "ValidationError",
            StoreError::AuthorizationDenied { .. } => "AuthorizationDenied",
            StoreError::Unauthenticated { .. } => "Unauthenticated",
            StoreError::Io(_) => "IoError",
            StoreError::Backend(_) => "BackendError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists { .. } => StatusCode::CONFLICT,
            StoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            StoreError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            StoreError::AuthorizationDenied { authenticated, .. } => {
                if *authenticated {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::UNAUTHORIZED
                }
            }
            StoreError::Configuration { .. } | StoreError::Io(_) | StoreError::Backend(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the error is a server-side failure rather than a caller mistake.
    pub fn is_internal(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs.
        let body = if self.is_internal() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            [
                ("content-type", "text/plain; charset=utf-8".to_string()),
                ("x-request-id", generate_request_id()),
            ],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let not_found = StoreError::NotFound { id: "x".into() };
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let exists = StoreError::AlreadyExists { id: "x".into() };
        assert_eq!(exists.status_code(), StatusCode::CONFLICT);

        assert_eq!(
            StoreError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StoreError::configuration("nope").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_denied_status_depends_on_principal() {
        let anonymous = StoreError::AuthorizationDenied {
            action: "queries.getBlob".into(),
            authenticated: false,
        };
        assert_eq!(anonymous.status_code(), StatusCode::UNAUTHORIZED);

        let authenticated = StoreError::AuthorizationDenied {
            action: "queries.getBlob".into(),
            authenticated: true,
        };
        assert_eq!(authenticated.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_io_error_passes_through() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(ref e) if e.kind() == std::io::ErrorKind::PermissionDenied));
        assert!(err.is_internal());
        assert_eq!(err.code(), "IoError");
    }

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let err = StoreError::Backend(anyhow::anyhow!("secret endpoint detail"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
