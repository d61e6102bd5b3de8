//! Error kinds for orchestrator operations and their JSON rendering

use crate::engine::EngineError;
use crate::registry::RegistryError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Failure of a Launch / Terminate / Logs / List call
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Subdomain or registry key is absent
    #[error("{0}")]
    NotFound(String),
    /// The container engine rejected or failed a call
    #[error("engine error: {0}")]
    Engine(String),
    /// Caller input is malformed
    #[error("invalid request: {0}")]
    Validation(String),
    /// The registry could not be read or written
    #[error("registry error: {0}")]
    Persistence(String),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::NotFound(_) => ErrorCode::NotFound,
            OrchestratorError::Engine(_) => ErrorCode::EngineError,
            OrchestratorError::Validation(_) => ErrorCode::ValidationError,
            OrchestratorError::Persistence(_) => ErrorCode::PersistenceError,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }
}

impl From<EngineError> for OrchestratorError {
    fn from(err: EngineError) -> Self {
        OrchestratorError::Engine(err.to_string())
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(key) => OrchestratorError::NotFound(format!("{} is not found", key)),
            other => OrchestratorError::Persistence(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error codes returned by the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Subdomain unknown
    NotFound,
    /// Container engine failed or unreachable
    EngineError,
    /// Bad request
    ValidationError,
    /// Registry failure
    PersistenceError,
    /// No route for the requested host
    UnknownHost,
    /// Could not reach the proxied backend
    BadGateway,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound | ErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::EngineError | ErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorCode::PersistenceError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::EngineError => "ENGINE_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::PersistenceError => "PERSISTENCE_ERROR",
            ErrorCode::UnknownHost => "UNKNOWN_HOST",
            ErrorCode::BadGateway => "BAD_GATEWAY",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Subgate-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Subgate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

impl OrchestratorError {
    /// Render as a control API error response
    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::ValidationError.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::EngineError.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ErrorCode::PersistenceError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_kinds_map_to_codes() {
        assert_eq!(OrchestratorError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(OrchestratorError::Engine("x".into()).code(), ErrorCode::EngineError);
        assert_eq!(
            OrchestratorError::Validation("x".into()).code(),
            ErrorCode::ValidationError
        );
        assert_eq!(
            OrchestratorError::Persistence("x".into()).code(),
            ErrorCode::PersistenceError
        );
    }

    #[test]
    fn test_registry_not_found_becomes_not_found() {
        let err: OrchestratorError = RegistryError::NotFound("subdomain:app1".into()).into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "subdomain:app1 is not found");

        let err: OrchestratorError = RegistryError::Storage("disk full".into()).into();
        assert_eq!(err.code(), ErrorCode::PersistenceError);
    }

    #[test]
    fn test_error_response_json() {
        let json = ErrorResponse::new(ErrorCode::NotFound, "subdomain=app1 is not found").to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"subdomain=app1 is not found\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let err = OrchestratorError::Validation("cannot parse since".into());
        let response = err.to_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Subgate-Error").unwrap(),
            "VALIDATION_ERROR"
        );
    }
}
