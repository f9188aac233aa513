//! Controller errors and their JSON representation for the admin API

use crate::provider::{ProviderError, ReadinessState, ResourceId};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors returned by the pool controller
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A provider call on the request path failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A resource or the network policy could not be provisioned after retries
    #[error("provisioning failed after {attempts} attempts: {source}")]
    Provisioning {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    /// No candidate in the pool when one was required
    #[error("resource pool is empty")]
    PoolEmpty,

    /// Rotation requested while nothing is active
    #[error("no active resource to rotate")]
    NoActiveResource,

    /// Candidate never reported ready within the polling bound
    #[error("resource {id} not ready after {attempts} readiness polls")]
    ProvisioningTimeout { id: ResourceId, attempts: u32 },

    /// Candidate reached a state it cannot recover from
    #[error("resource {id} became {state} while waiting for readiness")]
    ReadinessFailed { id: ResourceId, state: ReadinessState },

    /// A wait was cut short by `interrupt()` or teardown
    #[error("operation interrupted")]
    Interrupted,
}

impl Error {
    /// Error code used on the admin API
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Provider(_) => ErrorCode::ProviderError,
            Error::Provisioning { .. } | Error::ReadinessFailed { .. } => ErrorCode::ProvisioningFailed,
            Error::PoolEmpty => ErrorCode::PoolEmpty,
            Error::NoActiveResource => ErrorCode::NoActiveResource,
            Error::ProvisioningTimeout { .. } => ErrorCode::ProvisioningTimeout,
            Error::Interrupted => ErrorCode::Interrupted,
        }
    }
}

/// Error codes for admin API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown route
    NotFound,
    /// Provider call failed
    ProviderError,
    /// Resource or policy could not be provisioned
    ProvisioningFailed,
    /// Readiness polling exhausted
    ProvisioningTimeout,
    /// No standby resource available
    PoolEmpty,
    /// Rotation requested before activation
    NoActiveResource,
    /// Interrupted by teardown
    Interrupted,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ProviderError => StatusCode::BAD_GATEWAY,
            ErrorCode::ProvisioningFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::ProvisioningTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::PoolEmpty => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::NoActiveResource => StatusCode::CONFLICT,
            ErrorCode::Interrupted => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code as a string for the X-Egress-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
            ErrorCode::ProvisioningFailed => "PROVISIONING_FAILED",
            ErrorCode::ProvisioningTimeout => "PROVISIONING_TIMEOUT",
            ErrorCode::PoolEmpty => "POOL_EMPTY",
            ErrorCode::NoActiveResource => "NO_ACTIVE_RESOURCE",
            ErrorCode::Interrupted => "INTERRUPTED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
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

    /// Convert to JSON string
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

/// Create a JSON error response with X-Egress-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Egress-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
