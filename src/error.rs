// HTTP API Error Types
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

/// Domain error taxonomy. Every layer wraps lower-layer failures with context
/// but preserves the kind; only the HTTP edge turns a kind into a status code
/// and a public message.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("Authentication failed")]
    Unauthenticated,

    #[error("Account locked")]
    Locked,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Cryptographic failure: {0}")]
    CryptoFailure(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AuthError::NotFound("row not found".to_string()),
            other => AuthError::StorageFailure(other.to_string()),
        }
    }
}

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug)]
pub enum ApiError {
    // 400 Bad Request
    BadRequest(String),
    InvalidJson(String),

    // 401 Unauthorized
    Unauthorized(String),

    // 403 Forbidden
    Forbidden(String),

    // 404 Not Found
    NotFound(String),

    // 408 Request Timeout
    RequestTimeout(String),

    // 409 Conflict
    Conflict(String),

    // 410 Gone (expired MFA session)
    Gone(String),

    // 423 Locked (account or MFA session lock)
    Locked(String),

    // 429 Too Many Requests
    TooManyRequests(String),

    // 500 Internal Server Error
    InternalServerError(String),

    // 503 Service Unavailable
    ServiceUnavailable(String),
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::InvalidJson(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::RequestTimeout(_) => 408,
            ApiError::Conflict(_) => 409,
            ApiError::Gone(_) => 410,
            ApiError::Locked(_) => 423,
            ApiError::TooManyRequests(_) => 429,
            ApiError::InternalServerError(_) => 500,
            ApiError::ServiceUnavailable(_) => 503,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::InvalidJson(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::RequestTimeout(msg)
            | ApiError::Conflict(msg)
            | ApiError::Gone(msg)
            | ApiError::Locked(msg)
            | ApiError::TooManyRequests(msg)
            | ApiError::InternalServerError(msg)
            | ApiError::ServiceUnavailable(msg) => msg,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::InvalidJson(_) => "INVALID_JSON",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::RequestTimeout(_) => "REQUEST_TIMEOUT",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Gone(_) => "SESSION_EXPIRED",
            ApiError::Locked(_) => "LOCKED",
            ApiError::TooManyRequests(_) => "TOO_MANY_REQUESTS",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        json!({
            "error": true,
            "message": self.message(),
            "code": self.error_code()
        })
    }
}

// Static constructor methods
impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn invalid_json(message: impl Into<String>) -> Self {
        ApiError::InvalidJson(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(message.into())
    }

    pub fn gone(message: impl Into<String>) -> Self {
        ApiError::Gone(message.into())
    }

    pub fn locked(message: impl Into<String>) -> Self {
        ApiError::Locked(message.into())
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        ApiError::TooManyRequests(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        ApiError::ServiceUnavailable(message.into())
    }
}

// Map domain errors onto the HTTP surface. Internal details are logged, never
// returned; authentication failures stay deliberately uniform to the client.
impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InputInvalid(msg) => ApiError::bad_request(msg),
            AuthError::Unauthenticated => ApiError::unauthorized("Invalid credentials"),
            AuthError::Locked => ApiError::locked("Account temporarily locked"),
            AuthError::Forbidden(msg) => ApiError::forbidden(msg),
            AuthError::NotFound(msg) => ApiError::not_found(msg),
            AuthError::Conflict(msg) => ApiError::conflict(msg),
            AuthError::RateLimited => ApiError::too_many_requests("Rate limit exceeded"),
            AuthError::CryptoFailure(msg) => {
                tracing::error!("Crypto failure: {}", msg);
                ApiError::internal_server_error("An internal error occurred")
            }
            AuthError::StorageFailure(msg) => {
                tracing::error!("Storage failure: {}", msg);
                ApiError::service_unavailable("Service temporarily unavailable")
            }
            AuthError::Cancelled => ApiError::RequestTimeout("Request timed out".to_string()),
            AuthError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ApiError::internal_server_error("An internal error occurred")
            }
        }
    }
}

// Standard error trait implementations
impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_expected_status_codes() {
        let cases: Vec<(AuthError, u16)> = vec![
            (AuthError::InputInvalid("x".into()), 400),
            (AuthError::Unauthenticated, 401),
            (AuthError::Forbidden("x".into()), 403),
            (AuthError::NotFound("x".into()), 404),
            (AuthError::Cancelled, 408),
            (AuthError::Conflict("x".into()), 409),
            (AuthError::Locked, 423),
            (AuthError::RateLimited, 429),
            (AuthError::CryptoFailure("x".into()), 500),
            (AuthError::StorageFailure("x".into()), 503),
        ];
        for (err, expected) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status_code(), expected);
        }
    }

    #[test]
    fn unauthenticated_message_is_uniform() {
        let api: ApiError = AuthError::Unauthenticated.into();
        assert_eq!(api.message(), "Invalid credentials");
        assert_eq!(api.error_code(), "UNAUTHORIZED");
    }
}
