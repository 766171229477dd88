use http::StatusCode;
use thiserror::Error;

/// Unified error type for the interceptor
#[derive(Error, Debug)]
pub enum InterceptError {
    // Tunnel errors
    #[error("Unable to hijack connection: {0}")]
    HijackUnsupported(String),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Intercept used for non-CONNECT request: {method}")]
    NotConnect { method: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Length required")]
    LengthRequired,

    #[error("Operation timed out")]
    Timeout,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for interceptor operations
pub type Result<T> = std::result::Result<T, InterceptError>;

impl InterceptError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            InterceptError::InvalidRequest(_)
            | InterceptError::InvalidAddress(_)
            | InterceptError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 411 Length Required
            InterceptError::LengthRequired => StatusCode::LENGTH_REQUIRED,

            // 502 Bad Gateway
            InterceptError::HijackUnsupported(_)
            | InterceptError::DialFailed(_)
            | InterceptError::Http(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            InterceptError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            InterceptError::NotConnect { .. }
            | InterceptError::Io(_)
            | InterceptError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for InterceptError {
    fn from(err: hyper::Error) -> Self {
        InterceptError::Http(err.to_string())
    }
}

// Convert from http builder errors
impl From<http::Error> for InterceptError {
    fn from(err: http::Error) -> Self {
        InterceptError::InvalidRequest(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for InterceptError {
    fn from(err: url::ParseError) -> Self {
        InterceptError::InvalidAddress(err.to_string())
    }
}
