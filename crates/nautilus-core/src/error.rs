//! Error types for Nautilus

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for registration and request handling
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid HTTP request
    #[error("Invalid HTTP request: {0}")]
    InvalidRequest(String),

    /// Route not found
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    /// Path exists but not for this method
    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed {
        /// Requested method
        method: String,
        /// Requested path
        path: String,
    },

    /// Request body exceeded the configured limit
    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// Registration input failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A route is already registered for this pattern and method
    #[error("Route already registered: {method} {pattern}")]
    DuplicateRoute {
        /// Route pattern
        pattern: String,
        /// HTTP method
        method: String,
    },

    /// An authentication scheme is already registered
    #[error("Authentication scheme already registered: {0}")]
    DuplicateScheme(String),

    /// A route references a scheme the host does not know
    #[error("Authentication scheme not registered: {0}")]
    UnknownScheme(String),

    /// A route references a policy the host does not know
    #[error("Authorization policy not registered: {0}")]
    UnknownPolicy(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authorization error
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert error to HTTP status code
    pub fn to_status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Authentication(_) => StatusCode::UNAUTHORIZED,
            Error::Authorization(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is raised while registering rather than serving
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::DuplicateRoute { .. }
                | Error::DuplicateScheme(_)
                | Error::UnknownScheme(_)
                | Error::UnknownPolicy(_)
        )
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::RouteNotFound("/test".to_string()).to_status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Authentication("invalid token".to_string()).to_status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::MethodNotAllowed {
                method: "POST".to_string(),
                path: "/hello".to_string(),
            }
            .to_status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            Error::PayloadTooLarge(10).to_status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_registration_errors() {
        let err = Error::DuplicateRoute {
            pattern: "/hello".to_string(),
            method: "GET".to_string(),
        };
        assert!(err.is_registration_error());
        assert!(err.to_string().contains("GET /hello"));
        assert!(Error::UnknownScheme("Admin".to_string()).is_registration_error());
        assert!(!Error::Internal("boom".to_string()).is_registration_error());
    }
}
