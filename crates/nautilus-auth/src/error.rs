//! Authentication and authorization outcomes

use http::{header, HeaderValue, Response, StatusCode};
use nautilus_core::{response::responses, Body, Error, ResponseBuilder};
use thiserror::Error;

/// Request-time rejection produced by the auth registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No scheme accepted the caller (401)
    #[error("Authentication failed: {message}")]
    Unauthenticated {
        /// Reason
        message: String,
        /// `WWW-Authenticate` values of the schemes tried
        challenges: Vec<String>,
    },

    /// A policy refused the caller (403)
    #[error("Authorization failed: {0}")]
    Forbidden(String),

    /// A delegate script faulted (500)
    #[error("Authentication error: {0}")]
    Internal(String),
}

impl AuthFailure {
    /// Rejection without challenges
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        AuthFailure::Unauthenticated {
            message: message.into(),
            challenges: Vec::new(),
        }
    }

    /// HTTP status for the failure
    pub fn status(&self) -> StatusCode {
        match self {
            AuthFailure::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            AuthFailure::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthFailure::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text response, with challenges on 401
    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        let mut builder = ResponseBuilder::new(status);
        if let AuthFailure::Unauthenticated { challenges, .. } = &self {
            for challenge in challenges {
                if HeaderValue::from_str(challenge).is_ok() {
                    builder = builder.header(header::WWW_AUTHENTICATE, challenge.clone());
                }
            }
        }
        builder
            .text(self.to_string())
            .unwrap_or_else(|_| responses::fallback(status))
    }
}

impl From<AuthFailure> for Error {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Unauthenticated { message, .. } => Error::Authentication(message),
            AuthFailure::Forbidden(message) => Error::Authorization(message),
            AuthFailure::Internal(message) => Error::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthenticated_response_carries_challenges() {
        let failure = AuthFailure::Unauthenticated {
            message: "no credentials".to_string(),
            challenges: vec![
                "Basic realm=\"Admin\"".to_string(),
                "Bearer realm=\"api\"".to_string(),
            ],
        };
        let response = failure.into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenges: Vec<_> = response
            .headers()
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .collect();
        assert_eq!(challenges.len(), 2);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AuthFailure::Forbidden("nope".to_string()).status(),
            StatusCode::FORBIDDEN
        );
        let err: Error = AuthFailure::unauthenticated("bad").into();
        assert_eq!(err.to_status_code(), StatusCode::UNAUTHORIZED);
    }
}
