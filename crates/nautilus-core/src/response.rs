//! Response body type and builder

use crate::Result;
use bytes::Bytes;
use http::{header, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Body type alias
///
/// Boxed so that in-memory and streamed bodies share one response type.
pub type Body = UnsyncBoxBody<Bytes, std::io::Error>;

/// Body holding the given bytes
pub fn full_body(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Body with no content
pub fn empty_body() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Response builder for convenient response construction
#[derive(Debug)]
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(header::HeaderName, String)>,
}

impl ResponseBuilder {
    /// Create a new response builder
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Set a header
    pub fn header(mut self, name: header::HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Build response with text body
    pub fn text(self, body: impl Into<String>) -> Result<Response<Body>> {
        let body = body.into();
        let mut response = Response::builder()
            .status(self.status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CONTENT_LENGTH, body.len());

        for (name, value) in self.headers {
            response = response.header(name, value);
        }

        Ok(response.body(full_body(body))?)
    }
}

/// Responses built from errors
pub mod responses {
    use super::*;

    /// Plain-text response for any error, using its status mapping
    pub fn from_error(err: &crate::Error) -> Response<Body> {
        let status = err.to_status_code();
        ResponseBuilder::new(status)
            .text(err.to_string())
            .unwrap_or_else(|_| fallback(status))
    }

    /// Bare response with only a status, used when building a richer one failed
    pub fn fallback(status: StatusCode) -> Response<Body> {
        let mut response = Response::new(empty_body());
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_builder() {
        let response = ResponseBuilder::new(StatusCode::OK)
            .header(header::HeaderName::from_static("x-custom"), "value")
            .text("Hello, World!")
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-custom").unwrap(), "value");
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "13");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Hello, World!");
    }

    #[test]
    fn test_from_error() {
        let err = crate::Error::Authorization("policy 'admins' not satisfied".to_string());
        let response = responses::from_error(&err);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );

        let response = responses::from_error(&crate::Error::PayloadTooLarge(16));
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_fallback_has_no_body() {
        let response = responses::fallback(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().is_empty());
    }
}
