//! Request dispatch: route, read body, authenticate, invoke, apply

use crate::host::ScriptHost;
use bytes::Bytes;
use http::{header, HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use nautilus_core::response::responses;
use nautilus_core::{Body, Error, ResponseBuilder};
use nautilus_router::Match;
use nautilus_scripting::ScriptError;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl ScriptHost {
    /// Serve one request
    ///
    /// Never fails: routing, body, auth and script errors are turned into
    /// responses. `cancel` ends a streamed response body early.
    pub async fn handle<B>(&self, request: Request<B>, cancel: CancellationToken) -> Response<Body>
    where
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let (parts, body) = request.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();

        debug!(method = %method, path = %path, "Handling request");

        let matched = match self.inner.router.match_route(&method, &path) {
            Ok(matched) => matched,
            Err(err) => return self.routing_failure(&err, &path),
        };

        let body = match self.read_body(&parts.headers, body).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        let response = self.dispatch(matched, &parts, body, &cancel).await;

        trace!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Request handled"
        );
        response
    }

    async fn dispatch(
        &self,
        matched: Match,
        parts: &http::request::Parts,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Response<Body> {
        let route = matched.route;
        let params = matched.params.into_iter().collect();
        let (mut ctx, mut sink) =
            self.inner
                .bridge
                .prepare(parts, body, params, route.locals.clone(), None);

        if !route.auth_schemes.is_empty() {
            match self.inner.auth.authenticate(&route.auth_schemes, &ctx).await {
                Ok(identity) => ctx.identity = Some(identity),
                Err(failure) => {
                    debug!(request_id = %ctx.request_id, path = %route.path(), error = %failure, "Authentication failed");
                    return failure.into_response();
                }
            }
        }

        if !route.auth_policies.is_empty() {
            let identity = ctx.identity.clone().unwrap_or_default();
            if let Err(failure) = self.inner.auth.authorize(&route.auth_policies, &identity) {
                debug!(request_id = %ctx.request_id, path = %route.path(), error = %failure, "Authorization failed");
                return failure.into_response();
            }
        }

        let mut response = match route.handler.invoke(&ctx, &mut sink).await {
            Ok(_) => sink.apply(cancel).await,
            Err(err) => script_failure(&err, ctx.request_id, route.path()),
        };
        response.extensions_mut().insert(route.flags.clone());
        response
    }

    fn routing_failure(&self, err: &Error, path: &str) -> Response<Body> {
        let mut response = responses::from_error(err);
        if matches!(err, Error::MethodNotAllowed { .. }) {
            let allowed = self
                .inner
                .router
                .allowed_methods(path)
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = allowed.parse() {
                response.headers_mut().insert(header::ALLOW, value);
            }
        }
        debug!(path = %path, status = response.status().as_u16(), "No route served the request");
        response
    }

    async fn read_body<B>(&self, headers: &HeaderMap, body: B) -> Result<Bytes, Response<Body>>
    where
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let limit = self.inner.options.max_body_size;

        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if matches!(declared, Some(length) if length > limit) {
            debug!(limit, ?declared, "Declared body exceeds limit");
            return Err(responses::from_error(&Error::PayloadTooLarge(limit)));
        }

        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                debug!(limit, "Body exceeds limit");
                Err(responses::from_error(&Error::PayloadTooLarge(limit)))
            }
            Err(err) => {
                warn!(error = %err, "Failed to read request body");
                Err(responses::from_error(&Error::InvalidRequest(format!(
                    "failed to read body: {err}"
                ))))
            }
        }
    }
}

fn script_failure(err: &ScriptError, request_id: impl std::fmt::Display, path: &str) -> Response<Body> {
    error!(request_id = %request_id, path = %path, error = %err, "Handler failed");
    ResponseBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
        .text(err.report_text())
        .unwrap_or_else(|_| responses::fallback(StatusCode::INTERNAL_SERVER_ERROR))
}
