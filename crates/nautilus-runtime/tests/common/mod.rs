//! Shared helpers for host integration tests

#![allow(dead_code)]

use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Full};
use nautilus_core::Body;
use nautilus_runtime::ScriptHost;
use tokio_util::sync::CancellationToken;

pub fn request(method: Method, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub async fn send(host: &ScriptHost, request: Request<Full<Bytes>>) -> Response<Body> {
    host.handle(request, CancellationToken::new()).await
}

pub async fn get(host: &ScriptHost, path: &str) -> Response<Body> {
    send(host, request(Method::GET, path)).await
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
