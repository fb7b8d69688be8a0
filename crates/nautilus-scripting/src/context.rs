//! Execution context bridge
//!
//! Turns an inbound request into a language-neutral [`RequestData`], pairs it
//! with the global snapshot and caller locals, and hands scripts a
//! [`ResponseSink`] that only reaches the transport through
//! [`ResponseSink::apply`].

use crate::error::{Result, ScriptError};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use nautilus_core::{empty_body, full_body, Binding, BindingTable, Body};
use nautilus_state::{GlobalSnapshot, GlobalStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Streamed response body chunks
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Language-neutral view of an inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    /// HTTP method, upper case
    pub method: String,
    /// Request path
    pub path: String,
    /// Raw request URI
    pub uri: String,
    /// Query pairs in request order
    pub query: Vec<(String, String)>,
    /// Headers with lower-cased names; repeated headers joined with ", "
    pub headers: BTreeMap<String, String>,
    /// Request cookies
    pub cookies: BTreeMap<String, String>,
    /// Route parameters
    pub params: BTreeMap<String, String>,
    /// URL-encoded form fields
    pub form: Vec<(String, String)>,
    /// Raw body
    pub body: Bytes,
    /// Peer address, when the transport recorded one
    pub remote_addr: Option<String>,
}

impl RequestData {
    /// Parse request parts and a fully read body
    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        let query = parts
            .uri
            .query()
            .map(|q| {
                form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let cookies = parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        let is_form = headers
            .get("content-type")
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        let form = if is_form {
            form_urlencoded::parse(&body)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        } else {
            Vec::new()
        };

        Self {
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            uri: parts.uri.to_string(),
            query,
            headers,
            cookies,
            params: BTreeMap::new(),
            form,
            body,
            remote_addr: parts
                .extensions
                .get::<SocketAddr>()
                .map(ToString::to_string),
        }
    }

    /// Attach route parameters
    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// First query value for a name
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Header value; lookup is case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Cookie value
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Route parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// First form value for a name
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 text (lossy)
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON
    pub fn body_json(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Request as a JSON object for script runtimes
    pub fn to_value(&self) -> Value {
        fn pairs(items: &[(String, String)]) -> Value {
            let mut map = Map::new();
            for (k, v) in items {
                map.entry(k.clone()).or_insert_with(|| Value::String(v.clone()));
            }
            Value::Object(map)
        }
        fn strings(items: &BTreeMap<String, String>) -> Value {
            Value::Object(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )
        }

        let mut value = json!({
            "method": self.method,
            "path": self.path,
            "uri": self.uri,
            "query": pairs(&self.query),
            "headers": strings(&self.headers),
            "cookies": strings(&self.cookies),
            "params": strings(&self.params),
            "form": pairs(&self.form),
            "body": self.body_text(),
            "remote": self.remote_addr,
        });
        if let (Some(json), Value::Object(map)) = (self.body_json(), &mut value) {
            map.insert("json".to_string(), json);
        }
        value
    }
}

/// A single claim held by an identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    /// Claim type, e.g. `role`
    pub kind: String,
    /// Claim value
    pub value: String,
}

impl Claim {
    /// Create a claim
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Read claims produced by a script
    ///
    /// Accepts `null`, a map of `kind -> value | [values]`, or an array of
    /// `{kind|type, value}` maps.
    pub fn list_from_value(value: &Value) -> Result<Vec<Claim>> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Object(map) => {
                let mut claims = Vec::new();
                for (kind, value) in map {
                    match value {
                        Value::Array(values) => {
                            for v in values {
                                claims.push(Claim::new(kind, scalar_text(v)?));
                            }
                        }
                        v => claims.push(Claim::new(kind, scalar_text(v)?)),
                    }
                }
                Ok(claims)
            }
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    let kind = item
                        .get("kind")
                        .or_else(|| item.get("type"))
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ScriptError::type_error(format!("claim entry has no kind: {item}"))
                        })?;
                    let value = item.get("value").unwrap_or(&Value::Null);
                    Ok(Claim::new(kind, scalar_text(value)?))
                })
                .collect(),
            other => Err(ScriptError::type_error(format!(
                "expected claims as a map or array, got {other}"
            ))),
        }
    }
}

fn scalar_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(_) | Value::Number(_) => Ok(value.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(ScriptError::type_error(format!(
            "claim value must be a scalar, got {other}"
        ))),
    }
}

/// Authenticated (or anonymous) caller
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Identity {
    /// Identity name
    pub name: Option<String>,
    /// Scheme that authenticated the caller
    pub scheme: Option<String>,
    /// Claims
    pub claims: Vec<Claim>,
    /// Whether a scheme accepted the credentials
    pub authenticated: bool,
}

impl Identity {
    /// Unauthenticated caller
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Caller accepted by a scheme
    pub fn authenticated(name: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            scheme: Some(scheme.into()),
            claims: Vec::new(),
            authenticated: true,
        }
    }

    /// Add claims
    pub fn with_claims(mut self, claims: impl IntoIterator<Item = Claim>) -> Self {
        self.claims.extend(claims);
        self
    }

    /// First value of a claim kind
    pub fn claim(&self, kind: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|c| c.kind.eq_ignore_ascii_case(kind))
            .map(|c| c.value.as_str())
    }

    /// Whether the identity holds a claim; `None` or `"*"` match any value
    pub fn has_claim(&self, kind: &str, value: Option<&str>) -> bool {
        self.claims.iter().any(|c| {
            c.kind.eq_ignore_ascii_case(kind)
                && match value {
                    None | Some("*") => true,
                    Some(expected) => c.value == expected,
                }
        })
    }

    /// Identity as a JSON object for script runtimes
    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "scheme": self.scheme,
            "authenticated": self.authenticated,
            "claims": self.claims,
        })
    }
}

/// Everything one handler invocation can see
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Parsed request
    pub request: Arc<RequestData>,
    /// Global store snapshot taken when the context was prepared
    pub globals: GlobalSnapshot,
    /// Caller-supplied locals
    pub locals: BindingTable,
    /// Caller identity
    pub identity: Option<Identity>,
    /// Correlation id
    pub request_id: Uuid,
}

impl ExecutionContext {
    /// Context with no globals, locals or identity
    pub fn new(request: RequestData) -> Self {
        Self {
            request: Arc::new(request),
            globals: GlobalSnapshot::default(),
            locals: BindingTable::new(),
            identity: None,
            request_id: Uuid::new_v4(),
        }
    }

    /// Replace locals
    pub fn with_locals(mut self, locals: BindingTable) -> Self {
        self.locals = locals;
        self
    }

    /// Set the identity
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Add one local
    pub fn with_local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(Binding::new(name, value));
        self
    }

    /// Globals merged with locals; locals win on collision
    pub fn bindings(&self) -> BindingTable {
        self.globals.to_bindings().merged(&self.locals)
    }
}

/// Builds execution contexts from inbound requests
#[derive(Debug, Clone)]
pub struct ContextBridge {
    globals: GlobalStore,
}

impl ContextBridge {
    /// Create a bridge over the shared store
    pub fn new(globals: GlobalStore) -> Self {
        Self { globals }
    }

    /// Parse the request and build a fresh context and sink
    pub fn prepare(
        &self,
        parts: &Parts,
        body: Bytes,
        params: Vec<(String, String)>,
        locals: BindingTable,
        identity: Option<Identity>,
    ) -> (ExecutionContext, ResponseSink) {
        let request = RequestData::from_parts(parts, body).with_params(params);
        self.prepare_with(Arc::new(request), locals, identity)
    }

    /// Build a context around an already parsed request
    pub fn prepare_with(
        &self,
        request: Arc<RequestData>,
        locals: BindingTable,
        identity: Option<Identity>,
    ) -> (ExecutionContext, ResponseSink) {
        let context = ExecutionContext {
            request,
            globals: self.globals.snapshot(),
            locals,
            identity,
            request_id: Uuid::new_v4(),
        };
        debug!(
            request_id = %context.request_id,
            method = %context.request.method,
            path = %context.request.path,
            "Execution context prepared"
        );
        (context, ResponseSink::new())
    }
}

/// Response cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Name
    pub name: String,
    /// Value
    pub value: String,
    /// Path attribute
    pub path: Option<String>,
    /// Max-Age attribute in seconds
    pub max_age: Option<i64>,
    /// HttpOnly attribute
    pub http_only: bool,
    /// Secure attribute
    pub secure: bool,
    /// SameSite attribute
    pub same_site: Option<String>,
}

impl Cookie {
    /// Session cookie scoped to `/`
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: Some("/".to_string()),
            max_age: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    /// Set Max-Age
    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Set HttpOnly
    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// Set Secure
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// `Set-Cookie` header value
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if let Some(same_site) = &self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site);
        }
        out
    }
}

/// Redirect target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Location
    pub location: String,
    /// 301 instead of 302
    pub permanent: bool,
}

impl Redirect {
    fn status(&self) -> StatusCode {
        if self.permanent {
            StatusCode::MOVED_PERMANENTLY
        } else {
            StatusCode::FOUND
        }
    }
}

/// Body accumulated by a handler
pub enum ResponseBody {
    /// No body
    Empty,
    /// Raw bytes
    Bytes(Bytes),
    /// UTF-8 text
    Text(String),
    /// File opened when the response is applied
    File(PathBuf),
    /// Stream with an optional known length
    Stream {
        /// Chunks
        stream: BodyStream,
        /// Total length if known up front
        length: Option<u64>,
    },
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Text(t) => write!(f, "Text({} chars)", t.len()),
            Self::File(path) => write!(f, "File({})", path.display()),
            Self::Stream { length, .. } => write!(f, "Stream(length: {length:?})"),
        }
    }
}

/// Response accumulated by a handler; nothing is sent until [`apply`](Self::apply)
#[derive(Debug)]
pub struct ResponseSink {
    status: u16,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    cookies: Vec<Cookie>,
    body: ResponseBody,
    redirect: Option<Redirect>,
}

impl Default for ResponseSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSink {
    /// Empty 200 response
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            content_type: None,
            cookies: Vec::new(),
            body: ResponseBody::Empty,
            redirect: None,
        }
    }

    /// Current status
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Set the status; validated when applied
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Replace every header with this name; `Content-Type` sets the content type
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if name.eq_ignore_ascii_case("content-type") {
            self.content_type = Some(value.into());
            return;
        }
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    /// Add a header value, keeping existing ones
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove every header with this name
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Set the content type
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// Current content type
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Add a cookie
    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    /// Cookies set so far
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Append text to the body
    pub fn write(&mut self, text: &str) {
        self.body = match std::mem::replace(&mut self.body, ResponseBody::Empty) {
            ResponseBody::Empty => ResponseBody::Text(text.to_string()),
            ResponseBody::Text(mut existing) => {
                existing.push_str(text);
                ResponseBody::Text(existing)
            }
            ResponseBody::Bytes(existing) => {
                let mut buf = BytesMut::from(&existing[..]);
                buf.extend_from_slice(text.as_bytes());
                ResponseBody::Bytes(buf.freeze())
            }
            other => {
                warn!(body = ?other, "Text written after a streamed body was set; replacing it");
                ResponseBody::Text(text.to_string())
            }
        };
    }

    /// Replace the body with text
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.body = ResponseBody::Text(text.into());
    }

    /// Replace the body with bytes
    pub fn set_bytes(&mut self, bytes: impl Into<Bytes>) {
        self.body = ResponseBody::Bytes(bytes.into());
    }

    /// Replace the body with serialized JSON and set the content type
    pub fn set_json(&mut self, value: &Value) -> Result<()> {
        self.body = ResponseBody::Text(serde_json::to_string(value)?);
        self.content_type = Some("application/json".to_string());
        Ok(())
    }

    /// Serve a file when the response is applied
    pub fn set_file(&mut self, path: impl Into<PathBuf>) {
        self.body = ResponseBody::File(path.into());
    }

    /// Replace the body with a stream
    pub fn set_stream(&mut self, stream: BodyStream, length: Option<u64>) {
        self.body = ResponseBody::Stream { stream, length };
    }

    /// Current body
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Whether a body has been set
    pub fn has_body(&self) -> bool {
        !matches!(self.body, ResponseBody::Empty)
    }

    /// Redirect instead of sending a body
    pub fn redirect(&mut self, location: impl Into<String>, permanent: bool) {
        self.redirect = Some(Redirect {
            location: location.into(),
            permanent,
        });
    }

    /// Redirect target, if any
    pub fn redirect_target(&self) -> Option<&Redirect> {
        self.redirect.as_ref()
    }

    /// Materialize the accumulated response
    ///
    /// A redirect skips the body entirely. Streamed bodies stop quietly once
    /// `cancel` fires.
    pub async fn apply(self, cancel: &CancellationToken) -> Response<Body> {
        let ResponseSink {
            status,
            headers,
            content_type,
            cookies,
            body,
            redirect,
        } = self;

        let mut response = Response::new(empty_body());
        let mut map = HeaderMap::new();
        for (name, value) in &headers {
            append_header(&mut map, name, value);
        }
        for cookie in &cookies {
            append_header(&mut map, header::SET_COOKIE.as_str(), &cookie.to_header_value());
        }

        if let Some(redirect) = redirect {
            map.remove(header::CONTENT_LENGTH);
            map.remove(header::CONTENT_TYPE);
            match HeaderValue::from_str(&redirect.location) {
                Ok(location) => {
                    map.insert(header::LOCATION, location);
                    *response.status_mut() = redirect.status();
                }
                Err(_) => {
                    error!(location = %redirect.location, "Invalid redirect target");
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                }
            }
            *response.headers_mut() = map;
            return response;
        }

        let status = StatusCode::from_u16(status).unwrap_or_else(|_| {
            warn!(status, "Invalid status code set by handler");
            StatusCode::INTERNAL_SERVER_ERROR
        });
        *response.status_mut() = status;

        let content_type = match (&content_type, &body) {
            (Some(ct), _) => Some(ct.clone()),
            (None, ResponseBody::Text(_)) => Some("text/plain".to_string()),
            (None, ResponseBody::File(path)) => Some(guess_content_type(path).to_string()),
            _ => None,
        };
        if let Some(ct) = content_type {
            append_header(&mut map, header::CONTENT_TYPE.as_str(), &with_charset(&ct));
        }

        map.remove(header::CONTENT_LENGTH);
        let (body, length) = match body {
            ResponseBody::Empty => (empty_body(), Some(0)),
            ResponseBody::Bytes(bytes) => {
                let len = bytes.len() as u64;
                (full_body(bytes), Some(len))
            }
            ResponseBody::Text(text) => {
                let len = text.len() as u64;
                (full_body(text), Some(len))
            }
            ResponseBody::File(path) => match open_file(&path).await {
                Ok((stream, len)) => (stream_body(stream, cancel.clone()), Some(len)),
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Failed to open response file");
                    let message = format!("Failed to open file: {}", path.display());
                    let mut failed = Response::new(full_body(message.clone()));
                    *failed.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    failed.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; charset=utf-8"),
                    );
                    failed
                        .headers_mut()
                        .insert(header::CONTENT_LENGTH, HeaderValue::from(message.len()));
                    return failed;
                }
            },
            ResponseBody::Stream { stream, length } => (stream_body(stream, cancel.clone()), length),
        };

        let bodiless = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        if let (Some(len), false) = (length, bodiless) {
            map.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }

        *response.headers_mut() = map;
        *response.body_mut() = body;
        response
    }
}

fn append_header(map: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            map.append(name, value);
        }
        _ => warn!(header = %name, "Dropping invalid response header"),
    }
}

/// Whether a media type carries text and should declare a charset
pub fn is_text_like(content_type: &str) -> bool {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media.starts_with("text/")
        || media.ends_with("+json")
        || media.ends_with("+xml")
        || matches!(
            media.as_str(),
            "application/json" | "application/xml" | "application/javascript"
        )
}

/// Append `; charset=utf-8` to text-like types that lack a charset
pub fn with_charset(content_type: &str) -> String {
    if is_text_like(content_type) && !content_type.to_ascii_lowercase().contains("charset=") {
        format!("{content_type}; charset=utf-8")
    } else {
        content_type.to_string()
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

async fn open_file(path: &Path) -> std::io::Result<(BodyStream, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((ReaderStream::new(file).boxed(), len))
}

fn stream_body(stream: BodyStream, cancel: CancellationToken) -> Body {
    let aborted = async move {
        cancel.cancelled().await;
        debug!("Client aborted; response stream stopped");
    };
    let frames = stream.take_until(aborted).map_ok(http_body::Frame::data);
    StreamBody::new(frames).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http::Request;
    use serde_json::json;

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn test_request_data_parsing() {
        let req = Request::builder()
            .method("POST")
            .uri("/users/42?sort=asc&tag=a&tag=b")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("X-Trace", "one")
            .header("x-trace", "two")
            .header("Cookie", "session=abc; theme=dark")
            .body(())
            .unwrap();

        let data = RequestData::from_parts(&parts(req), Bytes::from("name=Ann+Lee&age=30"))
            .with_params([("id", "42")]);

        assert_eq!(data.method, "POST");
        assert_eq!(data.path, "/users/42");
        assert_eq!(data.query("tag"), Some("a"));
        assert_eq!(data.header("X-TRACE"), Some("one, two"));
        assert_eq!(data.cookie("theme"), Some("dark"));
        assert_eq!(data.param("id"), Some("42"));
        assert_eq!(data.form_value("name"), Some("Ann Lee"));

        let value = data.to_value();
        assert_eq!(value["query"]["sort"], json!("asc"));
        assert_eq!(value["params"]["id"], json!("42"));
        assert!(value.get("json").is_none());
    }

    #[test]
    fn test_bridge_merges_locals_over_globals() {
        let store = GlobalStore::new();
        store.define("region", json!("eu"), false).unwrap();
        store.define("limit", json!(10), false).unwrap();

        let bridge = ContextBridge::new(store.clone());
        let req = parts(Request::get("/").body(()).unwrap());
        let locals = BindingTable::from_values([("limit", json!(99))]);
        let (ctx, sink) = bridge.prepare(&req, Bytes::new(), Vec::new(), locals, None);

        store.update_value("region", json!("us")).unwrap();

        let bindings = ctx.bindings();
        assert_eq!(bindings.get("region").unwrap().value, json!("eu"));
        assert_eq!(bindings.get("limit").unwrap().value, json!(99));
        assert_eq!(sink.status(), 200);
        assert!(!sink.has_body());
    }

    #[test]
    fn test_claims_from_value() {
        let claims = Claim::list_from_value(&json!({"role": ["admin", "ops"], "level": 3})).unwrap();
        assert_eq!(claims.len(), 3);
        assert!(claims.contains(&Claim::new("level", "3")));

        let claims = Claim::list_from_value(&json!([{"type": "role", "value": "reader"}])).unwrap();
        assert_eq!(claims, vec![Claim::new("role", "reader")]);

        assert!(Claim::list_from_value(&json!("role")).is_err());
    }

    #[test]
    fn test_identity_claim_matching() {
        let identity = Identity::authenticated("ann", "Basic")
            .with_claims([Claim::new("Role", "admin")]);
        assert!(identity.has_claim("role", Some("admin")));
        assert!(identity.has_claim("role", Some("*")));
        assert!(identity.has_claim("role", None));
        assert!(!identity.has_claim("role", Some("ops")));
        assert_eq!(identity.claim("ROLE"), Some("admin"));
    }

    #[test]
    fn test_charset_inference() {
        assert_eq!(with_charset("text/html"), "text/html; charset=utf-8");
        assert_eq!(with_charset("application/problem+json"), "application/problem+json; charset=utf-8");
        assert_eq!(with_charset("text/plain; charset=latin1"), "text/plain; charset=latin1");
        assert_eq!(with_charset("image/png"), "image/png");
    }

    #[tokio::test]
    async fn test_apply_text_body() {
        let mut sink = ResponseSink::new();
        sink.set_status(201);
        sink.set_header("X-Id", "7");
        sink.set_header("content-type", "application/json");
        sink.write("{\"ok\":");
        sink.write("true}");
        sink.add_cookie(Cookie::new("seen", "1").http_only());

        let response = sink.apply(&CancellationToken::new()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-id"], "7");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
        assert_eq!(response.headers()[header::SET_COOKIE], "seen=1; Path=/; HttpOnly");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_apply_redirect_skips_body() {
        let mut sink = ResponseSink::new();
        sink.set_text("ignored");
        sink.redirect("/login", false);

        let response = sink.apply(&CancellationToken::new()).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/login");
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_apply_no_content_has_no_length() {
        let mut sink = ResponseSink::new();
        sink.set_status(204);
        let response = sink.apply(&CancellationToken::new()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn test_unknown_length_stream_omits_content_length() {
        let mut sink = ResponseSink::new();
        sink.set_header("Content-Length", "999");
        let chunks = stream::iter(vec![Ok(Bytes::from("a")), Ok(Bytes::from("bc"))]);
        sink.set_stream(chunks.boxed(), None);

        let response = sink.apply(&CancellationToken::new()).await;
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"abc");
    }

    #[tokio::test]
    async fn test_known_length_stream_sets_content_length() {
        let mut sink = ResponseSink::new();
        let chunks = stream::iter(vec![Ok(Bytes::from("hello"))]);
        sink.set_stream(chunks.boxed(), Some(5));

        let response = sink.apply(&CancellationToken::new()).await;
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
    }

    #[tokio::test]
    async fn test_cancelled_stream_ends_quietly() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut sink = ResponseSink::new();
        let chunks = stream::iter(vec![Ok(Bytes::from("never sent"))]);
        sink.set_stream(chunks.boxed(), None);

        let response = sink.apply(&cancel).await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_abort_mid_stream_is_logged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let cancel = CancellationToken::new();
        let mut sink = ResponseSink::new();
        let chunks = stream::iter(vec![Ok(Bytes::from("partial"))]).chain(stream::pending());
        sink.set_stream(chunks.boxed(), None);

        let mut body = sink.apply(&cancel).await.into_body();
        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&first[..], b"partial");

        cancel.cancel();
        assert!(body.frame().await.is_none());

        let logged = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(logged.contains("response stream stopped"), "{logged}");
    }

    #[tokio::test]
    async fn test_file_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        tokio::fs::write(&path, "<p>hi</p>").await.unwrap();

        let mut sink = ResponseSink::new();
        sink.set_file(&path);
        let response = sink.apply(&CancellationToken::new()).await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "9");

        let mut sink = ResponseSink::new();
        sink.set_file(dir.path().join("missing.txt"));
        let response = sink.apply(&CancellationToken::new()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
