//! Per-request context.
//!
//! A [`Context`] carries everything one request needs: the request head and
//! body, the response writer, route [`Params`], the handler chain with its
//! cursor, request-scoped values, a [`Logger`] and the error list. Contexts
//! are pooled (see [`ContextPool`]); every field is reset on release.
//!
//! # Pipeline
//!
//! ```text
//! chain = [m1, m2, h]
//!
//! ctx.next()  → m1 pre
//!                 ctx.next() → m2 pre
//!                                ctx.next() → h
//!                 m2 post  ←─────────────────┘
//! m1 post
//! ```
//!
//! A handler that returns without calling [`next`](Context::next) ends the
//! chain; [`end`](Context::end) and [`fatal`](Context::fatal) end it
//! explicitly.

mod bind;
mod cookie;
mod pool;
mod render;
pub mod writer;

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Limited};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::error::{BoxError, Error, ErrorBody, Result};
use crate::handler::HandlerChain;
use crate::logger::Logger;
use crate::params::Params;

pub use bind::{FormData, FormFile};
pub use cookie::Cookie;
pub use pool::ContextPool;
pub use render::TemplateRenderer;
pub use writer::{
    BaseWriter, Capabilities, DiscardWriter, ReadyFuture, ResponseBody, ResponseWriter, STREAM_CHUNKS, full_body,
    is_wrapped_by,
};

/// Request body as handed to the Context.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Shared values injected by the bootstrap for every request.
pub type Values = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Header carrying the request id.
pub const HEADER_REQUEST_ID: &str = "x-request-id";

const END: usize = usize::MAX;

enum BodyState {
    Empty,
    Pending(RequestBody),
    Buffered(Bytes),
    TooLarge(usize),
}

/// Everything the dispatcher hands to [`Context::reset`].
pub(crate) struct RequestInit {
    pub parts: http::request::Parts,
    pub body: RequestBody,
    pub remote: Option<SocketAddr>,
    pub tls: bool,
    pub writer: Box<dyn ResponseWriter>,
    pub globals: Arc<Values>,
    pub body_limit: usize,
}

pub struct Context {
    parts: http::request::Parts,
    body: BodyState,
    body_limit: usize,
    remote: Option<SocketAddr>,
    tls: bool,
    writer: Box<dyn ResponseWriter>,
    caps: Capabilities,
    params: Params,
    handlers: HandlerChain,
    index: usize,
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
    globals: Arc<Values>,
    logger: Logger,
    errors: Vec<Error>,
    cancel: CancellationToken,
    form: Option<FormData>,
    detached: bool,
}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            parts: http::Request::new(()).into_parts().0,
            body: BodyState::Empty,
            body_limit: usize::MAX,
            remote: None,
            tls: false,
            writer: Box::new(DiscardWriter::default()),
            caps: Capabilities::default(),
            params: Params::default(),
            handlers: Arc::from(Vec::new()),
            index: 0,
            values: HashMap::new(),
            globals: Arc::new(HashMap::new()),
            logger: Logger::root(),
            errors: Vec::new(),
            cancel: CancellationToken::new(),
            form: None,
            detached: false,
        }
    }

    pub(crate) fn reset(&mut self, init: RequestInit) {
        self.parts = init.parts;
        self.body = BodyState::Pending(init.body);
        self.body_limit = init.body_limit;
        self.remote = init.remote;
        self.tls = init.tls;
        self.caps = init.writer.capabilities();
        self.writer = init.writer;
        self.globals = init.globals;
        self.cancel = CancellationToken::new();
        self.index = 0;
    }

    /// Returns the Context to its pooled state.
    pub(crate) fn clear(&mut self) {
        self.cancel.cancel();
        self.body = BodyState::Empty;
        self.writer = Box::new(DiscardWriter::default());
        self.caps = Capabilities::default();
        self.params.reset();
        self.handlers = Arc::from(Vec::new());
        self.index = 0;
        self.values.clear();
        self.logger.reset();
        self.errors.clear();
        self.form = None;
        self.parts.headers.clear();
        self.parts.extensions.clear();
    }

    // ── Request accessors ────────────────────────────────────────────────────

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    /// `Host` header, falling back to the URI authority.
    pub fn host(&self) -> &str {
        self.header(HOST.as_str()).or_else(|| self.parts.uri.host()).unwrap_or_default()
    }

    pub fn query_string(&self) -> &str {
        self.parts.uri.query().unwrap_or_default()
    }

    /// Decoded query pairs in order.
    pub fn querys(&self) -> Vec<(String, String)> {
        serde_urlencoded::from_str(self.query_string()).unwrap_or_default()
    }

    /// Last decoded value of query key `key`.
    pub fn query(&self, key: &str) -> Option<String> {
        self.querys().into_iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Media type of the request without parameters, lowercased.
    pub fn content_type(&self) -> String {
        self.header(CONTENT_TYPE.as_str())
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Client address: `X-Real-IP`, else the first `X-Forwarded-For` hop,
    /// else the peer address without port.
    pub fn real_ip(&self) -> String {
        if let Some(ip) = self.header("x-real-ip").map(str::trim).filter(|s| !s.is_empty()) {
            return ip.to_owned();
        }
        if let Some(first) = self
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return first.to_owned();
        }
        self.remote.map(|a| a.ip().to_string()).unwrap_or_default()
    }

    /// Request id from the response (set by middleware) or the request.
    pub fn request_id(&self) -> Option<&str> {
        self.writer
            .headers()
            .get(HEADER_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.header(HEADER_REQUEST_ID))
    }

    /// Caps the bytes [`body`](Self::body) will read.
    pub fn set_body_limit(&mut self, limit: usize) {
        self.body_limit = limit;
    }

    /// Reads the whole body once and caches it; later calls return the same
    /// bytes. Exceeding the body limit fails this and every later call.
    pub async fn body(&mut self) -> Result<Bytes> {
        match std::mem::replace(&mut self.body, BodyState::Empty) {
            BodyState::Buffered(bytes) => {
                self.body = BodyState::Buffered(bytes.clone());
                Ok(bytes)
            }
            BodyState::Empty => {
                self.body = BodyState::Buffered(Bytes::new());
                Ok(Bytes::new())
            }
            BodyState::TooLarge(limit) => {
                self.body = BodyState::TooLarge(limit);
                Err(Error::BodyTooLarge(limit))
            }
            BodyState::Pending(body) => {
                let limit = self.body_limit;
                let collect: std::pin::Pin<
                    Box<dyn Future<Output = std::result::Result<http_body_util::Collected<Bytes>, BoxError>> + Send>,
                > = Box::pin(Limited::new(body, limit).collect());
                match collect.await {
                    Ok(collected) => {
                        let bytes = collected.to_bytes();
                        self.body = BodyState::Buffered(bytes.clone());
                        Ok(bytes)
                    }
                    Err(e) if e.is::<http_body_util::LengthLimitError>() => {
                        self.body = BodyState::TooLarge(limit);
                        Err(Error::BodyTooLarge(limit))
                    }
                    Err(e) => {
                        self.body = BodyState::Buffered(Bytes::new());
                        Err(Error::from(e))
                    }
                }
            }
        }
    }

    /// Rebuilds an `http::Request` around `body`.
    pub fn to_http_request(&self, body: Bytes) -> http::Request<Bytes> {
        let mut req = http::Request::new(body);
        *req.method_mut() = self.parts.method.clone();
        *req.uri_mut() = self.parts.uri.clone();
        *req.version_mut() = self.parts.version;
        *req.headers_mut() = self.parts.headers.clone();
        req
    }

    // ── Params ───────────────────────────────────────────────────────────────

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.set(key, value);
    }

    // ── Response ─────────────────────────────────────────────────────────────

    pub fn response(&self) -> &dyn ResponseWriter {
        &*self.writer
    }

    pub fn response_mut(&mut self) -> &mut dyn ResponseWriter {
        &mut *self.writer
    }

    /// Replaces the writer with `wrap(current)`.
    pub fn set_response<F>(&mut self, wrap: F)
    where
        F: FnOnce(Box<dyn ResponseWriter>) -> Box<dyn ResponseWriter>,
    {
        let current = std::mem::replace(&mut self.writer, Box::new(DiscardWriter::default()));
        self.writer = wrap(current);
        self.caps = self.writer.capabilities();
    }

    /// Capabilities cached when the writer was installed.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub(crate) fn take_response(&mut self) -> Box<dyn ResponseWriter> {
        std::mem::replace(&mut self.writer, Box::new(DiscardWriter::default()))
    }

    pub fn write_header(&mut self, status: StatusCode) {
        self.writer.write_header(status);
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.writer.write(data)
    }

    /// Writes `data`, recording a failed write as an error.
    pub fn write_bytes(&mut self, data: &[u8]) {
        if let Err(e) = self.writer.write(data) {
            self.logger.warning(format_args!("response write failed: {e}"));
            self.errors.push(e);
        }
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    /// Like [`write_string`](Self::write_string), defaulting the content type
    /// to `text/plain`.
    pub fn write_text(&mut self, s: &str) {
        self.default_content_type("text/plain; charset=utf-8");
        self.write_bytes(s.as_bytes());
    }

    pub(crate) fn default_content_type(&mut self, value: &'static str) {
        let headers = self.writer.headers_mut();
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(value));
        }
    }

    /// Sets a response header; invalid names or values are logged and dropped.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.writer.headers_mut().insert(name, value);
            }
            _ => self.logger.warning(format_args!("invalid response header `{name}`")),
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.writer.headers_mut().append(name, value);
            }
            _ => self.logger.warning(format_args!("invalid response header `{name}`")),
        }
    }

    pub fn set_cookie(&mut self, cookie: &Cookie) {
        self.add_header(SET_COOKIE.as_str(), &cookie.to_string());
    }

    /// Sets a cookie on `/`. `max_age` of 0 means a session cookie, negative
    /// deletes it.
    pub fn set_cookie_value(&mut self, name: &str, value: &str, max_age: i64) {
        let mut cookie = Cookie::new(name, value);
        cookie.path = Some("/".into());
        if max_age != 0 {
            cookie.max_age = Some(max_age);
        }
        self.set_cookie(&cookie);
    }

    /// Request cookies in header order.
    pub fn cookies(&self) -> Vec<Cookie> {
        self.parts
            .headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(cookie::parse_cookie_header)
            .collect()
    }

    pub fn get_cookie(&self, name: &str) -> Option<String> {
        self.cookies().into_iter().find(|c| c.name == name).map(|c| c.value)
    }

    pub fn redirect(&mut self, status: StatusCode, url: &str) {
        self.set_header(LOCATION.as_str(), url);
        self.write_header(status);
    }

    /// Streams a file from disk with a content type guessed from its
    /// extension. A missing file is a 404.
    pub async fn write_file(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(data) => {
                if !self.writer.headers().contains_key(CONTENT_TYPE) {
                    self.set_header(CONTENT_TYPE.as_str(), guess_mime(path));
                }
                self.write_bytes(&data);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.write_error(&Error::NotFound),
            Err(e) => self.fatal(e),
        }
    }

    /// HTTP/2 push; a no-op when the writer chain lacks the capability.
    pub fn push(&mut self, target: &str) {
        if !self.caps.push {
            return;
        }
        if let Err(e) = self.writer.push(target) {
            self.logger.warning(format_args!("push {target}: {e}"));
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }

    /// Waits for the client to take what a streaming response has buffered.
    /// Producers writing after a flush await this between chunks.
    pub async fn drain(&mut self) -> Result<()> {
        self.writer.ready().await
    }

    /// Renders `err` as an [`ErrorBody`] unless a status was already written.
    pub fn write_error(&mut self, err: &Error) {
        if self.writer.wrote_header() {
            return;
        }
        let body = ErrorBody::from_error(err, self.request_id().map(str::to_owned));
        match serde_json::to_vec(&body) {
            Ok(json) => {
                self.set_header(CONTENT_TYPE.as_str(), "application/json");
                self.write_header(err.status());
                self.write_bytes(&json);
            }
            Err(e) => {
                self.write_header(err.status());
                self.logger.error(format_args!("encode error body: {e}"));
            }
        }
    }

    /// Takes the upgrade future for this request and detaches the Context
    /// from the pool. The caller writes the `101` response itself.
    pub fn hijack(&mut self) -> Result<hyper::upgrade::OnUpgrade> {
        if !self.caps.hijack {
            return Err(Error::handler("response writer does not support hijack"));
        }
        let upgrade = self
            .parts
            .extensions
            .remove::<hyper::upgrade::OnUpgrade>()
            .ok_or_else(|| Error::handler("connection is not upgradable"))?;
        self.detached = true;
        Ok(upgrade)
    }

    /// Keeps this Context out of the pool after the request.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    // ── Pipeline control ─────────────────────────────────────────────────────

    /// Runs the next handler in the chain and returns when it completes.
    pub async fn next(&mut self) {
        if self.index < self.handlers.len() {
            let handler = Arc::clone(&self.handlers[self.index]);
            self.index += 1;
            handler(self).await;
        }
    }

    /// Stops the chain: no further handler runs.
    pub fn end(&mut self) {
        self.index = END;
    }

    pub fn is_ended(&self) -> bool {
        self.index == END
    }

    pub fn handlers(&self) -> &HandlerChain {
        &self.handlers
    }

    /// Installs a new chain and rewinds the cursor.
    pub fn set_handlers(&mut self, handlers: HandlerChain) {
        self.handlers = handlers;
        self.index = 0;
    }

    /// Records an error without ending the chain.
    pub fn push_error(&mut self, err: impl Into<Error>) {
        self.errors.push(err.into());
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Logs `err`, renders it if nothing was written yet, records it and ends
    /// the chain.
    pub fn fatal(&mut self, err: impl Into<Error>) {
        let err = err.into();
        self.logger.error(&err);
        self.write_error(&err);
        self.errors.push(err);
        self.end();
    }

    // ── Values ───────────────────────────────────────────────────────────────

    /// Request-scoped value, falling back to the bootstrap's shared values.
    pub fn value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .get(key)
            .or_else(|| self.globals.get(key))
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    pub fn set_value<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    pub fn set_value_arc(&mut self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.values.insert(key.into(), value);
    }

    /// Cancelled when the request completes, the client goes away or a
    /// timeout fires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn replace_cancellation(&mut self, token: CancellationToken) -> CancellationToken {
        std::mem::replace(&mut self.cancel, token)
    }

    // ── Logger ───────────────────────────────────────────────────────────────

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn logger_mut(&mut self) -> &mut Logger {
        &mut self.logger
    }

    pub fn debug(&self, msg: impl std::fmt::Display) {
        self.logger.log(Level::DEBUG, msg);
    }

    pub fn info(&self, msg: impl std::fmt::Display) {
        self.logger.log(Level::INFO, msg);
    }

    pub fn warning(&self, msg: impl std::fmt::Display) {
        self.logger.log(Level::WARN, msg);
    }

    pub fn error(&self, msg: impl std::fmt::Display) {
        self.logger.log(Level::ERROR, msg);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn guess_mime(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}
