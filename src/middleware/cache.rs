use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::time::Instant;

use crate::context::{Capabilities, Context, ReadyFuture, ResponseWriter, is_wrapped_by};
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware};

const HEADER_CACHE: &str = "x-cache";

/// One stored response.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    stored: Instant,
}

/// Caches successful `GET` responses per path and query for a fixed TTL.
/// Hits are served without running the rest of the chain and carry
/// `X-Cache: HIT`.
#[derive(Clone)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Arc<DashMap<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Arc::new(DashMap::new()) }
    }

    /// A fresh entry for `key`; stale entries are evicted on the way.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let entry = self.entries.get(key)?.clone();
        if entry.stored.elapsed() < self.ttl {
            return Some(entry);
        }
        self.entries.remove(key);
        None
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cache_key(ctx: &Context) -> String {
    ctx.uri().path_and_query().map_or_else(|| ctx.path().to_owned(), |pq| pq.as_str().to_owned())
}

impl Middleware for ResponseCache {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            if *ctx.method() != Method::GET || is_wrapped_by::<CaptureWriter>(ctx.response()) {
                ctx.next().await;
                return;
            }
            let key = cache_key(ctx);
            if let Some(hit) = self.get(&key) {
                let headers = ctx.response_mut().headers_mut();
                for (name, value) in &hit.headers {
                    headers.append(name, value.clone());
                }
                headers.insert(HEADER_CACHE, HeaderValue::from_static("HIT"));
                ctx.write_header(hit.status);
                ctx.write_bytes(&hit.body);
                ctx.end();
                return;
            }

            let entries = Arc::clone(&self.entries);
            ctx.set_response(|inner| Box::new(CaptureWriter { inner, key, entries, body: Vec::new() }));
            ctx.next().await;
        })
    }
}

/// Tees the body into a buffer and stores it on finish when the status is 200.
struct CaptureWriter {
    inner: Box<dyn ResponseWriter>,
    key: String,
    entries: Arc<DashMap<String, CachedResponse>>,
    body: Vec<u8>,
}

impl ResponseWriter for CaptureWriter {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        self.inner.write_header(status);
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let n = self.inner.write(data)?;
        self.body.extend_from_slice(data);
        Ok(n)
    }

    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn wrote_header(&self) -> bool {
        self.inner.wrote_header()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush()
    }

    fn ready(&mut self) -> ReadyFuture<'_> {
        self.inner.ready()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn unwrap_writer(&self) -> Option<&dyn ResponseWriter> {
        Some(&*self.inner)
    }

    fn finish(self: Box<Self>) -> Result<(), Error> {
        let this = *self;
        if this.inner.status() == StatusCode::OK {
            let mut headers = this.inner.headers().clone();
            headers.remove(HEADER_CACHE);
            this.entries.insert(
                this.key,
                CachedResponse {
                    status: StatusCode::OK,
                    headers,
                    body: Bytes::from(this.body),
                    stored: Instant::now(),
                },
            );
        }
        this.inner.finish()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
