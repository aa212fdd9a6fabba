//! Response compression.
//!
//! Encoders come from a registry of named factories (`gzip`, `deflate`, `br`
//! and `zstd` out of the box). The middleware negotiates one against
//! `Accept-Encoding` and wraps the response writer in a [`CompressWriter`]
//! which holds output back until `min_size` bytes are known, so tiny bodies go
//! out unencoded.

use std::any::Any;
use std::io::{self, Write};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, VARY};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;

use crate::context::{Capabilities, Context, ReadyFuture, ResponseWriter, is_wrapped_by};
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware};

const DEFAULT_MIN_SIZE: usize = 512;
const MAX_POOLED_BUFFERS: usize = 64;

/// A streaming encoder writing into a [`SharedBuf`].
pub trait Encoder: Write + Send {
    /// Writes the stream trailer.
    fn close(self: Box<Self>) -> io::Result<()>;
}

impl Encoder for GzEncoder<SharedBuf> {
    fn close(self: Box<Self>) -> io::Result<()> {
        (*self).finish().map(drop)
    }
}

impl Encoder for DeflateEncoder<SharedBuf> {
    fn close(self: Box<Self>) -> io::Result<()> {
        (*self).finish().map(drop)
    }
}

impl Encoder for zstd::stream::write::Encoder<'static, SharedBuf> {
    fn close(self: Box<Self>) -> io::Result<()> {
        (*self).finish().map(drop)
    }
}

impl Encoder for brotli::CompressorWriter<SharedBuf> {
    fn close(self: Box<Self>) -> io::Result<()> {
        drop((*self).into_inner());
        Ok(())
    }
}

/// Builds an encoder over the given sink.
pub type EncoderFactory = Arc<dyn Fn(SharedBuf) -> io::Result<Box<dyn Encoder>> + Send + Sync>;

/// Output sink shared between an encoder and the writer draining it.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compression middleware with a registry of encoders. Registration order is
/// the server preference used to break `q` ties.
#[derive(Clone)]
pub struct Compress {
    encoders: Vec<(String, EncoderFactory)>,
    min_size: usize,
    buffers: Arc<SegQueue<Vec<u8>>>,
}

impl Compress {
    /// `br`, `zstd`, `gzip` and `deflate` at their default levels.
    pub fn new() -> Self {
        let mut compress = Self { encoders: Vec::new(), min_size: DEFAULT_MIN_SIZE, buffers: Arc::new(SegQueue::new()) };
        compress
            .register("br", |sink| Ok(Box::new(brotli::CompressorWriter::new(sink, 4096, 5, 22))))
            .register("zstd", |sink| Ok(Box::new(zstd::stream::write::Encoder::new(sink, 3)?)))
            .register("gzip", |sink| Ok(Box::new(GzEncoder::new(sink, Compression::default()))))
            .register("deflate", |sink| Ok(Box::new(DeflateEncoder::new(sink, Compression::default()))));
        compress
    }

    /// An empty registry.
    pub fn empty() -> Self {
        Self { encoders: Vec::new(), min_size: DEFAULT_MIN_SIZE, buffers: Arc::new(SegQueue::new()) }
    }

    /// Adds or replaces the encoder for `name`.
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(SharedBuf) -> io::Result<Box<dyn Encoder>> + Send + Sync + 'static,
    {
        let factory: EncoderFactory = Arc::new(factory);
        match self.encoders.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = factory,
            None => self.encoders.push((name.to_owned(), factory)),
        }
        self
    }

    /// Bodies shorter than this are sent unencoded.
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.encoders.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Picks the registered encoding with the highest `q` in `accept`.
    pub fn negotiate(&self, accept: &str) -> Option<(&str, &EncoderFactory)> {
        let mut wildcard = None;
        let mut prefs: Vec<(String, f32)> = Vec::new();
        for part in accept.split(',') {
            let mut fields = part.split(';');
            let name = fields.next().unwrap_or_default().trim().to_ascii_lowercase();
            let q = fields
                .filter_map(|f| f.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if name == "*" {
                wildcard = Some(q);
            } else if !name.is_empty() {
                prefs.push((name, q));
            }
        }

        let mut best: Option<(f32, &(String, EncoderFactory))> = None;
        for entry in &self.encoders {
            let q = prefs.iter().find(|(n, _)| *n == entry.0).map(|(_, q)| *q).or(wildcard).unwrap_or(0.0);
            if q > 0.0 && best.is_none_or(|(bq, _)| q > bq) {
                best = Some((q, entry));
            }
        }
        best.map(|(_, (name, factory))| (name.as_str(), factory))
    }
}

impl Default for Compress {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for Compress {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            if *ctx.method() == Method::HEAD || is_wrapped_by::<CompressWriter>(ctx.response()) {
                ctx.next().await;
                return;
            }
            let vary = ctx.response().headers().get_all(VARY).iter().any(|v| {
                v.to_str().is_ok_and(|v| v.split(',').any(|s| s.trim().eq_ignore_ascii_case("accept-encoding")))
            });
            if !vary {
                ctx.response_mut().headers_mut().append(VARY, HeaderValue::from_static("Accept-Encoding"));
            }

            let accept = ctx.headers().get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()).unwrap_or_default();
            let Some((name, factory)) = self.negotiate(accept) else {
                ctx.next().await;
                return;
            };
            let Ok(encoding) = HeaderValue::from_str(name) else {
                ctx.next().await;
                return;
            };
            let factory = Arc::clone(factory);
            let pending = self.buffers.pop().unwrap_or_default();
            let buffers = Arc::clone(&self.buffers);
            let min_size = self.min_size;
            ctx.set_response(|inner| {
                Box::new(CompressWriter {
                    inner,
                    encoding,
                    factory,
                    encoder: None,
                    sink: SharedBuf::default(),
                    pending,
                    min_size,
                    size: 0,
                    state: State::Buffering,
                    buffers,
                })
            });
            ctx.next().await;
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Buffering,
    Encoding,
    Passthrough,
}

/// Writer that encodes the body on its way to the wrapped writer.
pub struct CompressWriter {
    inner: Box<dyn ResponseWriter>,
    encoding: HeaderValue,
    factory: EncoderFactory,
    encoder: Option<Box<dyn Encoder>>,
    sink: SharedBuf,
    pending: Vec<u8>,
    min_size: usize,
    size: usize,
    state: State,
    buffers: Arc<SegQueue<Vec<u8>>>,
}

impl CompressWriter {
    /// Leaves buffering: encodes unless the handler already set an encoding
    /// or the status forbids a body.
    fn start(&mut self) -> Result<(), Error> {
        let status = self.inner.status();
        let skip = self.inner.headers().contains_key(CONTENT_ENCODING)
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let pending = std::mem::take(&mut self.pending);
        if skip {
            self.state = State::Passthrough;
            if !pending.is_empty() {
                self.inner.write(&pending)?;
            }
        } else {
            let mut encoder = (self.factory)(self.sink.clone())?;
            let headers = self.inner.headers_mut();
            headers.insert(CONTENT_ENCODING, self.encoding.clone());
            headers.remove(CONTENT_LENGTH);
            encoder.write_all(&pending)?;
            self.encoder = Some(encoder);
            self.state = State::Encoding;
            self.drain()?;
        }
        self.recycle(pending);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), Error> {
        let out = self.sink.take();
        if !out.is_empty() {
            self.inner.write(&out)?;
        }
        Ok(())
    }

    fn recycle(&self, mut buf: Vec<u8>) {
        if buf.capacity() > 0 && self.buffers.len() < MAX_POOLED_BUFFERS {
            buf.clear();
            self.buffers.push(buf);
        }
    }
}

impl ResponseWriter for CompressWriter {
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
        if !self.inner.wrote_header() {
            self.inner.write_header(StatusCode::OK);
        }
        self.size += data.len();
        match self.state {
            State::Buffering => {
                self.pending.extend_from_slice(data);
                if self.pending.len() >= self.min_size {
                    self.start()?;
                }
            }
            State::Encoding => {
                if let Some(encoder) = self.encoder.as_mut() {
                    encoder.write_all(data)?;
                }
                self.drain()?;
            }
            State::Passthrough => {
                self.inner.write(data)?;
            }
        }
        Ok(data.len())
    }

    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn wrote_header(&self) -> bool {
        self.inner.wrote_header()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.state == State::Buffering && !self.pending.is_empty() {
            self.start()?;
        }
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.flush()?;
            self.drain()?;
        }
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

    fn finish(mut self: Box<Self>) -> Result<(), Error> {
        match self.state {
            State::Buffering => {
                let pending = std::mem::take(&mut self.pending);
                if !pending.is_empty() {
                    self.inner.write(&pending)?;
                }
                self.recycle(pending);
            }
            State::Encoding => {
                if let Some(encoder) = self.encoder.take() {
                    encoder.close()?;
                }
                self.drain()?;
            }
            State::Passthrough => {}
        }
        let this = *self;
        this.inner.finish()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use bytes::Bytes;

    use crate::handler::{HandlerFunc, handler_fn};
    use crate::middleware::testing::run_request;

    fn body(text: &'static str) -> HandlerFunc {
        handler_fn(move |ctx: &mut Context| Box::pin(async move { ctx.write_string(text) }))
    }

    fn request(accept: &str) -> http::Request<Bytes> {
        http::Request::get("/").header(ACCEPT_ENCODING, accept).body(Bytes::new()).unwrap()
    }

    const TEXT: &str = "the quick brown fox jumps over the lazy dog, again and again and again";

    #[test]
    fn negotiation_honours_q_and_preference() {
        let c = Compress::new();
        assert_eq!(c.negotiate("gzip, br").map(|(n, _)| n), Some("br"));
        assert_eq!(c.negotiate("gzip;q=1, br;q=0.5").map(|(n, _)| n), Some("gzip"));
        assert_eq!(c.negotiate("br;q=0, *").map(|(n, _)| n), Some("zstd"));
        assert_eq!(c.negotiate("identity").map(|(n, _)| n), None);
        assert_eq!(c.negotiate("").map(|(n, _)| n), None);
    }

    #[tokio::test]
    async fn gzip_body_decodes() {
        let mw = crate::handler(Compress::new().with_min_size(0));
        let resp = run_request(request("gzip"), vec![mw, body(TEXT)]).await;
        assert_eq!(resp.headers[CONTENT_ENCODING], "gzip");
        assert_eq!(resp.headers[VARY], "Accept-Encoding");
        let mut plain = String::new();
        flate2::read::GzDecoder::new(&resp.body[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, TEXT);
    }

    #[tokio::test]
    async fn small_bodies_stay_plain() {
        let mw = crate::handler(Compress::new());
        let resp = run_request(request("gzip"), vec![mw, body("tiny")]).await;
        assert!(!resp.headers.contains_key(CONTENT_ENCODING));
        assert_eq!(&resp.body[..], b"tiny");
    }

    #[tokio::test]
    async fn double_registration_encodes_once() {
        let c = Compress::new().with_min_size(0);
        let resp =
            run_request(request("zstd"), vec![crate::handler(c.clone()), crate::handler(c), body(TEXT)]).await;
        assert_eq!(resp.headers.get_all(CONTENT_ENCODING).iter().count(), 1);
        let plain = zstd::decode_all(&resp.body[..]).unwrap();
        assert_eq!(plain, TEXT.as_bytes());
    }

    #[tokio::test]
    async fn handler_encoding_is_respected() {
        let pre = handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                ctx.set_header("content-encoding", "custom");
                ctx.write_string(TEXT);
            })
        });
        let mw = crate::handler(Compress::new().with_min_size(0));
        let resp = run_request(request("gzip"), vec![mw, pre]).await;
        assert_eq!(resp.headers[CONTENT_ENCODING], "custom");
        assert_eq!(&resp.body[..], TEXT.as_bytes());
    }
}
