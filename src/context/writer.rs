//! Response writers.
//!
//! The Context owns a chain of boxed [`ResponseWriter`]s. The innermost is a
//! [`BaseWriter`] talking to the connection; middleware may wrap it (see
//! [`Context::set_response`](crate::Context::set_response)) to post-process
//! output. Each wrapper owns its inner writer, and [`ResponseWriter::finish`]
//! is called once on the outermost writer when the pipeline ends, so every
//! layer finalises before the layer below it.
//!
//! The base writer buffers until it is flushed. Without a flush the response
//! goes out as one `Full` body; after a flush the head is committed and the
//! rest of the body is streamed over a bounded channel. Writes that find the
//! channel full stay buffered until [`ResponseWriter::ready`] resolves, so a
//! producer awaiting [`Context::drain`](crate::Context::drain) between chunks
//! holds at most [`STREAM_CHUNKS`] chunks in flight.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::{BoxError, Error};

/// The response body type produced by the framework.
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Chunks a streaming response may have queued for the connection.
pub const STREAM_CHUNKS: usize = 16;

/// Resolves once a writer has handed its buffered output on.
pub type ReadyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

/// Builds a response body from bytes.
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Optional capabilities of a writer chain, cached by the Context on reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub flush: bool,
    pub hijack: bool,
    pub push: bool,
}

/// The response side of a request.
pub trait ResponseWriter: Send + Any {
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sets the status. Only the first call takes effect.
    fn write_header(&mut self, status: StatusCode);

    /// Appends body bytes, implying a 200 if no status was written.
    fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// The written status, or 200 when none has been written yet.
    fn status(&self) -> StatusCode;

    /// True once a status has been written.
    fn wrote_header(&self) -> bool;

    /// Body bytes accepted so far.
    fn size(&self) -> usize;

    /// Commits the head and pushes buffered data to the client.
    fn flush(&mut self) -> Result<(), Error>;

    fn capabilities(&self) -> Capabilities;

    /// Waits until output buffered behind a full stream has been queued.
    /// Wrappers forward to their inner writer.
    fn ready(&mut self) -> ReadyFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    /// HTTP/2 server push. Writers without the capability do nothing.
    fn push(&mut self, _target: &str) -> Result<(), Error> {
        Ok(())
    }

    /// The wrapped writer, if this is a wrapper.
    fn unwrap_writer(&self) -> Option<&dyn ResponseWriter> {
        None
    }

    /// Finalises this writer and everything below it.
    fn finish(self: Box<Self>) -> Result<(), Error>;

    fn as_any(&self) -> &dyn Any;
}

// ── Base writer ──────────────────────────────────────────────────────────────

/// Writer bound to one connection response slot.
pub struct BaseWriter {
    status: Option<StatusCode>,
    headers: HeaderMap,
    buf: BytesMut,
    size: usize,
    head_tx: Option<oneshot::Sender<http::Response<ResponseBody>>>,
    stream_tx: Option<mpsc::Sender<Bytes>>,
}

impl BaseWriter {
    /// Returns the writer and the receiver the dispatcher awaits the response
    /// head on.
    pub fn new() -> (Self, oneshot::Receiver<http::Response<ResponseBody>>) {
        let (tx, rx) = oneshot::channel();
        let writer = Self {
            status: None,
            headers: HeaderMap::new(),
            buf: BytesMut::new(),
            size: 0,
            head_tx: Some(tx),
            stream_tx: None,
        };
        (writer, rx)
    }

    fn head(&mut self, body: ResponseBody) -> http::Response<ResponseBody> {
        let mut resp = http::Response::new(body);
        *resp.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *resp.headers_mut() = std::mem::take(&mut self.headers);
        resp
    }

    fn is_streaming(&self) -> bool {
        self.stream_tx.is_some()
    }

    /// Queues the buffer if the stream has room.
    fn pump(&mut self) -> Result<(), Error> {
        let Some(tx) = &self.stream_tx else {
            return Ok(());
        };
        if self.buf.is_empty() {
            return Ok(());
        }
        match tx.try_reserve() {
            Ok(permit) => {
                permit.send(self.buf.split().freeze());
                Ok(())
            }
            Err(TrySendError::Full(())) => Ok(()),
            Err(TrySendError::Closed(())) => Err(broken_pipe()),
        }
    }
}

fn broken_pipe() -> Error {
    Error::Io(std::io::ErrorKind::BrokenPipe.into())
}

impl ResponseWriter for BaseWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        match self.status {
            None => self.status = Some(status),
            Some(prev) if prev != status => {
                warn!(current = prev.as_u16(), ignored = status.as_u16(), "response status already written");
            }
            Some(_) => {}
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.size += data.len();
        self.buf.extend_from_slice(data);
        self.pump()?;
        Ok(data.len())
    }

    fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    fn wrote_header(&self) -> bool {
        self.status.is_some()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        if !self.is_streaming() {
            let (tx, rx) = mpsc::channel(STREAM_CHUNKS);
            self.headers.remove(CONTENT_LENGTH);
            let head = self.head(ChannelBody { rx }.boxed());
            if let Some(head_tx) = self.head_tx.take() {
                head_tx.send(head).map_err(|_| broken_pipe())?;
            }
            self.stream_tx = Some(tx);
        }
        self.pump()
    }

    fn ready(&mut self) -> ReadyFuture<'_> {
        Box::pin(async move {
            let Some(tx) = self.stream_tx.clone() else {
                return Ok(());
            };
            if !self.buf.is_empty() {
                let permit = tx.reserve().await.map_err(|_| broken_pipe())?;
                permit.send(self.buf.split().freeze());
            }
            Ok(())
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { flush: true, hijack: true, push: false }
    }

    fn finish(mut self: Box<Self>) -> Result<(), Error> {
        if self.is_streaming() {
            self.flush()?;
            if let Some(tx) = self.stream_tx.take() {
                if !self.buf.is_empty() {
                    // Tail left behind a full stream; hand it to a task so
                    // the body still ends after it.
                    let tail = self.buf.split().freeze();
                    match tokio::runtime::Handle::try_current() {
                        Ok(rt) => {
                            rt.spawn(async move {
                                let _ = tx.send(tail).await;
                            });
                        }
                        Err(_) => warn!(bytes = tail.len(), "response tail dropped: no runtime"),
                    }
                }
            }
            return Ok(());
        }
        let body = self.buf.split().freeze();
        if !self.headers.contains_key(CONTENT_LENGTH) {
            self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        let resp = self.head(full_body(body));
        if let Some(head_tx) = self.head_tx.take() {
            // receiver gone means the client went away
            let _ = head_tx.send(resp);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Streaming body fed by the base writer after a flush.
struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

// ── Discard writer ───────────────────────────────────────────────────────────

/// Accepts and drops everything. Stands in while a writer is being swapped
/// and after a timeout has closed the response.
#[derive(Default)]
pub struct DiscardWriter {
    headers: HeaderMap,
    status: Option<StatusCode>,
    size: usize,
}

impl ResponseWriter for DiscardWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        self.status.get_or_insert(status);
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.size += data.len();
        Ok(data.len())
    }

    fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    fn wrote_header(&self) -> bool {
        self.status.is_some()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn finish(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// True when `writer` or anything it wraps is a `T`.
pub fn is_wrapped_by<T: Any>(writer: &dyn ResponseWriter) -> bool {
    let mut current = Some(writer);
    while let Some(w) = current {
        if w.as_any().is::<T>() {
            return true;
        }
        current = w.unwrap_writer();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn buffered_response_is_full() {
        let (mut w, rx) = BaseWriter::new();
        w.write_header(StatusCode::CREATED);
        w.write_header(StatusCode::OK);
        w.write(b"hello").unwrap();
        Box::new(w).finish().unwrap();
        let resp = rx.await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()[CONTENT_LENGTH], "5");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn flush_commits_head_and_streams() {
        let (mut w, rx) = BaseWriter::new();
        w.write(b"a").unwrap();
        w.flush().unwrap();
        let resp = rx.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        w.write(b"b").unwrap();
        Box::new(w).finish().unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ab");
    }

    #[tokio::test]
    async fn full_stream_holds_writes_until_ready() {
        let (mut w, rx) = BaseWriter::new();
        w.flush().unwrap();
        let resp = rx.await.unwrap();
        for i in 0..STREAM_CHUNKS + 4 {
            w.write(format!("{i},").as_bytes()).unwrap();
        }
        assert!(!w.buf.is_empty());

        let reader = tokio::spawn(async move { resp.into_body().collect().await.unwrap().to_bytes() });
        w.ready().await.unwrap();
        assert!(w.buf.is_empty());
        Box::new(w).finish().unwrap();

        let expected: String = (0..STREAM_CHUNKS + 4).map(|i| format!("{i},")).collect();
        assert_eq!(reader.await.unwrap(), expected.as_bytes());
    }

    #[test]
    fn wrap_detection_walks_the_chain() {
        let (w, _rx) = BaseWriter::new();
        assert!(is_wrapped_by::<BaseWriter>(&w));
        assert!(!is_wrapped_by::<DiscardWriter>(&w));
    }
}
