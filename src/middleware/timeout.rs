use std::any::Any;
use std::time::Duration;

use http::{HeaderMap, StatusCode};

use crate::context::{Capabilities, Context, ReadyFuture, ResponseWriter};
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware};

/// Bounds the rest of the chain by a deadline.
///
/// Downstream runs under a child cancellation token. When the deadline
/// passes, downstream is dropped and the token cancelled, then:
/// - nothing written yet: a 503 error body is rendered;
/// - status or body already written: what was written is flushed and every
///   later write is swallowed.
#[derive(Clone, Copy, Debug)]
pub struct Timeout {
    limit: Duration,
}

impl Timeout {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

impl Middleware for Timeout {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let token = ctx.cancellation().child_token();
            let parent = ctx.replace_cancellation(token.clone());
            let finished = tokio::time::timeout(self.limit, ctx.next()).await.is_ok();
            ctx.replace_cancellation(parent);
            if finished {
                return;
            }

            token.cancel();
            ctx.end();
            ctx.warning(format_args!("deadline of {:?} exceeded", self.limit));
            if ctx.response().wrote_header() {
                if let Err(e) = ctx.flush() {
                    ctx.warning(format_args!("flush after timeout: {e}"));
                }
                ctx.set_response(|inner| Box::new(SealedWriter { inner }));
            } else {
                ctx.write_error(&Error::Timeout);
            }
            ctx.push_error(Error::Timeout);
        })
    }
}

/// Closed response: headers and writes are accepted and dropped, finish
/// finalises what was already sent.
struct SealedWriter {
    inner: Box<dyn ResponseWriter>,
}

impl ResponseWriter for SealedWriter {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, _status: StatusCode) {}

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        Ok(data.len())
    }

    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn wrote_header(&self) -> bool {
        true
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn ready(&mut self) -> ReadyFuture<'_> {
        self.inner.ready()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn unwrap_writer(&self) -> Option<&dyn ResponseWriter> {
        Some(&*self.inner)
    }

    fn finish(self: Box<Self>) -> Result<(), Error> {
        self.inner.finish()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::middleware::testing::run;

    fn slow(status: Option<StatusCode>) -> crate::HandlerFunc {
        handler_fn(move |ctx: &mut Context| {
            Box::pin(async move {
                if let Some(status) = status {
                    ctx.write_header(status);
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
                ctx.write_string("too late");
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn unwritten_response_becomes_503() {
        let resp = run("/", vec![crate::handler(Timeout::new(Duration::from_secs(1))), slow(None)]).await;
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(String::from_utf8_lossy(&resp.body).contains("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn written_status_is_kept_and_later_writes_swallowed() {
        let outer = handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                ctx.next().await;
                ctx.write_string("post-work");
            })
        });
        let resp = run(
            "/",
            vec![outer, crate::handler(Timeout::new(Duration::from_secs(1))), slow(Some(StatusCode::ACCEPTED))],
        )
        .await;
        assert_eq!(resp.status, StatusCode::ACCEPTED);
        assert!(resp.body.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fast_handlers_are_untouched() {
        let fast = handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                assert!(!ctx.cancellation().is_cancelled());
                ctx.write_string("ok");
            })
        });
        let resp = run("/", vec![crate::handler(Timeout::new(Duration::from_secs(1))), fast]).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], b"ok");
    }
}
