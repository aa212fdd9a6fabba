use http::header::CONTENT_LENGTH;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware};

/// Caps how many request body bytes downstream may read. A declared
/// `Content-Length` over the cap is refused up front with 413; otherwise
/// reads past the cap fail with [`Error::BodyTooLarge`].
#[derive(Clone, Copy, Debug)]
pub struct BodyLimit {
    limit: usize,
}

impl BodyLimit {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl Middleware for BodyLimit {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let declared = ctx.header(CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse::<usize>().ok());
            if declared.is_some_and(|n| n > self.limit) {
                ctx.fatal(Error::BodyTooLarge(self.limit));
                return;
            }
            ctx.set_body_limit(self.limit);
            ctx.next().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;

    use crate::handler::handler_fn;
    use crate::middleware::testing::run_request;

    fn read_body() -> crate::HandlerFunc {
        handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                match ctx.body().await {
                    Ok(body) => ctx.write_bytes(&body),
                    Err(e) => ctx.fatal(e),
                }
            })
        })
    }

    #[tokio::test]
    async fn declared_length_over_limit_is_413() {
        let req = http::Request::post("/")
            .header(CONTENT_LENGTH, "10")
            .body(Bytes::from_static(b"0123456789"))
            .unwrap();
        let resp = run_request(req, vec![crate::handler(BodyLimit::new(4)), read_body()]).await;
        assert_eq!(resp.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn undeclared_overflow_fails_the_read() {
        let req = http::Request::post("/").body(Bytes::from_static(b"0123456789")).unwrap();
        let resp = run_request(req, vec![crate::handler(BodyLimit::new(4)), read_body()]).await;
        assert_eq!(resp.status, StatusCode::PAYLOAD_TOO_LARGE);

        let req = http::Request::post("/").body(Bytes::from_static(b"012")).unwrap();
        let resp = run_request(req, vec![crate::handler(BodyLimit::new(4)), read_body()]).await;
        assert_eq!(&resp.body[..], b"012");
    }
}
