//! Reference middleware.
//!
//! Every middleware here implements [`Middleware`](crate::Middleware) and is
//! registered like any handler:
//!
//! ```rust
//! use std::time::Duration;
//! use keel::Router;
//! use keel::middleware::{Compress, Recover, RequestId, RequestLogger, Timeout};
//!
//! let mut router = Router::new();
//! router
//!     .use_global(RequestId)
//!     .use_global(RequestLogger)
//!     .use_global(Recover)
//!     .use_global(Compress::new())
//!     .use_middleware(Timeout::new(Duration::from_secs(5)));
//! ```
//!
//! The usual shapes:
//! - pre-work, `ctx.next().await`, post-work;
//! - short-circuit by writing a response and returning without `next`;
//! - wrap the response writer with [`Context::set_response`](crate::Context::set_response)
//!   to post-process output.
//!
//! Middleware that wraps the writer checks [`is_wrapped_by`](crate::is_wrapped_by)
//! first, so registering it twice is harmless.

mod auth;
mod body_limit;
mod cache;
mod compress;
mod cors;
mod header;
mod iplist;
mod logger;
mod rate;
mod recover;
mod request_id;
mod timeout;

pub use auth::{BasicAuth, BearerAuth};
pub use body_limit::BodyLimit;
pub use cache::{CachedResponse, ResponseCache};
pub use compress::{Compress, CompressWriter, Encoder, EncoderFactory, SharedBuf};
pub use cors::Cors;
pub use header::Headers;
pub use iplist::{Cidr, IpList};
pub use logger::RequestLogger;
pub use rate::{RateLimit, RateLimiter};
pub use recover::Recover;
pub use request_id::RequestId;
pub use timeout::Timeout;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use http_body_util::BodyExt;

    use crate::context::tests::context_for;
    use crate::handler::HandlerFunc;

    pub(crate) struct Collected {
        pub status: StatusCode,
        pub headers: HeaderMap,
        pub body: Bytes,
    }

    pub(crate) async fn run(uri: &str, handlers: Vec<HandlerFunc>) -> Collected {
        run_request(http::Request::get(uri).body(Bytes::new()).unwrap(), handlers).await
    }

    /// Runs `handlers` as the whole chain for `req` and collects the response.
    pub(crate) async fn run_request(req: http::Request<Bytes>, handlers: Vec<HandlerFunc>) -> Collected {
        let (mut ctx, rx) = context_for(req);
        ctx.set_handlers(Arc::from(handlers));
        ctx.next().await;
        ctx.take_response().finish().unwrap();
        let (parts, body) = rx.await.unwrap().into_parts();
        Collected { status: parts.status, headers: parts.headers, body: body.collect().await.unwrap().to_bytes() }
    }
}
