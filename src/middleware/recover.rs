use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use http::StatusCode;
use http::header::CONTENT_TYPE;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, Middleware};

/// Turns a panic downstream into a 500 with a short text body. The panic
/// message and a backtrace go to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct Recover;

impl Middleware for Recover {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let outcome = AssertUnwindSafe(ctx.next()).catch_unwind().await;
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                ctx.error(format_args!("panic recovered: {message}\n{}", Backtrace::force_capture()));
                if !ctx.response().wrote_header() {
                    ctx.set_header(CONTENT_TYPE.as_str(), "text/plain; charset=utf-8");
                    ctx.write_header(StatusCode::INTERNAL_SERVER_ERROR);
                    ctx.write_string("internal server error");
                }
                ctx.push_error(Error::Panic(message));
                ctx.end();
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::run;

    async fn boom(_ctx: &mut Context) {
        panic!("boom");
    }

    #[tokio::test]
    async fn panic_becomes_plain_500() {
        let resp = run("/", vec![crate::handler(Recover), crate::handler(boom)]).await;
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&resp.body[..], b"internal server error");
        assert_eq!(resp.headers[CONTENT_TYPE], "text/plain; charset=utf-8");
    }

    #[test]
    fn payload_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "non-string panic payload");
    }
}
