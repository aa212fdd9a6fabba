use crate::context::{Context, HEADER_REQUEST_ID};
use crate::handler::{BoxFuture, Middleware};

/// Reuses the incoming `X-Request-Id` or mints a UUIDv4, echoes it on the
/// response and adds it to the request logger.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestId;

impl Middleware for RequestId {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let id = match ctx.header(HEADER_REQUEST_ID).filter(|id| !id.is_empty()) {
                Some(id) => id.to_owned(),
                None => uuid::Uuid::new_v4().to_string(),
            };
            ctx.set_header(HEADER_REQUEST_ID, &id);
            ctx.logger_mut().with_field("request_id", &id);
            ctx.next().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::middleware::testing::{run, run_request};
    use bytes::Bytes;

    fn echo_field() -> crate::HandlerFunc {
        handler_fn(|ctx: &mut Context| {
            Box::pin(async move {
                let id = ctx.logger().field("request_id").unwrap_or_default().to_owned();
                ctx.write_string(&id);
            })
        })
    }

    #[tokio::test]
    async fn mints_a_uuid() {
        let resp = run("/", vec![crate::handler(RequestId), echo_field()]).await;
        let header = resp.headers[HEADER_REQUEST_ID].to_str().unwrap().to_owned();
        assert!(uuid::Uuid::parse_str(&header).is_ok());
        assert_eq!(resp.body, Bytes::from(header));
    }

    #[tokio::test]
    async fn reuses_the_incoming_id() {
        let req = http::Request::get("/").header(HEADER_REQUEST_ID, "abc-123").body(Bytes::new()).unwrap();
        let resp = run_request(req, vec![crate::handler(RequestId), echo_field()]).await;
        assert_eq!(resp.headers[HEADER_REQUEST_ID], "abc-123");
        assert_eq!(&resp.body[..], b"abc-123");
    }
}
