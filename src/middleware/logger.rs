use std::time::Instant;

use crate::context::Context;
use crate::handler::{BoxFuture, Middleware};
use crate::params::{PARAM_ACTION, PARAM_ROUTE, PARAM_USERID};

/// Logs one line per completed request: method, path, route, action, user,
/// status, size, duration and any accumulated errors. 5xx responses and
/// requests with errors log at error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            ctx.next().await;

            let status = ctx.response().status();
            let line = format!(
                "{} {} route={} action={} user={} status={} size={} duration_ms={:.3}",
                ctx.method(),
                ctx.path(),
                ctx.get_param(PARAM_ROUTE).unwrap_or_default(),
                ctx.get_param(PARAM_ACTION).unwrap_or_default(),
                ctx.get_param(PARAM_USERID).unwrap_or_default(),
                status.as_u16(),
                ctx.response().size(),
                start.elapsed().as_secs_f64() * 1000.0,
            );
            if status.is_server_error() || !ctx.errors().is_empty() {
                let errors: Vec<String> = ctx.errors().iter().map(ToString::to_string).collect();
                ctx.error(format_args!("{line} errors={errors:?}"));
            } else {
                ctx.info(line);
            }
        })
    }
}
