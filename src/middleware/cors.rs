use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use http::{HeaderValue, Method, StatusCode};

use crate::context::Context;
use crate::handler::{BoxFuture, Middleware};
use crate::policy::glob_match;

/// CORS headers for origins matching a glob allow list (`*`,
/// `https://*.example.com`). Preflight requests are answered with 204 and do
/// not reach the route; register as global middleware so `OPTIONS` is seen
/// for every path.
#[derive(Clone, Debug)]
pub struct Cors {
    origins: Vec<String>,
    methods: String,
    headers: String,
    expose: String,
    credentials: bool,
    max_age: Option<u64>,
}

impl Cors {
    pub fn new() -> Self {
        Self {
            origins: vec!["*".into()],
            methods: "GET, POST, PUT, DELETE, PATCH, HEAD, OPTIONS".into(),
            headers: "Content-Type, Authorization, X-Request-Id".into(),
            expose: String::new(),
            credentials: false,
            max_age: Some(600),
        }
    }

    pub fn origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.join(", ");
        self
    }

    pub fn allow_headers(mut self, headers: &[&str]) -> Self {
        self.headers = headers.join(", ");
        self
    }

    pub fn expose_headers(mut self, headers: &[&str]) -> Self {
        self.expose = headers.join(", ");
        self
    }

    pub fn credentials(mut self, allow: bool) -> Self {
        self.credentials = allow;
        self
    }

    pub fn max_age(mut self, secs: Option<u64>) -> Self {
        self.max_age = secs;
        self
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.origins.iter().any(|pattern| glob_match(pattern, origin))
    }

    fn decorate(&self, ctx: &mut Context, origin: &str) {
        // A credentialed response may not use the `*` origin.
        let wildcard = !self.credentials && self.origins.iter().any(|o| o == "*");
        let headers = ctx.response_mut().headers_mut();
        match (wildcard, HeaderValue::from_str(origin)) {
            (true, _) => {
                headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            }
            (false, Ok(origin)) => {
                headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
                headers.append(VARY, HeaderValue::from_static("Origin"));
            }
            (false, Err(_)) => return,
        }
        if self.credentials {
            headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        if let Ok(expose) = HeaderValue::from_str(&self.expose) {
            if !self.expose.is_empty() {
                headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, expose);
            }
        }
    }
}

impl Default for Cors {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for Cors {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let Some(origin) = ctx.header(ORIGIN.as_str()).map(str::to_owned) else {
                ctx.next().await;
                return;
            };
            if !self.allows(&origin) {
                ctx.debug(format_args!("cors origin {origin} not allowed"));
                ctx.next().await;
                return;
            }
            self.decorate(ctx, &origin);

            let preflight = *ctx.method() == Method::OPTIONS
                && ctx.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD);
            if !preflight {
                ctx.next().await;
                return;
            }
            let headers = ctx.response_mut().headers_mut();
            if let Ok(methods) = HeaderValue::from_str(&self.methods) {
                headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);
            }
            if let Ok(allow) = HeaderValue::from_str(&self.headers) {
                headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allow);
            }
            if let Some(age) = self.max_age {
                headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(age));
            }
            ctx.write_header(StatusCode::NO_CONTENT);
            ctx.end();
        })
    }
}
