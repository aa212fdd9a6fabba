//! Request router.
//!
//! [`Router`] is the registration facade: it carries a path prefix with
//! default params, path-scoped middleware and a [`HandlerExtender`], and
//! installs fully assembled chains into a shared [`RouterCore`].
//!
//! ```rust
//! use keel::{Context, Router};
//!
//! async fn show(ctx: &mut Context) -> String {
//!     format!("user {}", ctx.get_param("id").unwrap_or_default())
//! }
//!
//! let router = Router::new();
//! let mut api = router.group("/api/v1 version=v1");
//! api.get("/users/:id|num", show);
//! assert_eq!(router.routes(), vec![("GET".to_owned(), "/api/v1/users/:id|num".to_owned())]);
//! ```
//!
//! # Route patterns
//!
//! ```text
//! /static            constant
//! /users/:id         one segment, captured as `id`
//! /users/:id|num     same, only when the `num` check passes
//! /files/*path       the rest of the path, captured as `path`
//! /v/{:ver|regexp:{^v[0-9]+$}}   braces keep a segment whole
//! /route k=v k2=v2   default params merged on match
//! ```
//!
//! Matching prefers constant over parameter over wildcard, and a validated
//! segment over a plain one of the same kind.

mod check;
mod controller;
mod core;
mod pattern;
mod tree;

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::context::Context;
use crate::handler::{HandlerChain, HandlerExtender, HandlerFunc, IntoHandler, handler_fn};
use crate::method::{METHOD_NOT_ALLOWED, METHOD_NOT_FOUND, Method};
use crate::params::{PARAM_LOGGER_KIND, PARAM_ROUTE, Params};

pub use check::{CheckBuilder, CheckFn, CheckRegistry};
pub use controller::{Controller, ControllerMethods, MethodFn, derive_route};
pub use self::core::{RouterConfig, RouterCore, RouterCoreLock, RouterCoreStd};

/// Middleware prefix that runs before route matching.
pub const GLOBAL: &str = "global";

/// Registration facade over a [`RouterCore`].
///
/// Groups share the core and the global middleware list with their parent;
/// everything else (prefix, default params, scoped middleware, extender) is
/// copied when the group is created.
#[derive(Clone)]
pub struct Router {
    params: Params,
    middlewares: Vec<(String, Vec<HandlerFunc>)>,
    extender: HandlerExtender,
    core: Arc<dyn RouterCore>,
    entry: Arc<RwLock<HandlerChain>>,
}

impl Router {
    /// A router over a fresh [`RouterCoreStd`].
    pub fn new() -> Self {
        Self::with_core(Arc::new(RouterCoreStd::new()))
    }

    pub fn with_core(core: Arc<dyn RouterCore>) -> Self {
        let dispatch = dispatch_handler(Arc::clone(&core));
        Self {
            params: Params::default(),
            middlewares: Vec::new(),
            extender: HandlerExtender::new(),
            core,
            entry: Arc::new(RwLock::new(Arc::from(vec![dispatch]))),
        }
    }

    pub fn core(&self) -> &Arc<dyn RouterCore> {
        &self.core
    }

    /// The group's prefix and default params.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// A child router under `path` (`"/prefix k=v …"`).
    pub fn group(&self, path: &str) -> Router {
        let mut group = self.clone();
        group.params = self.params.combine_with_route(&Params::parse_route(&trim_prefix(path)));
        group
    }

    pub fn extender(&self) -> &HandlerExtender {
        &self.extender
    }

    /// Extender for this router and groups created from it afterwards.
    pub fn extender_mut(&mut self) -> &mut HandlerExtender {
        &mut self.extender
    }

    // ── Middleware ───────────────────────────────────────────────────────────

    /// Adds middleware for routes under `path` (relative to the group), or
    /// before matching when `path` is [`GLOBAL`].
    ///
    /// Scoped middleware is resolved at registration: only routes added
    /// after this call receive it.
    pub fn add_middleware(&mut self, path: &str, handlers: Vec<HandlerFunc>) -> &mut Self {
        if path == GLOBAL {
            let mut entry = self.entry.write();
            let mut chain: Vec<HandlerFunc> = entry.iter().cloned().collect();
            let dispatch = chain.pop();
            chain.extend(handlers);
            chain.extend(dispatch);
            *entry = Arc::from(chain);
            debug!(count = entry.len() - 1, "router: global middleware installed");
            drop(entry);
            return self;
        }
        let prefix = format!("{}{}", self.params.route(), trim_prefix(path));
        self.middlewares.push((prefix, handlers));
        self
    }

    /// Adds one middleware for every route of this group registered later.
    pub fn use_middleware<M>(&mut self, middleware: impl IntoHandler<M>) -> &mut Self {
        self.add_middleware("", vec![middleware.into_handler()])
    }

    /// Adds one middleware that runs before matching for every request.
    pub fn use_global<M>(&mut self, middleware: impl IntoHandler<M>) -> &mut Self {
        self.add_middleware(GLOBAL, vec![middleware.into_handler()])
    }

    /// The chain every request starts with: global middleware, then the
    /// dispatcher.
    pub(crate) fn entry_chain(&self) -> HandlerChain {
        Arc::clone(&self.entry.read())
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    /// Registers a chain for `method` at `path`. Matching middleware is
    /// prepended and the group's prefix and params are applied.
    pub fn add_handlers(&mut self, method: &str, path: &str, handlers: Vec<HandlerFunc>) -> &mut Self {
        let mut leaf = Params::parse_route(path);
        if !leaf.route().is_empty() && !leaf.route().starts_with('/') {
            let mut rooted = Params::new(format!("/{}", leaf.route()));
            rooted.merge(&leaf);
            leaf = rooted;
        }
        let params = self.params.combine_with_route(&leaf);
        let route = params.route();
        let mut chain: Vec<HandlerFunc> = self
            .middlewares
            .iter()
            .filter(|(prefix, _)| route.starts_with(prefix.as_str()))
            .flat_map(|(_, hs)| hs.iter().cloned())
            .collect();
        chain.extend(handlers);
        self.core.handle_func(method, &params.to_string(), Arc::from(chain));
        self
    }

    pub fn add_handler<M>(&mut self, method: &str, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.add_handlers(method, path, vec![handler.into_handler()])
    }

    /// Registers a value converted through the extender. A value without a
    /// converter is installed as a handler answering 500.
    pub fn add_handler_value<T: Any + Send>(&mut self, method: &str, path: &str, value: T) -> &mut Self {
        let handler = self.extender.convert_or_error(value);
        self.add_handlers(method, path, vec![handler])
    }

    /// Registers under a typed method. Pseudo-methods work too:
    /// `Method::Any` expands over the router's Any set.
    pub fn on<M>(&mut self, method: Method, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.add_handler(method.as_str(), path, handler)
    }

    pub fn get<M>(&mut self, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.on(Method::Get, path, handler)
    }

    pub fn post<M>(&mut self, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.on(Method::Post, path, handler)
    }

    pub fn put<M>(&mut self, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.on(Method::Put, path, handler)
    }

    pub fn delete<M>(&mut self, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.on(Method::Delete, path, handler)
    }

    pub fn patch<M>(&mut self, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.on(Method::Patch, path, handler)
    }

    pub fn head<M>(&mut self, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.on(Method::Head, path, handler)
    }

    pub fn options<M>(&mut self, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.on(Method::Options, path, handler)
    }

    /// Registers for every method of the Any set that has no specific handler.
    pub fn any<M>(&mut self, path: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.on(Method::Any, path, handler)
    }

    /// Replaces the 404 handler. `defaults` are params such as `"kind=missing"`.
    pub fn not_found<M>(&mut self, defaults: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.add_handler(METHOD_NOT_FOUND, &format!("/ {defaults}"), handler)
    }

    /// Replaces the 405 handler. The `allow` param carries the bound methods.
    pub fn method_not_allowed<M>(&mut self, defaults: &str, handler: impl IntoHandler<M>) -> &mut Self {
        self.add_handler(METHOD_NOT_ALLOWED, &format!("/ {defaults}"), handler)
    }

    /// `(method, route)` pairs registered on the core.
    pub fn routes(&self) -> Vec<(String, String)> {
        self.core.routes()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_prefix(path: &str) -> String {
    let (route, rest) = path.trim().split_once(' ').unwrap_or((path.trim(), ""));
    let route = route.trim_end_matches('/');
    let route = if route.is_empty() || route.starts_with('/') { route.to_owned() } else { format!("/{route}") };
    if rest.is_empty() { route } else { format!("{route} {rest}") }
}

/// The last handler of the entry chain: matches the request and continues
/// into the matched chain.
fn dispatch_handler(core: Arc<dyn RouterCore>) -> HandlerFunc {
    handler_fn(move |ctx: &mut Context| {
        let core = Arc::clone(&core);
        Box::pin(async move {
            let method = ctx.method().as_str().to_owned();
            let path = ctx.path().to_owned();
            let chain = core.match_func(&method, &path, ctx.params_mut());
            if ctx.get_param(PARAM_LOGGER_KIND) != Some("~all") {
                let route = ctx.get_param(PARAM_ROUTE).unwrap_or_default().to_owned();
                ctx.logger_mut().with_field(PARAM_ROUTE, route);
            }
            ctx.set_handlers(chain);
            ctx.next().await;
        })
    })
}
