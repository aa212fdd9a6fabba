//! # keel
//!
//! An HTTP framework built around one mutable request [`Context`] that
//! flows through a chain of handlers.
//!
//! ## The model
//!
//! A request is served by a flat chain: global middleware, then the route's
//! middleware, then the route handler. Every link is a [`HandlerFunc`]
//! taking `&mut Context`; middleware calls [`Context::next`] to run the rest
//! of the chain and inspects the response when it returns. Calling
//! [`Context::end`] stops the chain.
//!
//! What keel ships:
//!
//! - Radix-tree routing with params, wildcards, validation checks and
//!   default params, over a swappable [`RouterCore`]
//! - A [`HandlerExtender`] that turns plain async fns, RPC-style
//!   `(ctx, request) -> Result<response>` fns and middleware values into
//!   [`HandlerFunc`]s
//! - The [`middleware`] set: logging, recovery, request ids, timeouts,
//!   compression, CORS, auth, rate and body limits, IP lists, caching
//! - Policy-based access control in [`policy`]
//! - hyper 1 serving with graceful shutdown via [`App::serve`]
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use keel::middleware::{Recover, RequestLogger};
//! use keel::{App, Context, Error};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct NewUser {
//!     name: String,
//! }
//!
//! #[derive(Serialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! async fn get_user(ctx: &mut Context) -> String {
//!     format!("user {}", ctx.get_param("id").unwrap_or_default())
//! }
//!
//! async fn create_user(_ctx: &mut Context, req: NewUser) -> Result<User, Error> {
//!     Ok(User { id: 99, name: req.name })
//! }
//!
//! #[tokio::main]
//! async fn main() -> keel::Result<()> {
//!     let mut app = App::new();
//!     let router = app.router_mut();
//!     router.use_global(Recover).use_global(RequestLogger);
//!     router.get("/users/:id|num", get_user);
//!     router.post("/users", create_user);
//!     app.serve().await
//! }
//! ```

mod app;
mod config;
mod context;
mod error;
mod handler;
mod logger;
mod method;
mod params;
mod router;
mod server;
mod validator;

pub mod middleware;
pub mod policy;

pub use app::App;
pub use config::{
    AppConfig, CoreKind, LogFormat, LogOutput, LoggerConfig, PolicyConfig, RouterSection, ServerConfig,
    VALUE_CONFIG, VALUE_EXTENDER, VALUE_POLICY, VALUE_SERVER, VALUE_TEMPLATE, VALUE_VALIDATOR,
};
pub use context::{
    BaseWriter, Capabilities, Context, ContextPool, Cookie, DiscardWriter, FormData, FormFile, HEADER_REQUEST_ID,
    ReadyFuture, RequestBody, ResponseBody, ResponseWriter, STREAM_CHUNKS, TemplateRenderer, Values, full_body,
    is_wrapped_by,
};
pub use error::{BoxError, Error, ErrorBody, Result};
pub use handler::{
    BoxFuture, ContextShape, CtxFn, CtxReqFn, CustomHandler, HandlerChain, HandlerExtender, HandlerFunc, IntoHandler, Middleware,
    MiddlewareShape, NoArgShape, Raw, RawShape, Render, Reply, RpcShape, error_handler, handler, handler_fn,
};
pub use logger::Logger;
pub use method::{DEFAULT_ALLOWED_METHODS, DEFAULT_ANY_METHODS, METHOD_ANY, METHOD_NOT_ALLOWED, METHOD_NOT_FOUND, Method};
pub use params::{
    PARAM_ACTION, PARAM_ALLOW, PARAM_AUTOINDEX, PARAM_ISANY, PARAM_LOGGER_KIND, PARAM_RESOURCE, PARAM_ROUTE,
    PARAM_TEMPLATE, PARAM_USERID, PARAM_VALID, Params,
};
pub use router::{
    CheckBuilder, CheckFn, CheckRegistry, Controller, ControllerMethods, GLOBAL, MethodFn, Router, RouterConfig,
    RouterCore, RouterCoreLock, RouterCoreStd, derive_route,
};
pub use server::Server;
pub use validator::{RuleBuilder, RuleFn, Validate, Validator};
