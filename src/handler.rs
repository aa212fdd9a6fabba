//! Handler types and the handler extender.
//!
//! # How handlers are stored
//!
//! Every route holds a chain of [`HandlerFunc`]: one erased signature,
//! `Fn(&mut Context) -> BoxFuture<'_>`. User code rarely writes that shape
//! directly. It is produced in one of two ways:
//!
//! ```text
//! async fn show(ctx: &mut Context) -> Result<Render<User>>   ← user writes this
//!        ↓ router.get("/u/:id", show)
//! show.into_handler()                                        ← IntoHandler<(ContextShape, R)>
//!        ↓
//! Arc::new(move |ctx| Box::pin(async { show(ctx).await.reply(ctx) }))
//!        ↓ stored in the route's HandlerChain
//! chain[cursor](ctx).await   at request time                 ← one vtable call
//! ```
//!
//! Shapes known at compile time go through [`IntoHandler`]. Values whose type
//! is only known at registration time (plugin tables, controller maps) go
//! through the runtime [`HandlerExtender`], which is keyed by [`TypeId`].

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::context::Context;
use crate::error::Error;

// ── Canonical types ──────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future borrowing the request context.
pub type BoxFuture<'a, T = ()> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The canonical handler: every middleware and endpoint has this shape.
pub type HandlerFunc = Arc<dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync>;

/// An immutable, shareable handler slice.
pub type HandlerChain = Arc<[HandlerFunc]>;

/// Wraps a closure that already returns a boxed future.
///
/// ```rust
/// use keel::{Context, handler_fn};
///
/// let h = handler_fn(|ctx: &mut Context| Box::pin(async move {
///     ctx.write_string("pong");
/// }));
/// # drop(h);
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFunc
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Converts any supported shape into a [`HandlerFunc`].
pub fn handler<M, H: IntoHandler<M>>(h: H) -> HandlerFunc {
    h.into_handler()
}

// ── Middleware trait ─────────────────────────────────────────────────────────

/// Struct-based middleware. Call `ctx.next().await` to continue the chain;
/// returning without it stops the chain.
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a>;
}

/// Lets a middleware be registered while the caller keeps a handle to it,
/// e.g. to mutate an IP list at runtime.
impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        (**self).handle(ctx)
    }
}

// ── Reply ────────────────────────────────────────────────────────────────────

/// What a handler's return value does to the response.
pub trait Reply {
    fn reply(self, ctx: &mut Context);
}

impl Reply for () {
    fn reply(self, _: &mut Context) {}
}

impl<T: Reply, E: Into<Error>> Reply for Result<T, E> {
    fn reply(self, ctx: &mut Context) {
        match self {
            Ok(v) => v.reply(ctx),
            Err(e) => ctx.fatal(e),
        }
    }
}

impl<T: Reply> Reply for Option<T> {
    fn reply(self, ctx: &mut Context) {
        if let Some(v) = self {
            v.reply(ctx);
        }
    }
}

impl Reply for StatusCode {
    fn reply(self, ctx: &mut Context) {
        ctx.write_header(self);
    }
}

impl<T: Reply> Reply for (StatusCode, T) {
    fn reply(self, ctx: &mut Context) {
        ctx.write_header(self.0);
        self.1.reply(ctx);
    }
}

impl Reply for String {
    fn reply(self, ctx: &mut Context) {
        ctx.write_text(&self);
    }
}

impl Reply for &'static str {
    fn reply(self, ctx: &mut Context) {
        ctx.write_text(self);
    }
}

impl Reply for Bytes {
    fn reply(self, ctx: &mut Context) {
        ctx.write_bytes(&self);
    }
}

impl Reply for Vec<u8> {
    fn reply(self, ctx: &mut Context) {
        ctx.write_bytes(&self);
    }
}

impl Reply for serde_json::Value {
    fn reply(self, ctx: &mut Context) {
        if !self.is_null() {
            ctx.render(&self);
        }
    }
}

/// Renders the wrapped value through content negotiation.
#[derive(Clone, Debug)]
pub struct Render<T>(pub T);

impl<T: Serialize> Reply for Render<T> {
    fn reply(self, ctx: &mut Context) {
        ctx.render(&self.0);
    }
}

// ── Compile-time shapes ──────────────────────────────────────────────────────

/// Implemented for every shape the router accepts directly.
///
/// | Shape | Marker |
/// |---|---|
/// | [`HandlerFunc`] | `()` |
/// | `async fn(&mut Context) -> impl Reply` | `(ContextShape, R)` |
/// | `async fn() -> impl Reply` | `(NoArgShape, R)` |
/// | `async fn(&mut Context, Req) -> Result<Resp, E>` | `(RpcShape, Req, Resp, E)` |
/// | [`Raw`]`(fn(http::Request<Bytes>) -> http::Response<B>)` | `(RawShape, B)` |
/// | any [`Middleware`] | `MiddlewareShape` |
pub trait IntoHandler<M>: Send + Sync + 'static {
    fn into_handler(self) -> HandlerFunc;
}

#[doc(hidden)]
pub struct ContextShape;
#[doc(hidden)]
pub struct NoArgShape;
#[doc(hidden)]
pub struct RpcShape;
#[doc(hidden)]
pub struct RawShape;
#[doc(hidden)]
pub struct MiddlewareShape;

impl IntoHandler<()> for HandlerFunc {
    fn into_handler(self) -> HandlerFunc {
        self
    }
}

/// `Fn(&'a mut Context) -> impl Future + 'a` for one lifetime; quantified
/// over all lifetimes it admits `async fn(&mut Context)` items.
#[doc(hidden)]
pub trait CtxFn<'a, R>: Send + Sync + 'static {
    type Fut: Future<Output = R> + Send + 'a;
    fn call(&self, ctx: &'a mut Context) -> Self::Fut;
}

impl<'a, F, Fut, R> CtxFn<'a, R> for F
where
    F: Fn(&'a mut Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'a,
{
    type Fut = Fut;
    fn call(&self, ctx: &'a mut Context) -> Fut {
        self(ctx)
    }
}

impl<F, R> IntoHandler<(ContextShape, R)> for F
where
    F: for<'a> CtxFn<'a, R>,
    R: Reply + 'static,
{
    fn into_handler(self) -> HandlerFunc {
        let f = Arc::new(self);
        handler_fn(move |ctx: &mut Context| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let out = CtxFn::call(&*f, &mut *ctx).await;
                out.reply(ctx);
            })
        })
    }
}

impl<F, Fut, R> IntoHandler<(NoArgShape, R)> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Reply + 'static,
{
    fn into_handler(self) -> HandlerFunc {
        let f = Arc::new(self);
        handler_fn(move |ctx: &mut Context| {
            let fut = (*f)();
            Box::pin(async move {
                fut.await.reply(ctx);
            })
        })
    }
}

#[doc(hidden)]
pub trait CtxReqFn<'a, Req, R>: Send + Sync + 'static {
    type Fut: Future<Output = R> + Send + 'a;
    fn call(&self, ctx: &'a mut Context, req: Req) -> Self::Fut;
}

impl<'a, F, Fut, Req, R> CtxReqFn<'a, Req, R> for F
where
    F: Fn(&'a mut Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'a,
{
    type Fut = Fut;
    fn call(&self, ctx: &'a mut Context, req: Req) -> Fut {
        self(ctx, req)
    }
}

/// RPC shape: the request is bound (400 on failure), `Ok` is rendered with
/// 200 and `Err` goes through [`Context::fatal`].
impl<F, Req, Resp, E> IntoHandler<(RpcShape, Req, Resp, E)> for F
where
    F: for<'a> CtxReqFn<'a, Req, Result<Resp, E>>,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + 'static,
    E: Into<Error> + 'static,
{
    fn into_handler(self) -> HandlerFunc {
        let f = Arc::new(self);
        handler_fn(move |ctx: &mut Context| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let req = match ctx.bind::<Req>().await {
                    Ok(req) => req,
                    Err(e) => return ctx.fatal(e),
                };
                match CtxReqFn::call(&*f, &mut *ctx, req).await {
                    Ok(resp) => ctx.render(&resp),
                    Err(e) => ctx.fatal(e),
                }
            })
        })
    }
}

/// Adapter for plain `http::Request` → `http::Response` functions.
///
/// The request body is read in full before the call; the response status,
/// headers and body are copied onto the context.
pub struct Raw<F>(pub F);

impl<F, Fut, B> IntoHandler<(RawShape, B)> for Raw<F>
where
    F: Fn(http::Request<Bytes>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http::Response<B>> + Send + 'static,
    B: Into<Bytes> + 'static,
{
    fn into_handler(self) -> HandlerFunc {
        let f = Arc::new(self.0);
        handler_fn(move |ctx: &mut Context| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let body = match ctx.body().await {
                    Ok(body) => body,
                    Err(e) => return ctx.fatal(e),
                };
                let resp = f(ctx.to_http_request(body)).await;
                let (parts, body) = resp.into_parts();
                for (name, value) in &parts.headers {
                    ctx.response_mut().headers_mut().append(name, value.clone());
                }
                let body: Bytes = body.into();
                ctx.write_header(parts.status);
                ctx.write_bytes(&body);
            })
        })
    }
}

impl<T: Middleware> IntoHandler<MiddlewareShape> for T {
    fn into_handler(self) -> HandlerFunc {
        let m = Arc::new(self);
        handler_fn(move |ctx: &mut Context| {
            let m = Arc::clone(&m);
            Box::pin(async move { m.handle(ctx).await })
        })
    }
}

/// A handler that always fails with 500 and `message`. Installed in place of
/// handlers that could not be converted at registration time.
pub fn error_handler(message: impl Into<String>) -> HandlerFunc {
    let message: Arc<str> = Arc::from(message.into());
    handler_fn(move |ctx: &mut Context| {
        let message = Arc::clone(&message);
        Box::pin(async move {
            ctx.fatal(Error::RouteRegistration(message.to_string()));
        })
    })
}

// ── Runtime extender ─────────────────────────────────────────────────────────

/// A handler written against a custom context type `C`, made routable by
/// [`HandlerExtender::register_shim`].
pub type CustomHandler<C> = Arc<dyn for<'a> Fn(&'a mut Context, C) -> BoxFuture<'a> + Send + Sync>;

type Converter = Arc<dyn Fn(Box<dyn Any + Send>) -> Option<HandlerFunc> + Send + Sync>;

/// Registry of converters from arbitrary value types to [`HandlerFunc`].
///
/// Cloning is cheap; the first registration on a clone copies the table, so a
/// child router can extend its extender without affecting the parent.
#[derive(Clone)]
pub struct HandlerExtender {
    converters: Arc<HashMap<TypeId, (&'static str, Converter)>>,
}

impl HandlerExtender {
    /// An extender with the built-in converters: [`HandlerFunc`],
    /// `Arc<dyn Middleware>` and plain `fn` pointers of the canonical shape.
    pub fn new() -> Self {
        let mut ext = Self { converters: Arc::new(HashMap::new()) };
        ext.register(|h: HandlerFunc| h);
        ext.register(|m: Arc<dyn Middleware>| {
            handler_fn(move |ctx: &mut Context| {
                let m = Arc::clone(&m);
                Box::pin(async move { m.handle(ctx).await })
            })
        });
        ext.register(|f: for<'a> fn(&'a mut Context) -> BoxFuture<'a>| handler_fn(f));
        ext
    }

    /// Registers (or replaces) the converter for values of type `T`.
    pub fn register<T, F>(&mut self, convert: F)
    where
        T: Any + Send,
        F: Fn(T) -> HandlerFunc + Send + Sync + 'static,
    {
        let converter: Converter = Arc::new(move |value: Box<dyn Any + Send>| {
            value.downcast::<T>().ok().map(|v| convert(*v))
        });
        Arc::make_mut(&mut self.converters).insert(TypeId::of::<T>(), (type_name::<T>(), converter));
    }

    /// Makes [`CustomHandler<C>`] values routable: `wrap` builds the custom
    /// context on every call.
    pub fn register_shim<C, W>(&mut self, wrap: W)
    where
        C: Send + 'static,
        W: Fn(&mut Context) -> C + Send + Sync + 'static,
    {
        let wrap = Arc::new(wrap);
        self.register(move |h: CustomHandler<C>| {
            let wrap = Arc::clone(&wrap);
            handler_fn(move |ctx: &mut Context| {
                let custom = wrap(ctx);
                h(ctx, custom)
            })
        });
    }

    /// Converts `value`, failing when no converter is registered for `T`.
    pub fn convert<T: Any + Send>(&self, value: T) -> Result<HandlerFunc, Error> {
        let name = type_name::<T>();
        let (_, converter) = self.converters.get(&TypeId::of::<T>()).ok_or_else(|| {
            Error::RouteRegistration(format!("no handler converter registered for `{name}`"))
        })?;
        converter(Box::new(value)).ok_or_else(|| {
            Error::RouteRegistration(format!("handler converter for `{name}` rejected the value"))
        })
    }

    /// Type names with a registered converter, sorted.
    pub fn list(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.converters.values().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names
    }

    /// Like [`convert`](Self::convert), but a failure yields a handler that
    /// answers 500 with the failure message.
    pub fn convert_or_error<T: Any + Send>(&self, value: T) -> HandlerFunc {
        self.convert(value).unwrap_or_else(|e| {
            error!(error = %e, "handler extender: conversion failed");
            error_handler(e.to_string())
        })
    }
}

impl Default for HandlerExtender {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerExtender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerExtender").field("converters", &self.list()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plugin(&'static str);

    #[test]
    fn unknown_type_fails_conversion() {
        let ext = HandlerExtender::new();
        let err = ext.convert(Plugin("x")).err().unwrap();
        assert!(matches!(err, Error::RouteRegistration(_)));
        assert!(err.to_string().contains("Plugin"));
    }

    #[test]
    fn child_registration_does_not_leak_to_parent() {
        let parent = HandlerExtender::new();
        let mut child = parent.clone();
        child.register(|p: Plugin| {
            let tag = p.0;
            handler_fn(move |ctx: &mut Context| {
                Box::pin(async move {
                    ctx.write_string(tag);
                })
            })
        });
        assert!(child.convert(Plugin("ok")).is_ok());
        assert!(parent.convert(Plugin("ok")).is_err());
        assert_eq!(child.list().len(), parent.list().len() + 1);
    }

    #[test]
    fn builtins_are_registered() {
        let ext = HandlerExtender::new();
        let h = handler_fn(|_ctx: &mut Context| Box::pin(async {}));
        assert!(ext.convert(h).is_ok());
    }
}
