//! Controllers: types whose methods become routes.
//!
//! A controller lists its methods through a [`ControllerMethods`] builder.
//! Method names carry the route:
//!
//! | Method name | Route under `UserController` |
//! |---|---|
//! | `Get` | `GET /user` |
//! | `GetById` | `GET /user/:id` |
//! | `PostAvatarByName` | `POST /user/avatar/:name` |
//! | `AnyPing` | every Any method at `/user/ping`, with `isany=1` |
//!
//! Names without a method prefix are skipped unless
//! [`Controller::controller_route`] maps them explicitly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error};

use crate::context::Context;
use crate::error::Error;
use crate::handler::{HandlerFunc, IntoHandler, Reply, handler_fn};
use crate::method::METHOD_ANY;
use crate::params::PARAM_ISANY;

use super::Router;

const METHOD_PREFIXES: [(&str, &str); 8] = [
    ("Get", "GET"),
    ("Post", "POST"),
    ("Put", "PUT"),
    ("Delete", "DELETE"),
    ("Patch", "PATCH"),
    ("Head", "HEAD"),
    ("Options", "OPTIONS"),
    ("Any", METHOD_ANY),
];

pub trait Controller: Send + Sync + 'static {
    /// Type name used for the route base: `UserController` → `/user`.
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    fn methods(self: Arc<Self>) -> ControllerMethods;

    /// Explicit routes by method name: `"METHOD /path k=v"`, or `"-"` to
    /// skip the method.
    fn controller_route(&self) -> HashMap<&'static str, &'static str> {
        HashMap::new()
    }

    /// Extra default params (`"k=v k=v"`) for one method.
    fn controller_param(&self, _method_name: &str, _http_method: &str) -> Option<String> {
        None
    }

    /// Fails the whole registration when set.
    fn controller_error(&self) -> Option<Error> {
        None
    }
}

/// `async fn(&self, &mut Context) -> impl Reply` for one lifetime.
#[doc(hidden)]
pub trait MethodFn<'a, C: 'a, R>: Send + Sync + 'static {
    type Fut: Future<Output = R> + Send + 'a;
    fn call(&self, this: &'a C, ctx: &'a mut Context) -> Self::Fut;
}

impl<'a, C: 'a, F, Fut, R> MethodFn<'a, C, R> for F
where
    F: Fn(&'a C, &'a mut Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'a,
{
    type Fut = Fut;
    fn call(&self, this: &'a C, ctx: &'a mut Context) -> Fut {
        self(this, ctx)
    }
}

/// Named handlers of a controller, plus embedded controllers whose methods
/// are inherited unless shadowed.
#[derive(Default)]
pub struct ControllerMethods {
    methods: Vec<(String, HandlerFunc)>,
    embeds: Vec<ControllerMethods>,
}

impl ControllerMethods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<M>(mut self, name: &str, handler: impl IntoHandler<M>) -> Self {
        self.methods.push((name.to_owned(), handler.into_handler()));
        self
    }

    /// Binds `method` on `this`:
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use keel::{Context, Controller, ControllerMethods};
    ///
    /// struct UserController { greeting: String }
    ///
    /// impl UserController {
    ///     async fn get_by_id(&self, ctx: &mut Context) -> String {
    ///         format!("{} {}", self.greeting, ctx.get_param("id").unwrap_or_default())
    ///     }
    /// }
    ///
    /// impl Controller for UserController {
    ///     fn methods(self: Arc<Self>) -> ControllerMethods {
    ///         ControllerMethods::new().method("GetById", &self, UserController::get_by_id)
    ///     }
    /// }
    /// ```
    pub fn method<C, F, R>(mut self, name: &str, this: &Arc<C>, method: F) -> Self
    where
        C: Send + Sync + 'static,
        F: for<'a> MethodFn<'a, C, R>,
        R: Reply + 'static,
    {
        let this = Arc::clone(this);
        let method = Arc::new(method);
        let handler = handler_fn(move |ctx: &mut Context| {
            let this = Arc::clone(&this);
            let method = Arc::clone(&method);
            Box::pin(async move {
                let out = MethodFn::call(&*method, &*this, &mut *ctx).await;
                out.reply(ctx);
            })
        });
        self.methods.push((name.to_owned(), handler));
        self
    }

    /// Inherits the methods of another controller.
    pub fn embed(mut self, other: ControllerMethods) -> Self {
        self.embeds.push(other);
        self
    }

    /// Own methods first, then embedded ones depth-first; the first method
    /// with a given name wins.
    pub fn flatten(self) -> Vec<(String, HandlerFunc)> {
        let mut out: Vec<(String, HandlerFunc)> = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<(String, HandlerFunc)>) {
        for (name, handler) in self.methods {
            if !out.iter().any(|(n, _)| *n == name) {
                out.push((name, handler));
            }
        }
        for embed in self.embeds {
            embed.flatten_into(out);
        }
    }
}

/// Splits `GetUserById` into `("GET", "/user/:id")`. Returns `None` when the
/// name has no method prefix.
pub fn derive_route(method_name: &str) -> Option<(&'static str, String)> {
    let (prefix, method) = METHOD_PREFIXES.iter().find(|(p, _)| method_name.starts_with(p))?;
    let rest = &method_name[prefix.len()..];
    if rest.starts_with(|c: char| c.is_ascii_lowercase()) {
        return None;
    }
    let mut route = String::new();
    let mut capture = false;
    for word in camel_words(rest) {
        if word == "By" {
            capture = true;
            continue;
        }
        route.push('/');
        if std::mem::take(&mut capture) {
            route.push(':');
        }
        route.push_str(&word.to_ascii_lowercase());
    }
    Some((*method, route))
}

fn camel_words(s: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = 0;
    for (i, c) in s.char_indices().skip(1) {
        if c.is_ascii_uppercase() {
            words.push(&s[start..i]);
            start = i;
        }
    }
    if start < s.len() {
        words.push(&s[start..]);
    }
    words
}

impl Router {
    /// Registers every routable method of `controller`. Routes are resolved
    /// first, so a malformed explicit route registers nothing.
    pub fn add_controller<C: Controller>(&mut self, controller: C) -> Result<&mut Self, Error> {
        if let Some(err) = controller.controller_error() {
            error!(controller = controller.name(), error = %err, "router: controller rejected");
            return Err(err);
        }
        let base = controller.name().trim_end_matches("Controller").to_ascii_lowercase();
        let base = if base.is_empty() { String::new() } else { format!("/{base}") };
        let explicit = controller.controller_route();
        let controller = Arc::new(controller);
        let methods = Arc::clone(&controller).methods().flatten();

        let mut planned = Vec::with_capacity(methods.len());
        for (name, handler) in methods {
            let (method, mut path) = match explicit.get(name.as_str()) {
                Some(&"-") => continue,
                Some(spec) => match spec.split_once(' ') {
                    Some((method, path)) => (method.to_owned(), path.trim().to_owned()),
                    None => return Err(Error::RouteRegistration(format!("controller route `{spec}` for {name}"))),
                },
                None => match derive_route(&name) {
                    Some((method, route)) => {
                        let mut path = format!("{base}{route}");
                        if path.is_empty() {
                            path.push('/');
                        }
                        if method == METHOD_ANY {
                            path.push_str(&format!(" {PARAM_ISANY}=1"));
                        }
                        (method.to_owned(), path)
                    }
                    None => {
                        debug!(controller = controller.name(), method = %name, "router: not a route, skipped");
                        continue;
                    }
                },
            };
            if let Some(extra) = controller.controller_param(&name, &method) {
                path.push(' ');
                path.push_str(&extra);
            }
            planned.push((method, path, handler));
        }
        for (method, path, handler) in planned {
            debug!(controller = controller.name(), method = %method, path = %path, "router: controller route");
            self.add_handlers(&method, &path, vec![handler]);
        }
        Ok(self)
    }
}
