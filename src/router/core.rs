//! Router core: registration and matching over the radix tree.
//!
//! Two implementations share one tree type:
//!
//! - [`RouterCoreStd`] publishes immutable snapshots through [`ArcSwap`].
//!   Registration clones the tree, matching never takes a lock.
//! - [`RouterCoreLock`] keeps the tree under an `RwLock` and mutates in
//!   place, for tables that are edited while serving (hot reload).
//!
//! Matching never fails: it yields the route chain, the 405 chain, or the
//! 404 chain.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::Error;
use crate::handler::{HandlerChain, HandlerFunc, handler_fn};
use crate::method::{
    DEFAULT_ALLOWED_METHODS, DEFAULT_ANY_METHODS, METHOD_ANY, METHOD_NOT_ALLOWED, METHOD_NOT_FOUND,
    normalize,
};
use crate::params::{PARAM_ALLOW, PARAM_ROUTE, Params};

use super::check::CheckRegistry;
use super::pattern::normalize_path;
use super::tree::{Node, RouteEntry};

/// The contract the facade registers into and the app matches against.
pub trait RouterCore: Send + Sync + 'static {
    /// Installs `chain` for `method` at `path` (`"<route> k=v …"`).
    fn handle_func(&self, method: &str, path: &str, chain: HandlerChain);

    /// Matches `method` + `path`, appending captures and route params to
    /// `params`, and returns the chain to run.
    fn match_func(&self, method: &str, path: &str, params: &mut Params) -> HandlerChain;

    /// `(method, route)` pairs in registration order.
    fn routes(&self) -> Vec<(String, String)>;
}

/// Method sets and checks a core is built with.
#[derive(Clone)]
pub struct RouterConfig {
    /// Methods accepted on registration; others are ignored.
    pub allowed_methods: Vec<String>,
    /// Methods an `ANY` registration expands into.
    pub any_methods: Vec<String>,
    pub checks: CheckRegistry,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            allowed_methods: DEFAULT_ALLOWED_METHODS.iter().map(|m| (*m).to_owned()).collect(),
            any_methods: DEFAULT_ANY_METHODS.iter().map(|m| (*m).to_owned()).collect(),
            checks: CheckRegistry::new(),
        }
    }
}

/// Tree plus the global fallbacks.
#[derive(Clone)]
pub(crate) struct RadixTree {
    config: RouterConfig,
    root: Node,
    not_found: RouteEntry,
    method_not_allowed: RouteEntry,
    routes: Vec<(String, String)>,
}

impl RadixTree {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            root: Node::root(),
            not_found: RouteEntry {
                params: Params::new(METHOD_NOT_FOUND),
                chain: Arc::from(vec![default_not_found()]),
            },
            method_not_allowed: RouteEntry {
                params: Params::new(METHOD_NOT_ALLOWED),
                chain: Arc::from(vec![default_method_not_allowed()]),
            },
            routes: Vec::new(),
        }
    }

    pub fn insert(&mut self, method: &str, path: &str, chain: HandlerChain) {
        let method = normalize(method);
        let mut params = Params::parse_route(path);
        let route = normalize_path(params.route());
        params.set(PARAM_ROUTE, route.as_str());

        match method.as_str() {
            METHOD_NOT_FOUND => {
                self.not_found = RouteEntry { params, chain };
                debug!("router: 404 handler installed");
                return;
            }
            METHOD_NOT_ALLOWED => {
                self.method_not_allowed = RouteEntry { params, chain };
                debug!("router: 405 handler installed");
                return;
            }
            METHOD_ANY => {}
            m if !self.config.allowed_methods.iter().any(|a| a == m) => {
                warn!(method = m, route = %route, "router: method not allowed for registration, ignored");
                return;
            }
            _ => {}
        }

        let leaf = self.root.insert_route(&route, &self.config.checks);
        leaf.install(&method, &route, RouteEntry { params, chain }, &self.config.any_methods);
        debug!(method = %method, route = %route, "router: route registered");
        self.routes.push((method, route));
    }

    pub fn lookup(&self, method: &str, path: &str, params: &mut Params) -> HandlerChain {
        let path = if path.is_empty() { "/" } else { path };
        let mark = params.len();
        match self.root.lookup(path.as_bytes(), params) {
            Some(node) => match node.slots.get(method) {
                Some(entry) => {
                    params.set(PARAM_ROUTE, entry.params.route());
                    params.merge(&entry.params);
                    Arc::clone(&entry.chain)
                }
                None => {
                    node.method_not_allowed_params(params);
                    params.merge(&self.method_not_allowed.params);
                    Arc::clone(&self.method_not_allowed.chain)
                }
            },
            None => {
                params.truncate(mark);
                params.set(PARAM_ROUTE, METHOD_NOT_FOUND);
                params.merge(&self.not_found.params);
                Arc::clone(&self.not_found.chain)
            }
        }
    }

    fn ensure_unfrozen(&self) -> Result<(), Error> {
        if self.routes.is_empty() {
            Ok(())
        } else {
            Err(Error::Config("router methods are immutable after the first registration".into()))
        }
    }

    pub fn set_methods(&mut self, allowed: Vec<String>, any: Vec<String>) -> Result<(), Error> {
        self.ensure_unfrozen()?;
        self.config.allowed_methods = allowed.into_iter().map(|m| normalize(&m)).collect();
        self.config.any_methods = any.into_iter().map(|m| normalize(&m)).collect();
        Ok(())
    }

    pub fn checks_mut(&mut self) -> Result<&mut CheckRegistry, Error> {
        self.ensure_unfrozen()?;
        Ok(&mut self.config.checks)
    }
}

// ── RouterCoreStd ─────────────────────────────────────────────────────────────

/// Snapshot-publishing core: lock-free matching, copy-on-write registration.
pub struct RouterCoreStd {
    tree: ArcSwap<RadixTree>,
}

impl RouterCoreStd {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self { tree: ArcSwap::from_pointee(RadixTree::new(config)) }
    }

    /// Replaces the allowed and Any method sets. Fails after the first route.
    pub fn set_methods(&self, allowed: Vec<String>, any: Vec<String>) -> Result<(), Error> {
        let mut tree = RadixTree::clone(&self.tree.load());
        tree.set_methods(allowed, any)?;
        self.tree.store(Arc::new(tree));
        Ok(())
    }

    /// Edits the check registry. Fails after the first route.
    pub fn configure_checks(&self, f: impl FnOnce(&mut CheckRegistry)) -> Result<(), Error> {
        let mut tree = RadixTree::clone(&self.tree.load());
        f(tree.checks_mut()?);
        self.tree.store(Arc::new(tree));
        Ok(())
    }
}

impl Default for RouterCoreStd {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterCore for RouterCoreStd {
    fn handle_func(&self, method: &str, path: &str, chain: HandlerChain) {
        self.tree.rcu(|current| {
            let mut next = RadixTree::clone(current);
            next.insert(method, path, Arc::clone(&chain));
            Arc::new(next)
        });
    }

    fn match_func(&self, method: &str, path: &str, params: &mut Params) -> HandlerChain {
        self.tree.load().lookup(method, path, params)
    }

    fn routes(&self) -> Vec<(String, String)> {
        self.tree.load().routes.clone()
    }
}

// ── RouterCoreLock ────────────────────────────────────────────────────────────

/// Core guarded by a read/write lock; matchers hold the read lock for the
/// duration of the descent.
pub struct RouterCoreLock {
    tree: RwLock<RadixTree>,
}

impl RouterCoreLock {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self { tree: RwLock::new(RadixTree::new(config)) }
    }

    pub fn set_methods(&self, allowed: Vec<String>, any: Vec<String>) -> Result<(), Error> {
        self.tree.write().set_methods(allowed, any)
    }

    pub fn configure_checks(&self, f: impl FnOnce(&mut CheckRegistry)) -> Result<(), Error> {
        f(self.tree.write().checks_mut()?);
        Ok(())
    }
}

impl Default for RouterCoreLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterCore for RouterCoreLock {
    fn handle_func(&self, method: &str, path: &str, chain: HandlerChain) {
        self.tree.write().insert(method, path, chain);
    }

    fn match_func(&self, method: &str, path: &str, params: &mut Params) -> HandlerChain {
        self.tree.read().lookup(method, path, params)
    }

    fn routes(&self) -> Vec<(String, String)> {
        self.tree.read().routes.clone()
    }
}

// ── Default fallbacks ─────────────────────────────────────────────────────────

fn default_not_found() -> HandlerFunc {
    handler_fn(|ctx: &mut Context| {
        Box::pin(async move {
            ctx.write_error(&Error::NotFound);
        })
    })
}

fn default_method_not_allowed() -> HandlerFunc {
    handler_fn(|ctx: &mut Context| {
        Box::pin(async move {
            let allow = ctx.get_param(PARAM_ALLOW).unwrap_or_default().to_owned();
            ctx.set_header(http::header::ALLOW.as_str(), &allow);
            ctx.write_error(&Error::MethodNotAllowed);
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(tag: &'static str) -> HandlerChain {
        Arc::from(vec![handler_fn(move |ctx: &mut Context| {
            Box::pin(async move {
                ctx.write_string(tag);
            })
        })])
    }

    fn tag_of(core: &dyn RouterCore, method: &str, path: &str) -> (HandlerChain, Params) {
        let mut params = Params::default();
        let chain = core.match_func(method, path, &mut params);
        (chain, params)
    }

    #[test]
    fn any_then_specific() {
        let core = RouterCoreStd::new();
        let (a, b, c) = (chain("A"), chain("B"), chain("C"));
        core.handle_func("GET", "/x", Arc::clone(&a));
        core.handle_func("ANY", "/x", Arc::clone(&b));
        assert!(Arc::ptr_eq(&tag_of(&core, "GET", "/x").0, &a));
        assert!(Arc::ptr_eq(&tag_of(&core, "POST", "/x").0, &b));
        core.handle_func("POST", "/x", Arc::clone(&c));
        assert!(Arc::ptr_eq(&tag_of(&core, "POST", "/x").0, &c));
        assert!(Arc::ptr_eq(&tag_of(&core, "GET", "/x").0, &a));
    }

    #[test]
    fn method_not_allowed_carries_sorted_allow() {
        let core = RouterCoreLock::new();
        core.handle_func("POST", "/h", chain("P"));
        core.handle_func("GET", "/h", chain("G"));
        let (_, params) = tag_of(&core, "PUT", "/h");
        assert_eq!(params.get(PARAM_ALLOW), Some("GET, POST"));
        assert_eq!(params.route(), "/h");
    }

    #[test]
    fn not_found_sets_route_404_only() {
        let core = RouterCoreStd::new();
        core.handle_func("GET", "/a/:id", chain("A"));
        core.handle_func("404", "/ kind=missing", chain("N"));
        let (_, params) = tag_of(&core, "GET", "/b/1");
        assert_eq!(params.route(), "404");
        assert_eq!(params.get("id"), None);
        assert_eq!(params.get("kind"), Some("missing"));
    }

    #[test]
    fn defaults_merge_into_params() {
        let core = RouterCoreStd::new();
        core.handle_func("GET", "/api/v1/u version=v1", chain("U"));
        let (_, params) = tag_of(&core, "GET", "/api/v1/u");
        assert_eq!(params.route(), "/api/v1/u");
        assert_eq!(params.get("version"), Some("v1"));
    }

    #[test]
    fn unknown_methods_are_ignored_and_sets_freeze() {
        let core = RouterCoreStd::new();
        core.handle_func("LOCK", "/doc", chain("L"));
        assert!(core.routes().is_empty());
        core.set_methods(vec!["GET".into(), "LOCK".into()], vec!["GET".into()]).unwrap();
        core.handle_func("LOCK", "/doc", chain("L"));
        assert_eq!(core.routes(), vec![("LOCK".to_owned(), "/doc".to_owned())]);
        assert!(core.set_methods(vec![], vec![]).is_err());
    }

    #[test]
    fn empty_path_is_root() {
        let core = RouterCoreStd::new();
        core.handle_func("GET", "", chain("R"));
        let (_, params) = tag_of(&core, "GET", "");
        assert_eq!(params.route(), "/");
    }
}
