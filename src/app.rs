//! Application bootstrap.
//!
//! [`App`] wires the Context pool, the root [`Router`], the shared values
//! every Context sees and the config. [`App::handle`] is the whole request
//! path and needs no socket, which is how the integration tests drive it.
//!
//! ```text
//! hyper request
//!   → pool.acquire() + reset
//!   → entry chain: global middleware… → dispatch (match) → route chain…
//!   → writer.finish()  (or the head, as soon as a handler flushes)
//!   → pool.release()
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Body;

use crate::config::{
    AppConfig, CoreKind, VALUE_CONFIG, VALUE_EXTENDER, VALUE_POLICY, VALUE_SERVER, VALUE_VALIDATOR,
};
use crate::context::{BaseWriter, ContextPool, RequestInit, ResponseBody, Values, full_body};
use crate::error::{BoxError, Result};
use crate::method::normalize;
use crate::policy::{BearerSigner, Pbac, PolicyStore};
use crate::router::{Router, RouterConfig, RouterCore, RouterCoreLock, RouterCoreStd};
use crate::server::Server;
use crate::validator::Validator;

pub struct App {
    config: AppConfig,
    router: Router,
    pool: Arc<ContextPool>,
    values: Arc<Values>,
    policies: Arc<PolicyStore>,
}

impl App {
    /// An app with the default config.
    pub fn new() -> Self {
        Self::from_config(AppConfig::default())
    }

    /// Builds the router core the config asks for and seeds the shared
    /// values (`config`, `server`, `extender`, `validator`, `policy`).
    pub fn from_config(config: AppConfig) -> Self {
        let router_config = RouterConfig {
            allowed_methods: config.router.allowed_methods.iter().map(|m| normalize(m)).collect(),
            any_methods: config.router.any_methods.iter().map(|m| normalize(m)).collect(),
            ..RouterConfig::default()
        };
        let core: Arc<dyn RouterCore> = match config.router.core {
            CoreKind::Std => Arc::new(RouterCoreStd::with_config(router_config)),
            CoreKind::Lock => Arc::new(RouterCoreLock::with_config(router_config)),
        };
        let router = Router::with_core(core);

        let mut values: Values = HashMap::new();
        values.insert(VALUE_CONFIG.into(), Arc::new(config.clone()));
        values.insert(VALUE_SERVER.into(), Arc::new(config.server.clone()));
        values.insert(VALUE_EXTENDER.into(), Arc::new(router.extender().clone()));
        values.insert(VALUE_VALIDATOR.into(), Arc::new(Validator::new()));

        let policies = Arc::new(PolicyStore::new());
        policies.set_guest_policies(config.policy.guest_policies.clone());
        values.insert(VALUE_POLICY.into(), Arc::clone(&policies) as Arc<dyn Any + Send + Sync>);

        Self { config, router, pool: Arc::new(ContextPool::new()), values: Arc::new(values), policies }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    /// The policy store behind [`pbac`](Self::pbac), also reachable from
    /// handlers as the `policy` value.
    pub fn policy_store(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Access control middleware over this app's store. Bearers are verified
    /// when `policy.secret` is configured.
    pub fn pbac(&self) -> Result<Pbac> {
        let pbac = Pbac::new(Arc::clone(&self.policies));
        if self.config.policy.secret.is_empty() {
            return Ok(pbac);
        }
        Ok(pbac.with_signer(BearerSigner::new(&self.config.policy.secret)?))
    }

    /// Adds a value visible to every request through [`Context::value`](crate::Context::value).
    pub fn set_value<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> &mut Self {
        Arc::make_mut(&mut self.values).insert(key.into(), Arc::new(value));
        self
    }

    /// Serves one request.
    ///
    /// Returns as soon as the response head is available: either when the
    /// pipeline completes, or earlier when a handler flushes, in which case
    /// the rest of the pipeline keeps running and streams the body.
    pub async fn handle<B>(&self, req: http::Request<B>, remote: Option<SocketAddr>) -> http::Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        self.handle_conn(req, remote, false).await
    }

    /// [`handle`](Self::handle) for a request that arrived over TLS when
    /// `tls` is set.
    pub async fn handle_conn<B>(
        &self,
        req: http::Request<B>,
        remote: Option<SocketAddr>,
        tls: bool,
    ) -> http::Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let (writer, head_rx) = BaseWriter::new();
        let mut ctx = self.pool.acquire();
        ctx.reset(RequestInit {
            parts,
            body: body.map_err(Into::into).boxed_unsync(),
            remote,
            tls,
            writer: Box::new(writer),
            globals: Arc::clone(&self.values),
            body_limit: self.config.server.max_body_bytes,
        });
        ctx.set_handlers(self.router.entry_chain());

        // Dropping this future (client gone) cancels the request token.
        let guard = ctx.cancellation().clone().drop_guard();
        let pool = Arc::clone(&self.pool);
        let run = async move {
            ctx.next().await;
            if let Err(e) = ctx.drain().await {
                ctx.debug(format_args!("drain response: {e}"));
            }
            if let Err(e) = ctx.take_response().finish() {
                ctx.warning(format_args!("finish response: {e}"));
            }
            pool.release(ctx);
        };
        let mut run = Box::pin(run);
        let mut head_rx = head_rx;

        tokio::select! {
            biased;
            () = &mut run => {}
            head = &mut head_rx => {
                if let Ok(resp) = head {
                    guard.disarm();
                    // The pipeline is still writing; release happens when it ends.
                    tokio::spawn(run);
                    return resp;
                }
                run.await;
                return internal_error();
            }
        }
        head_rx.await.unwrap_or_else(|_| internal_error())
    }

    /// Installs the log subscriber and serves on the configured address
    /// until SIGTERM or Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        crate::logger::init(&self.config.logger)?;
        Server::new(self.config.server.clone()).serve(self).await
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// Response for a pipeline that dropped its writer without finishing it.
fn internal_error() -> http::Response<ResponseBody> {
    let mut resp = http::Response::new(full_body(Bytes::from_static(b"internal server error")));
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp
}
