//! HTTP server and graceful shutdown.
//!
//! # Shutdown
//!
//! On SIGTERM or Ctrl-C (or when the future given to
//! [`Server::serve_with_shutdown`] resolves) the server:
//! 1. Stops `listener.accept()`, so no new connections are made.
//! 2. Lets every in-flight connection task run to completion, bounded by
//!    [`ServerConfig::shutdown_timeout`]; stragglers are aborted.
//! 3. Returns, which lets `main` exit cleanly.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// hyper refuses read buffers smaller than this.
const MIN_BUF_SIZE: usize = 8 * 1024;

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// A server with default tuning bound to `addr`.
    pub fn bind(addr: &str) -> Result<Self> {
        let config = ServerConfig { addr: addr.to_owned(), ..ServerConfig::default() };
        config.socket_addr()?;
        Ok(Self { config })
    }

    /// Serves `app` until SIGTERM or Ctrl-C, then drains.
    pub async fn serve(self, app: App) -> Result<()> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Serves `app` until `shutdown` resolves, then drains.
    pub async fn serve_with_shutdown(self, app: App, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()?).await?;
        self.serve_listener(listener, app, shutdown).await
    }

    /// Like [`serve_with_shutdown`](Self::serve_with_shutdown) on a listener
    /// the caller already bound.
    pub async fn serve_listener(
        self,
        listener: TcpListener,
        app: App,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let app = Arc::new(app);
        let builder = self.connection_builder();
        info!(addr = %listener.local_addr()?, "keel listening");

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(serve_io(builder.clone(), Arc::clone(&app), stream, remote, false));
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drain(&mut tasks, &self.config).await;
        info!("keel stopped");
        Ok(())
    }

    /// Serves one already accepted connection until it closes. A caller that
    /// terminates TLS itself passes the decrypted stream with `tls` set, which
    /// is what [`Context::is_tls`](crate::Context::is_tls) reports.
    pub async fn serve_connection<I>(&self, app: Arc<App>, io: I, remote: SocketAddr, tls: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        serve_io(self.connection_builder(), app, io, remote, tls).await;
    }

    fn connection_builder(&self) -> ConnBuilder<TokioExecutor> {
        let mut builder = ConnBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .keep_alive(self.config.keep_alive)
            .max_buf_size(self.config.max_header_bytes.max(MIN_BUF_SIZE));
        if let Some(timeout) = self.config.read_header_timeout() {
            builder.http1().timer(TokioTimer::new()).header_read_timeout(timeout);
        }
        builder
            .http2()
            .timer(TokioTimer::new())
            .max_header_list_size(u32::try_from(self.config.max_header_bytes).unwrap_or(u32::MAX));
        builder
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn addr(&self) -> Result<SocketAddr, Error> {
        self.config.socket_addr()
    }
}

async fn serve_io<I>(builder: ConnBuilder<TokioExecutor>, app: Arc<App>, io: I, remote: SocketAddr, tls: bool)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let svc = service_fn(move |req: hyper::Request<Incoming>| {
        let app = Arc::clone(&app);
        async move { Ok::<_, Infallible>(app.handle_conn(req, Some(remote), tls).await) }
    });
    if let Err(e) = builder.serve_connection_with_upgrades(TokioIo::new(io), svc).await {
        debug!(peer = %remote, "connection error: {e}");
    }
}

async fn drain(tasks: &mut JoinSet<()>, config: &ServerConfig) {
    let all = async { while tasks.join_next().await.is_some() {} };
    match config.shutdown_timeout() {
        Some(limit) => {
            if tokio::time::timeout(limit, all).await.is_err() {
                warn!(remaining = tasks.len(), "shutdown deadline reached, aborting connections");
                tasks.abort_all();
            }
        }
        None => all.await,
    }
}

/// Resolves on the first SIGTERM or SIGINT. If a handler cannot be
/// installed that signal is logged and ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
