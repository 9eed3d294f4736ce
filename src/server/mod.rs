//! Binding, accepting and the process lifecycle around them.
//!
//! Order of events for one server run:
//!
//! ```text
//! lifespan.startup ─► bind ─► accept ... ─► signal ─► stop accepting
//!     ─► drain (shutdown_grace) ─► force-close ─► lifespan.shutdown
//! ```

pub mod listener;
pub mod tls;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::{Config, ServerConfig};
use crate::gateway::{Application, ExtensionRegistry, LifespanController, SharedApp, State};
use crate::http::connection::ConnectionContext;
use listener::Acceptor;

/// An application bound to a configuration, not yet listening.
pub struct Server {
    config: Config,
    app: SharedApp,
}

impl Server {
    pub fn new<A: Application>(config: Config, app: A) -> Self {
        Self::from_shared(config, Arc::new(app))
    }

    pub fn from_shared(config: Config, app: SharedApp) -> Self {
        Self { config, app }
    }

    /// Runs lifespan startup, binds every listen address and starts
    /// accepting. Any failure here is returned before a single connection
    /// is served.
    pub async fn start(self) -> anyhow::Result<RunningServer> {
        let Server { config, app } = self;
        config.validate()?;
        let extensions = ExtensionRegistry::from_config(&config.server)?;
        let state = State::new();

        let mut lifespan =
            LifespanController::new(app.clone(), config.lifespan.clone(), state.clone());
        lifespan.startup().await?;

        let (tls, listeners) = match prepare(&config) {
            Ok(ready) => ready,
            Err(e) => {
                if let Err(shutdown) = lifespan.shutdown().await {
                    warn!("{}", shutdown);
                }
                return Err(e);
            }
        };
        let local_addrs = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<Result<Vec<_>, _>>()?;

        let handshake_timeout = config
            .tls
            .as_ref()
            .map(|t| t.handshake_timeout())
            .unwrap_or_default();
        let grace = config.server.shutdown_grace();
        let limit = Arc::new(Semaphore::new(config.server.max_connections));
        let ctx = Arc::new(ConnectionContext {
            app,
            config: Arc::new(config.server),
            extensions,
            state,
            shutdown: CancellationToken::new(),
        });
        let tracker = TaskTracker::new();
        let force = CancellationToken::new();

        let acceptors = listeners
            .into_iter()
            .map(|listener| {
                let acceptor = Acceptor {
                    listener,
                    ctx: ctx.clone(),
                    tls: tls.clone(),
                    handshake_timeout,
                    limit: limit.clone(),
                    tracker: tracker.clone(),
                    force: force.clone(),
                };
                tokio::spawn(acceptor.run())
            })
            .collect();

        Ok(RunningServer {
            local_addrs,
            ctx,
            force,
            tracker,
            acceptors,
            lifespan,
            grace,
        })
    }

    /// The single entry point: serve until `signal` resolves, then shut
    /// down gracefully.
    pub async fn run_until<F>(self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let running = self.start().await?;
        signal.await;
        info!("Shutdown signal received");
        running.shutdown().await
    }
}

fn prepare(config: &Config) -> anyhow::Result<(Option<TlsAcceptor>, Vec<TcpListener>)> {
    let tls = config.tls.as_ref().map(tls::load_acceptor).transpose()?;
    let listeners = config
        .server
        .listen
        .iter()
        .map(|addr| bind(addr, &config.server))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok((tls, listeners))
}

fn bind(addr: &str, cfg: &ServerConfig) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", addr))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .with_context(|| format!("binding {}", addr))?;
    Ok(socket.listen(cfg.accept_backlog)?)
}

/// Handle to a started server.
pub struct RunningServer {
    local_addrs: Vec<SocketAddr>,
    ctx: Arc<ConnectionContext>,
    force: CancellationToken,
    tracker: TaskTracker,
    acceptors: Vec<JoinHandle<()>>,
    lifespan: LifespanController,
    grace: Duration,
}

impl RunningServer {
    /// Addresses actually bound, in `listen` order. Useful with port 0.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.first().copied()
    }

    /// State populated during lifespan startup.
    pub fn state(&self) -> &State {
        &self.ctx.state
    }

    pub fn open_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting, drains open connections for the grace period,
    /// force-closes the rest, then runs lifespan shutdown.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.ctx.shutdown.cancel();
        for acceptor in self.acceptors.drain(..) {
            let _ = acceptor.await;
        }

        self.tracker.close();
        info!("Draining {} open connections", self.tracker.len());
        if tokio::time::timeout(self.grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} connections still open after {:?}, closing them",
                self.tracker.len(),
                self.grace
            );
            self.force.cancel();
            self.tracker.wait().await;
        }

        self.lifespan.shutdown().await?;
        info!("Server stopped");
        Ok(())
    }
}
