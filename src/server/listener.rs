use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::ConnectionError;
use crate::gateway::ConnectionInfo;
use crate::http::connection::{Connection, ConnectionContext};
use crate::server::tls;

/// Pause after a failed accept (descriptor exhaustion and the like).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts on one bound socket until the server starts draining.
///
/// A permit from the shared connection limit is taken *before* `accept()`,
/// so once `max_connections` are open further clients wait in the kernel
/// backlog instead of being spawned.
pub struct Acceptor {
    pub listener: TcpListener,
    pub ctx: Arc<ConnectionContext>,
    pub tls: Option<TlsAcceptor>,
    pub handshake_timeout: Duration,
    pub limit: Arc<Semaphore>,
    pub tracker: TaskTracker,
    /// Cancelled when the drain grace period runs out.
    pub force: CancellationToken,
}

impl Acceptor {
    pub async fn run(self) {
        let addr = match self.listener.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unknown>".to_string(),
        };
        info!("Listening on {}", addr);

        loop {
            let permit = tokio::select! {
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.ctx.shutdown.cancelled() => break,
            };

            let (socket, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept error on {}: {}", addr, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = self.ctx.shutdown.cancelled() => break,
            };
            debug!("Accepted connection from {}", peer);

            let ctx = self.ctx.clone();
            let tls = self.tls.clone().map(|acceptor| (acceptor, self.handshake_timeout));
            let force = self.force.clone();
            self.tracker.spawn(
                async move {
                    let _permit = permit;
                    tokio::select! {
                        _ = serve(socket, peer, ctx, tls) => {}
                        _ = force.cancelled() => {
                            debug!("Force-closing connection from {}", peer);
                        }
                    }
                }
                .instrument(info_span!("conn", %peer)),
            );
        }

        info!("Stopped accepting on {}", addr);
    }
}

async fn serve(
    socket: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
    tls: Option<(TlsAcceptor, Duration)>,
) {
    let _ = socket.set_nodelay(true);
    let mut info = ConnectionInfo {
        client: Some(peer),
        server: socket.local_addr().ok(),
        tls: None,
    };

    let result = match tls {
        None => Connection::new(socket, ctx, info).run().await,
        Some((acceptor, limit)) => {
            match tokio::time::timeout(limit, acceptor.accept(socket)).await {
                Ok(Ok(stream)) => {
                    info.tls = Some(tls::connection_info(stream.get_ref().1));
                    Connection::new(stream, ctx, info).run().await
                }
                Ok(Err(e)) => {
                    warn!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
                Err(_) => {
                    warn!("TLS handshake with {} timed out after {:?}", peer, limit);
                    return;
                }
            }
        }
    };

    match result {
        Ok(()) => debug!("Connection from {} closed", peer),
        Err(ConnectionError::PeerClosed) | Err(ConnectionError::IdleTimeout(_)) => {
            debug!("Connection from {} ended early", peer)
        }
        Err(e) => error!("Connection error from {}: {}", peer, e),
    }
}
