//! The serving task behind a running callback server.
//!
//! The task binds the socket, reports the outcome through a one-shot start
//! rendezvous, and then accepts connections until it is told to drain. Each
//! connection runs in a [`JoinSet`] owned by the accept loop, so aborting the
//! serving task drops the set and tears every connection down with it.

use async_trait::async_trait;
use hyper::server::conn::Http;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{ServerError, ShutdownError};
use crate::http::{routes, FrontDoor};
use crate::shutdown::GracefulClose;

/// Result of the start rendezvous: the bound address or why binding failed.
pub(crate) type Ready = std::result::Result<SocketAddr, ServerError>;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind `addr` and serve `front_door` on `path` until `drain_rx` fires.
///
/// The bind outcome is reported on `ready_tx` before any connection is
/// accepted. If nobody is waiting for it any more (the starter timed out) the
/// freshly bound socket is closed again instead of serving.
pub(crate) async fn serve(
    addr: SocketAddr,
    front_door: Arc<FrontDoor>,
    path: Arc<str>,
    drain_rx: watch::Receiver<bool>,
    ready_tx: oneshot::Sender<Ready>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(source) => {
            let _ = ready_tx.send(Err(ServerError::Bind { addr, source }));
            return;
        }
    };

    let local_addr = match listener.local_addr() {
        Ok(local_addr) => local_addr,
        Err(source) => {
            let _ = ready_tx.send(Err(ServerError::Bind { addr, source }));
            return;
        }
    };

    if ready_tx.send(Ok(local_addr)).is_err() {
        tracing::warn!(%local_addr, "Startup was abandoned; closing listener");
        return;
    }

    accept_loop(listener, front_door, path, drain_rx).await;
}

async fn accept_loop(
    listener: TcpListener,
    front_door: Arc<FrontDoor>,
    path: Arc<str>,
    mut drain_rx: watch::Receiver<bool>,
) {
    let service = warp::service(routes(front_door, path));
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = drain_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "Accepted connection");
                    let service = service.clone();
                    let mut drain_rx = drain_rx.clone();

                    connections.spawn(async move {
                        let conn = Http::new().serve_connection(stream, service);
                        tokio::pin!(conn);

                        tokio::select! {
                            result = conn.as_mut() => {
                                if let Err(e) = result {
                                    tracing::debug!(%peer, error = %e, "Connection ended with error");
                                }
                            }
                            _ = drain_rx.changed() => {
                                conn.as_mut().graceful_shutdown();
                                if let Err(e) = conn.await {
                                    tracing::debug!(%peer, error = %e, "Connection ended with error while draining");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    tracing::debug!(in_flight = connections.len(), "Listener closed; draining connections");
    while connections.join_next().await.is_some() {}
}

/// Handle to a running serving task, owned by the lifecycle controller.
pub(crate) struct Listener {
    local_addr: SocketAddr,
    drain_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn new(
        local_addr: SocketAddr,
        drain_tx: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            local_addr,
            drain_tx,
            task: Some(task),
        }
    }

    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl GracefulClose for Listener {
    async fn drain(&mut self) {
        tracing::debug!(local_addr = %self.local_addr, "Draining listener");
        let _ = self.drain_tx.send(true);

        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Serving task failed while draining");
            }
            self.task = None;
        }
    }

    async fn force_close(&mut self) -> Result<(), ShutdownError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        tracing::debug!(local_addr = %self.local_addr, "Aborting listener and open connections");
        task.abort();
        match task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ShutdownError::ForcedClose(e.to_string())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
