//! TCP accept loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

use super::connection::{serve_connection, ConnectionOutcome, ConnectionSettings};
use crate::admission::{AdmissionHooks, RejectAction, RejectReason};
use crate::error::Result;

/// Why [`HttpServer::serve_with_shutdown`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The shutdown signal fired.
    Shutdown,
    /// A response was refused under [`RejectAction::ExitProcess`].
    Halted(RejectReason),
}

/// HTTP/1.x server that routes every request through admission hooks.
pub struct HttpServer {
    listener: TcpListener,
    hooks: Arc<dyn AdmissionHooks>,
    settings: Arc<ConnectionSettings>,
}

impl HttpServer {
    /// Bind the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        hooks: Arc<dyn AdmissionHooks>,
        settings: ConnectionSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hooks,
            settings: Arc::new(settings),
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `signal` resolves or a refusal halts the server.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<ServeOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        let (halt_tx, mut halt_rx) = mpsc::channel::<RejectReason>(1);
        tokio::pin!(signal);

        info!(
            addr = %self.listener.local_addr()?,
            on_reject = ?self.hooks.reject_action(),
            "Accepting connections"
        );

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received, no longer accepting connections");
                    return Ok(ServeOutcome::Shutdown);
                }
                Some(reason) = halt_rx.recv() => {
                    warn!(reason = %reason, "Response refused, halting server");
                    return Ok(ServeOutcome::Halted(reason));
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let hooks = Arc::clone(&self.hooks);
                    let settings = Arc::clone(&self.settings);
                    let halt_tx = halt_tx.clone();
                    let span = tracing::debug_span!("connection", peer = %peer);

                    tokio::spawn(
                        async move {
                            match serve_connection(stream, hooks.as_ref(), &settings).await {
                                Ok(ConnectionOutcome::Closed) => debug!("Connection closed"),
                                Ok(ConnectionOutcome::Rejected(reason)) => {
                                    debug!(reason = %reason, "Connection dropped without response");
                                    if hooks.reject_action() == RejectAction::ExitProcess {
                                        halt_tx.try_send(reason).ok();
                                    }
                                }
                                Err(e) => debug!(error = %e, "Connection error"),
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }
    }
}
