//! Network interposition gateway.
//!
//! A protocol-unaware byte relay: one external endpoint, every accepted
//! stream forwarded verbatim to the configured upstream. It exists to prove
//! the client under test can route through an intermediary; it never looks
//! inside the traffic.
//!
//! Failures here are connectivity failures, kept apart from protocol-level
//! test failures so root cause stays identifiable.

use std::net::SocketAddr;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PipelineError;

/// A running relay. Shut down explicitly or on drop of the handle.
#[derive(Debug)]
pub struct InterpositionGateway {
    local_addr: SocketAddr,
    upstream: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl InterpositionGateway {
    /// Bind the external endpoint and start relaying to `upstream`.
    ///
    /// A bind failure is an infrastructure failure; no test has run yet.
    pub async fn bind(bind: SocketAddr, upstream: SocketAddr) -> Result<Self, PipelineError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| PipelineError::infra(format!("gateway bind {bind} failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PipelineError::infra(format!("gateway local_addr: {e}")))?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("gateway accept loop stopping");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "gateway accepted connection");
                                tokio::spawn(relay(stream, upstream));
                            }
                            Err(e) => {
                                warn!(error = %e, "gateway accept failed");
                            }
                        }
                    }
                }
            }
        });

        info!(%local_addr, %upstream, "interposition gateway up");
        Ok(Self {
            local_addr,
            upstream,
            shutdown,
            accept_task,
        })
    }

    /// The external endpoint clients connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The topology-side endpoint streams are forwarded to.
    #[must_use]
    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Stop accepting and tear the relay down. Idempotent.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
        info!("interposition gateway down");
    }
}

/// Pump one accepted stream to the upstream until either side closes.
async fn relay(mut downstream: TcpStream, upstream: SocketAddr) {
    let mut upstream_stream = match TcpStream::connect(upstream).await {
        Ok(s) => s,
        Err(e) => {
            // Upstream unreachable is a connectivity failure of this relay,
            // surfaced to the operator, not translated into test output.
            warn!(%upstream, error = %e, "gateway upstream connect failed");
            return;
        }
    };
    match copy_bidirectional(&mut downstream, &mut upstream_stream).await {
        Ok((up, down)) => debug!(bytes_up = up, bytes_down = down, "relay stream closed"),
        Err(e) => debug!(error = %e, "relay stream aborted"),
    }
}
