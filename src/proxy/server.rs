//! Accept loop feeding the supervisor.
//!
//! # Responsibilities
//! - Accept connections from the bounded listener until shutdown
//! - Spawn one task per connection, holding its permit and tracker guard
//! - Drain open tunnels for a grace period on shutdown

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{ConnectionIds, ConnectionTracker};
use crate::net::listener::{AcceptedClient, Listener};
use crate::proxy::establish::{Connector, TcpConnector};
use crate::proxy::supervisor::Supervisor;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) can't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// CONNECT proxy server.
pub struct ProxyServer<K = TcpConnector> {
    supervisor: Arc<Supervisor<K>>,
    tracker: ConnectionTracker,
    shutdown_grace: Duration,
}

impl ProxyServer<TcpConnector> {
    /// Create a server that dials destinations over TCP.
    pub fn new(config: &ProxyConfig) -> Self {
        Self::with_supervisor(config, Supervisor::from_config(config, ConnectionIds::new()))
    }
}

impl<K: Connector> ProxyServer<K> {
    pub fn with_supervisor(config: &ProxyConfig, supervisor: Supervisor<K>) -> Self {
        Self {
            supervisor: Arc::new(supervisor),
            tracker: ConnectionTracker::new(),
            shutdown_grace: config.timeouts.shutdown_grace(),
        }
    }

    /// Run the server until `shutdown` fires, then drain.
    ///
    /// Accept failures and per-connection failures never end this loop.
    pub async fn run(self, listener: Listener, mut shutdown: ShutdownSignal) {
        tracing::info!(
            address = ?listener.local_addr().ok(),
            max_connections = listener.max_connections(),
            "CONNECT proxy accepting connections"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let AcceptedClient { stream, peer, permit } = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let supervisor = Arc::clone(&self.supervisor);
                    let guard = self.tracker.track();
                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            let _guard = guard;
                            // Already logged by the supervisor.
                            let _ = supervisor.handle(stream).await;
                        }
                        .instrument(tracing::info_span!("client", peer = %peer)),
                    );
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);

        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active, grace = ?self.shutdown_grace, "Waiting for open tunnels to finish");
            if !self.tracker.wait_for_drain(self.shutdown_grace).await {
                tracing::warn!(
                    remaining = self.tracker.active_count(),
                    "Grace period elapsed with tunnels still open"
                );
            }
        }

        tracing::info!("CONNECT proxy stopped");
    }
}
