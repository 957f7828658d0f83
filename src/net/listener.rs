//! Client-facing TCP listener.
//!
//! # Responsibilities
//! - Bind the proxy port
//! - Hand out accepted clients, each holding one of `max_connections` slots
//!
//! A slot is taken before `accept`, so once the proxy is full new clients
//! queue in the kernel backlog instead of being accepted and starved.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind proxy port: {0}")]
    Bind(io::Error),
    /// Per-accept failure; the listener stays usable.
    #[error("Failed to accept client: {0}")]
    Accept(io::Error),
}

/// A client connection together with the slot it occupies.
#[derive(Debug)]
pub struct AcceptedClient {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub permit: ConnectionPermit,
}

/// Listener that admits at most `max_connections` clients at a time.
pub struct Listener {
    socket: TcpListener,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ListenerError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let socket = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let bound = socket.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(
            address = %bound,
            max_connections = config.max_connections,
            "Proxy port bound"
        );

        Ok(Self {
            socket,
            slots: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Wait for a free slot, then for the next client.
    ///
    /// The returned permit must live as long as the client's task.
    pub async fn accept(&self) -> Result<AcceptedClient, ListenerError> {
        // `slots` is never closed, so acquiring only ever waits.
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|e| ListenerError::Accept(io::Error::other(e)))?;

        let (stream, peer) = self.socket.accept().await.map_err(ListenerError::Accept)?;
        tracing::debug!(
            peer = %peer,
            free_slots = self.slots.available_permits(),
            "Client accepted"
        );

        Ok(AcceptedClient {
            stream,
            peer,
            permit: ConnectionPermit { _slot: slot },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Slots not currently held by a client.
    pub fn available_permits(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// One occupied client slot. Dropping it frees the slot, including when the
/// owning task panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _slot: OwnedSemaphorePermit,
}
