//! Tunnel establishment.
//!
//! # Responsibilities
//! - Open a single outbound connection to the requested destination
//! - Tell the client the tunnel is up
//! - Never leave a destination stream open when returning an error

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::proxy::error::EstablishError;
use crate::proxy::request::ConnectTarget;

/// Sent to the client once the destination connection is open.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Opens outbound streams to CONNECT destinations.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// One connection attempt to `host:port`. No retries.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Deadline `establish` puts on each `connect`. `None` waits for the OS.
    fn connect_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Plain TCP connector with an optional connect timeout.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        // Relay writes whole chunks; don't let Nagle hold the tail back.
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn connect_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Connect to `target` and acknowledge the tunnel on `client`.
///
/// The attempt is bounded by `connector.connect_timeout()` when set; only
/// that deadline produces `ConnectTimeout`.
///
/// On success the caller owns the returned destination stream. If the
/// acknowledgement cannot be written, the destination stream is shut down
/// here before the error is returned.
pub async fn establish<C, K>(
    client: &mut C,
    connector: &K,
    target: &ConnectTarget,
) -> Result<K::Stream, EstablishError>
where
    C: AsyncWrite + Unpin,
    K: Connector,
{
    let connect = connector.connect(&target.host, target.port);
    let connected = match connector.connect_timeout() {
        Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
            EstablishError::ConnectTimeout {
                host: target.host.clone(),
                port: target.port,
                timeout: limit,
            }
        })?,
        None => connect.await,
    };
    let mut dest = connected.map_err(|source| EstablishError::Connect {
        host: target.host.clone(),
        port: target.port,
        source,
    })?;

    tracing::debug!(host = %target.host, port = target.port, "Connected to destination");

    if let Err(e) = send_established(client).await {
        close(&mut dest).await;
        return Err(EstablishError::Respond(e));
    }

    tracing::info!("Sent \"200 Connection established\" to client, tunnel established");
    Ok(dest)
}

async fn send_established<C: AsyncWrite + Unpin>(client: &mut C) -> io::Result<()> {
    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await
}

/// Shut a stream down, ignoring errors from a peer that is already gone.
pub async fn close<S: AsyncWrite + Unpin>(stream: &mut S) {
    if let Err(e) = stream.shutdown().await {
        tracing::trace!(error = %e, "Shutdown of an already broken stream");
    }
}
