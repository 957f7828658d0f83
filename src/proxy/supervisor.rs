//! Per-connection supervision.
//!
//! # Responsibilities
//! - Assign each client connection its ID and tracing span
//! - Drive parse → establish → relay, stopping at the first failure
//! - Close the client stream, and the destination stream if one was
//!   opened, exactly once on every exit path
//! - Log and count failures; never let one connection affect another
//!
//! # Design Decisions
//! - Streams are owned here and only borrowed by the parser and relay
//! - Per-connection context lives in the `conn` span, not in globals

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::Instrument;

use crate::config::{ProxyConfig, TunnelConfig};
use crate::net::connection::ConnectionIds;
use crate::observability::metrics;
use crate::proxy::error::{error_chain, Direction, RelayError, TunnelError};
use crate::proxy::establish::{close, establish, Connector, TcpConnector};
use crate::proxy::relay::{relay, RelaySummary};
use crate::proxy::request::{read_connect_request, ConnectRequest, ConnectTarget};

/// Result of a tunnel that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSummary {
    pub target: ConnectTarget,
    /// Includes any bytes that arrived together with the request head.
    pub client_to_dest: u64,
    pub dest_to_client: u64,
    /// The direction whose end tore the tunnel down.
    pub finished: Direction,
}

/// Runs the CONNECT lifecycle for each accepted client connection.
pub struct Supervisor<K = TcpConnector> {
    config: Arc<TunnelConfig>,
    connector: K,
    ids: ConnectionIds,
}

impl Supervisor<TcpConnector> {
    /// Supervisor dialing destinations over plain TCP.
    pub fn from_config(config: &ProxyConfig, ids: ConnectionIds) -> Self {
        Self::new(
            config.tunnel.clone(),
            TcpConnector::new(config.timeouts.connect_timeout()),
            ids,
        )
    }
}

impl<K: Connector> Supervisor<K> {
    pub fn new(config: TunnelConfig, connector: K, ids: ConnectionIds) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            ids,
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Serve one client connection from request to teardown.
    ///
    /// Every failure has already been logged and counted when this returns;
    /// the `Result` is informational and callers are free to drop it.
    pub async fn handle<S>(&self, client: S) -> Result<TunnelSummary, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.ids.next_id();
        let span = tracing::info_span!("conn", id = %id, dest = tracing::field::Empty);
        self.supervise(client).instrument(span).await
    }

    async fn supervise<S>(&self, mut client: S) -> Result<TunnelSummary, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::debug!("Reading CONNECT request");

        let result = self.tunnel(&mut client).await;

        close(&mut client).await;
        drop(client);

        match &result {
            Ok(summary) => tracing::info!(
                client_to_dest = summary.client_to_dest,
                dest_to_client = summary.dest_to_client,
                finished = %summary.finished,
                "Tunnel closed"
            ),
            Err(e) => {
                metrics::record_failure(e.phase());
                tracing::warn!(phase = %e.phase(), error = %error_chain(e), "Connection failed");
            }
        }
        result
    }

    async fn tunnel<S>(&self, client: &mut S) -> Result<TunnelSummary, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ConnectRequest { target, early_data } =
            read_connect_request(client, &self.config).await?;

        tracing::Span::current().record("dest", tracing::field::display(&target));
        tracing::info!(host = %target.host, port = target.port, "Got CONNECT request, connecting");

        let mut dest = establish(client, &self.connector, &target).await?;
        metrics::record_tunnel_established();

        let relayed = self.forward(client, &mut dest, &early_data).await;
        close(&mut dest).await;
        let relayed = relayed?;

        Ok(TunnelSummary {
            target,
            client_to_dest: relayed.client_to_dest,
            dest_to_client: relayed.dest_to_client,
            finished: relayed.finished,
        })
    }

    /// Deliver bytes that came with the request head, then relay.
    async fn forward<S>(
        &self,
        client: &mut S,
        dest: &mut K::Stream,
        early_data: &[u8],
    ) -> Result<RelaySummary, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !early_data.is_empty() {
            let fail = |source| RelayError {
                direction: Direction::ClientToDest,
                source,
            };
            dest.write_all(early_data).await.map_err(fail)?;
            dest.flush().await.map_err(fail)?;
            metrics::record_forwarded(Direction::ClientToDest, early_data.len());
            tracing::debug!(bytes = early_data.len(), "Forwarded bytes received with the request");
        }

        let mut summary = relay(client, dest, self.config.chunk_size).await?;
        summary.client_to_dest += early_data.len() as u64;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::error::{EstablishError, ParseError};
    use crate::proxy::establish::CONNECTION_ESTABLISHED;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream, ReadBuf};
    use tokio::sync::mpsc;

    /// Stream wrapper counting how many times it was shut down.
    struct Tracked<S> {
        inner: S,
        shutdowns: Arc<AtomicUsize>,
    }

    impl<S> Tracked<S> {
        fn new(inner: S, shutdowns: Arc<AtomicUsize>) -> Self {
            Self { inner, shutdowns }
        }
    }

    impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Hands out in-memory destinations, or refuses every connection.
    struct MockConnector {
        attempts: Mutex<Vec<(String, u16)>>,
        dests: Option<mpsc::UnboundedSender<DuplexStream>>,
        dest_shutdowns: Arc<AtomicUsize>,
    }

    impl MockConnector {
        fn accepting() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Self {
                attempts: Mutex::new(Vec::new()),
                dests: Some(tx),
                dest_shutdowns: Arc::new(AtomicUsize::new(0)),
            };
            (connector, rx)
        }

        fn refusing() -> Self {
            Self {
                attempts: Mutex::new(Vec::new()),
                dests: None,
                dest_shutdowns: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn attempts(&self) -> Vec<(String, u16)> {
            self.attempts.lock().unwrap().clone()
        }

        fn dest_shutdowns(&self) -> usize {
            self.dest_shutdowns.load(Ordering::SeqCst)
        }
    }

    impl Connector for MockConnector {
        type Stream = Tracked<DuplexStream>;

        async fn connect(&self, host: &str, port: u16) -> io::Result<Self::Stream> {
            self.attempts.lock().unwrap().push((host.to_string(), port));
            let Some(dests) = &self.dests else {
                return Err(io::ErrorKind::ConnectionRefused.into());
            };
            let (near, far) = duplex(1024);
            dests
                .send(far)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "test dropped receiver"))?;
            Ok(Tracked::new(near, Arc::clone(&self.dest_shutdowns)))
        }
    }

    struct Client {
        far: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Client {
        fn shutdowns(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }

        async fn read_to_end(&mut self) -> Vec<u8> {
            let mut received = Vec::new();
            self.far.read_to_end(&mut received).await.unwrap();
            received
        }
    }

    fn spawn_connection<K: Connector>(
        supervisor: &Arc<Supervisor<K>>,
    ) -> (Client, tokio::task::JoinHandle<Result<TunnelSummary, TunnelError>>) {
        let (far, near) = duplex(1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let stream = Tracked::new(near, Arc::clone(&shutdowns));
        let supervisor = Arc::clone(supervisor);
        let task = tokio::spawn(async move { supervisor.handle(stream).await });
        (Client { far, shutdowns }, task)
    }

    fn supervisor<K: Connector>(connector: K) -> Arc<Supervisor<K>> {
        Arc::new(Supervisor::new(
            TunnelConfig::default(),
            connector,
            ConnectionIds::new(),
        ))
    }

    async fn finish(
        task: tokio::task::JoinHandle<Result<TunnelSummary, TunnelError>>,
    ) -> Result<TunnelSummary, TunnelError> {
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("connection was not torn down")
            .unwrap()
    }

    #[tokio::test]
    async fn relays_payloads_through_established_tunnel() {
        let (connector, mut dests) = MockConnector::accepting();
        let supervisor = supervisor(connector);
        let (mut client, task) = spawn_connection(&supervisor);

        client
            .far
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.far.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 200 Connection established\r\n\r\n");

        let mut dest = dests.recv().await.unwrap();

        client.far.write_all(b"hello").await.unwrap();
        let mut upload = [0u8; 5];
        dest.read_exact(&mut upload).await.unwrap();
        assert_eq!(&upload, b"hello");

        dest.write_all(b"0123456789").await.unwrap();
        let mut download = [0u8; 10];
        client.far.read_exact(&mut download).await.unwrap();
        assert_eq!(&download, b"0123456789");

        drop(dest);
        let summary = finish(task).await.unwrap();

        assert_eq!(
            summary,
            TunnelSummary {
                target: ConnectTarget {
                    host: "example.com".into(),
                    port: 443
                },
                client_to_dest: 5,
                dest_to_client: 10,
                finished: Direction::DestToClient,
            }
        );
        assert_eq!(
            supervisor.connector().attempts(),
            vec![("example.com".to_string(), 443)]
        );
        assert_eq!(client.shutdowns(), 1);
        assert_eq!(supervisor.connector().dest_shutdowns(), 1);
        assert!(client.read_to_end().await.is_empty());
    }

    #[tokio::test]
    async fn other_methods_close_without_connecting() {
        let (connector, _dests) = MockConnector::accepting();
        let supervisor = supervisor(connector);
        let (mut client, task) = spawn_connection(&supervisor);

        client.far.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let err = finish(task).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Parse(ParseError::UnsupportedMethod(ref m)) if m == "GET"
        ));
        assert!(supervisor.connector().attempts().is_empty());
        assert_eq!(client.shutdowns(), 1);
        assert!(client.read_to_end().await.is_empty(), "no error payload is sent");
    }

    #[tokio::test]
    async fn forbidden_port_closes_without_connecting() {
        let (connector, _dests) = MockConnector::accepting();
        let supervisor = supervisor(connector);
        let (mut client, task) = spawn_connection(&supervisor);

        client
            .far
            .write_all(b"CONNECT example.com:80 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let err = finish(task).await.unwrap_err();
        assert!(matches!(err, TunnelError::Parse(ParseError::ForbiddenPort(80))));
        assert!(supervisor.connector().attempts().is_empty());
        assert_eq!(client.shutdowns(), 1);
        assert!(client.read_to_end().await.is_empty());
    }

    #[tokio::test]
    async fn refused_destination_closes_client_silently() {
        let supervisor = supervisor(MockConnector::refusing());
        let (mut client, task) = spawn_connection(&supervisor);

        client
            .far
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let err = finish(task).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Establish(EstablishError::Connect { port: 443, .. })
        ));
        assert_eq!(supervisor.connector().attempts().len(), 1);
        assert_eq!(client.shutdowns(), 1);
        assert_eq!(supervisor.connector().dest_shutdowns(), 0);
        assert!(client.read_to_end().await.is_empty());
    }

    #[tokio::test]
    async fn vanished_client_still_closes_destination_once() {
        let (connector, mut dests) = MockConnector::accepting();
        let supervisor = supervisor(connector);
        let (client, task) = spawn_connection(&supervisor);
        let Client { mut far, shutdowns } = client;

        // The request is buffered, then the client disappears before the reply.
        far.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        drop(far);

        let err = finish(task).await.unwrap_err();
        assert!(matches!(err, TunnelError::Establish(EstablishError::Respond(_))));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.connector().dest_shutdowns(), 1);

        let mut dest = dests.recv().await.unwrap();
        let mut buf = Vec::new();
        dest.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn bytes_sent_with_the_request_reach_destination_first() {
        let (connector, mut dests) = MockConnector::accepting();
        let supervisor = supervisor(connector);
        let (mut client, task) = spawn_connection(&supervisor);

        client
            .far
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\nearly")
            .await
            .unwrap();

        let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.far.read_exact(&mut reply).await.unwrap();

        let mut dest = dests.recv().await.unwrap();
        client.far.write_all(b"-late").await.unwrap();

        let mut received = [0u8; 10];
        dest.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"early-late");

        client.far.shutdown().await.unwrap();
        let summary = finish(task).await.unwrap();
        assert_eq!(summary.client_to_dest, 10);
        assert_eq!(summary.finished, Direction::ClientToDest);
        assert_eq!(supervisor.connector().dest_shutdowns(), 1);
    }

    #[tokio::test]
    async fn each_connection_gets_its_own_id() {
        let supervisor = supervisor(MockConnector::refusing());
        let first = supervisor.ids.next_id();
        let (mut client, task) = spawn_connection(&supervisor);
        client.far.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let _ = finish(task).await;
        let after = supervisor.ids.next_id();
        assert_eq!(after.as_u64(), first.as_u64() + 2);
    }
}
