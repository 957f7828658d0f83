//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::time::Duration;

use connect_proxy::config::ProxyConfig;
use connect_proxy::net::Listener;
use connect_proxy::proxy::CONNECTION_ESTABLISHED;
use connect_proxy::{ProxyServer, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Proxy config bound to an ephemeral loopback port.
pub fn proxy_config(allowed_ports: Vec<u16>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.tunnel.allowed_ports = allowed_ports;
    config.timeouts.shutdown_grace_secs = 1;
    config
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<()>,
}

/// Start the proxy in the background.
pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = ProxyServer::new(&config);
    let server_shutdown = shutdown.subscribe();

    let task = tokio::spawn(async move { server.run(listener, server_shutdown).await });

    RunningProxy {
        addr,
        shutdown,
        task,
    }
}

/// Destination that echoes every byte back until the client closes.
#[allow(dead_code)]
pub async fn start_echo_destination() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    addr
}

/// Destination that reads `expect` bytes, answers with `reply` and hangs up.
///
/// The handle yields the bytes it received.
#[allow(dead_code)]
pub async fn start_scripted_destination(
    expect: usize,
    reply: &'static [u8],
) -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = vec![0u8; expect];
        socket.read_exact(&mut received).await.unwrap();
        socket.write_all(reply).await.unwrap();
        socket.shutdown().await.unwrap();
        received
    });

    (addr, handle)
}

/// Listener that records whether anything ever connected to it.
#[allow(dead_code)]
pub async fn start_untouched_destination() -> (SocketAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    (listener.local_addr().unwrap(), listener)
}

/// Assert nobody connects to `listener` within a short window.
#[allow(dead_code)]
pub async fn assert_no_connection(listener: &TcpListener) {
    let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err(), "proxy connected to the destination");
}

/// Send a CONNECT request and expect the tunnel to come up.
#[allow(dead_code)]
pub async fn open_tunnel(proxy: SocketAddr, authority: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reply = vec![0u8; CONNECTION_ESTABLISHED.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, CONNECTION_ESTABLISHED);
    stream
}

/// Read until the proxy closes the connection, with a deadline.
#[allow(dead_code)]
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut received))
        .await
        .expect("proxy kept the connection open")
        .unwrap();
    received
}
