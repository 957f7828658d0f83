//! Error taxonomy for a single tunnel.
//!
//! Every error here ends one connection and nothing more. The supervisor
//! catches all of them, logs them and tears the connection down.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// One of the two independent copy loops of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToDest,
    DestToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToDest => "client_to_dest",
            Direction::DestToClient => "dest_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which step of the connection lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Parse,
    Establish,
    Relay,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Parse => "parse",
            Phase::Establish => "establish",
            Phase::Relay => "relay",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The client's CONNECT request could not be accepted.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("request exceeded {limit} bytes without a terminating blank line")]
    TooLarge { limit: usize },

    #[error("client closed the connection after {received} bytes, before the request was complete")]
    Truncated { received: usize },

    #[error("malformed request line {0:?}")]
    MalformedRequestLine(String),

    #[error("unsupported method {0:?}, only CONNECT is accepted")]
    UnsupportedMethod(String),

    #[error("malformed authority {0:?}, expected host:port")]
    MalformedAuthority(String),

    #[error("malformed port in authority {0:?}")]
    MalformedPort(String),

    #[error("destination port {0} is not allowed")]
    ForbiddenPort(u16),

    #[error("failed to read request")]
    Io(#[from] io::Error),
}

/// The destination could not be reached, or the client could not be told.
#[derive(Debug, Error)]
pub enum EstablishError {
    #[error("failed to connect to {host}:{port}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The configured connect deadline expired first.
    #[error("timed out after {timeout:?} connecting to {host}:{port}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("failed to send the tunnel-established response to the client")]
    Respond(#[source] io::Error),
}

/// A copy loop failed while the tunnel was up.
#[derive(Debug, Error)]
#[error("relay {direction} failed")]
pub struct RelayError {
    pub direction: Direction,
    #[source]
    pub source: io::Error,
}

/// Any failure that ends a tunnel, tagged by the phase it happened in.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("parse failed")]
    Parse(#[from] ParseError),

    #[error("establish failed")]
    Establish(#[from] EstablishError),

    #[error("relay failed")]
    Relay(#[from] RelayError),
}

impl TunnelError {
    pub fn phase(&self) -> Phase {
        match self {
            TunnelError::Parse(_) => Phase::Parse,
            TunnelError::Establish(_) => Phase::Establish,
            TunnelError::Relay(_) => Phase::Relay,
        }
    }
}

/// Render an error with its full `source()` chain, `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
