//! CONNECT request parsing.
//!
//! # Responsibilities
//! - Read the client's request head within a fixed byte budget
//! - Validate method, authority and port
//! - Hand back the destination plus any bytes read past the head
//!
//! Only the request line is inspected. Headers are skipped: `Host`
//! duplicates the authority and CONNECT clients are not required to send it.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::TunnelConfig;
use crate::proxy::error::ParseError;

/// Upper bound on a single read while collecting the request head.
const READ_CHUNK: usize = 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Destination named by a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Host name or IP literal. IPv6 literals are stored without brackets.
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub target: ConnectTarget,
    /// Bytes the client sent after the blank line that arrived with the head.
    /// They belong to the tunnel and must reach the destination first.
    pub early_data: Vec<u8>,
}

/// Read and validate a CONNECT request from `stream`.
///
/// Reads at most `config.max_request_bytes` bytes. Never connects anywhere.
pub async fn read_connect_request<S>(
    stream: &mut S,
    config: &TunnelConfig,
) -> Result<ConnectRequest, ParseError>
where
    S: AsyncRead + Unpin,
{
    let limit = config.max_request_bytes;
    let mut head = Vec::with_capacity(limit.min(READ_CHUNK));
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let remaining = limit.saturating_sub(head.len());
        if remaining == 0 {
            return Err(ParseError::TooLarge { limit });
        }

        let n = stream.read(&mut chunk[..remaining.min(READ_CHUNK)]).await?;
        if n == 0 {
            return Err(ParseError::Truncated {
                received: head.len(),
            });
        }
        tracing::trace!(bytes = n, total = head.len() + n, "Read request bytes");

        // The terminator may straddle the previous read.
        let search_from = head.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        head.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find(&head[search_from..], HEAD_TERMINATOR) {
            let end = search_from + pos + HEAD_TERMINATOR.len();
            let early_data = head.split_off(end);
            let target = parse_head(&head, config)?;
            return Ok(ConnectRequest { target, early_data });
        }
    }
}

/// Validate a complete request head (terminator included).
pub fn parse_head(head: &[u8], config: &TunnelConfig) -> Result<ConnectTarget, ParseError> {
    let line_end = find(head, b"\r\n").unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end]).map_err(|_| {
        ParseError::MalformedRequestLine(String::from_utf8_lossy(&head[..line_end]).into_owned())
    })?;

    let mut tokens = line.split_ascii_whitespace();
    let (method, authority) = match (tokens.next(), tokens.next()) {
        (Some(method), Some(authority)) => (method, authority),
        _ => return Err(ParseError::MalformedRequestLine(line.to_string())),
    };

    if method != "CONNECT" {
        return Err(ParseError::UnsupportedMethod(method.to_string()));
    }

    let target = parse_authority(authority)?;
    if !config.is_port_allowed(target.port) {
        return Err(ParseError::ForbiddenPort(target.port));
    }
    Ok(target)
}

/// Split `host:port` at its last colon.
///
/// A host containing a colon must be a bracketed IPv6 literal.
pub fn parse_authority(authority: &str) -> Result<ConnectTarget, ParseError> {
    let malformed = || ParseError::MalformedAuthority(authority.to_string());

    let (host, port) = authority.rsplit_once(':').ok_or_else(malformed)?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(malformed)?,
        None if host.contains(':') || host.contains(']') => return Err(malformed()),
        None => host,
    };
    if host.is_empty() || port.is_empty() {
        return Err(malformed());
    }

    if !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::MalformedPort(authority.to_string()));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ParseError::MalformedPort(authority.to_string()))?;

    Ok(ConnectTarget {
        host: host.to_string(),
        port,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
