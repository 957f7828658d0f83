//! Bidirectional byte relay.
//!
//! # Responsibilities
//! - Copy client → destination and destination → client concurrently
//! - Stop both directions as soon as either one ends or fails
//! - Return only once neither direction can touch the streams again
//!
//! # Design Decisions
//! - Both copy loops are futures polled by one `select!`; the loser is
//!   dropped at its current suspension point, which is its cancellation
//! - The streams are borrowed, never closed here; the supervisor owns them
//! - One `chunk_size` buffer per direction, nothing buffered beyond that

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::Instrument;

use crate::observability::metrics;
use crate::proxy::error::{Direction, RelayError};

/// What a finished relay did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub client_to_dest: u64,
    pub dest_to_client: u64,
    /// The direction whose end tore the tunnel down.
    pub finished: Direction,
}

/// Relay bytes between `client` and `dest` until one direction ends.
///
/// A clean end-of-stream in either direction finishes the relay with
/// `Ok`. A read or write error in either direction finishes it with `Err`.
/// In both cases the other direction is cancelled before this returns.
pub async fn relay<C, D>(
    client: &mut C,
    dest: &mut D,
    chunk_size: usize,
) -> Result<RelaySummary, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut dest_rd, mut dest_wr) = tokio::io::split(dest);

    let mut client_to_dest = 0u64;
    let mut dest_to_client = 0u64;

    let upstream_span = tracing::info_span!("pipe", direction = %Direction::ClientToDest);
    let downstream_span = tracing::info_span!("pipe", direction = %Direction::DestToClient);

    let (finished, result) = {
        let upstream = pipe(
            &mut client_rd,
            &mut dest_wr,
            chunk_size,
            Direction::ClientToDest,
            &mut client_to_dest,
        )
        .instrument(upstream_span.clone());

        let downstream = pipe(
            &mut dest_rd,
            &mut client_wr,
            chunk_size,
            Direction::DestToClient,
            &mut dest_to_client,
        )
        .instrument(downstream_span.clone());

        tokio::select! {
            result = upstream => (Direction::ClientToDest, result),
            result = downstream => (Direction::DestToClient, result),
        }
    };

    let (finished_span, cancelled_span, finished_bytes, cancelled_bytes) = match finished {
        Direction::ClientToDest => (&upstream_span, &downstream_span, client_to_dest, dest_to_client),
        Direction::DestToClient => (&downstream_span, &upstream_span, dest_to_client, client_to_dest),
    };
    finished_span.in_scope(|| match &result {
        Ok(()) => tracing::debug!(outcome = "eof", bytes = finished_bytes, "Pipe finished"),
        Err(e) => tracing::debug!(
            outcome = "error",
            bytes = finished_bytes,
            error = %e.source,
            "Pipe finished"
        ),
    });
    cancelled_span.in_scope(|| {
        tracing::debug!(outcome = "cancelled", bytes = cancelled_bytes, "Pipe finished")
    });

    result.map(|()| RelaySummary {
        client_to_dest,
        dest_to_client,
        finished,
    })
}

/// One direction: read a chunk, write it verbatim, repeat until EOF.
async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    direction: Direction,
    forwarded: &mut u64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let fail = |source| RelayError { direction, source };
    let mut buf = vec![0u8; chunk_size];

    loop {
        let n = reader.read(&mut buf).await.map_err(fail)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(fail)?;
        writer.flush().await.map_err(fail)?;

        *forwarded += n as u64;
        metrics::record_forwarded(direction, n);
        tracing::trace!(bytes = n, "Forwarded bytes");
    }

    Ok(())
}
