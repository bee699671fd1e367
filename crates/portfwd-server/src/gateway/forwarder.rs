//! Bidirectional byte relay between two open connections.
//!
//! Both directions are pumped concurrently in fixed-size chunks. The relay
//! ends as soon as either direction sees end-of-stream or an I/O error:
//! the other direction is cancelled at its pending read or write, both
//! write halves are shut down, and both streams are dropped. There is no
//! half-close support; one side closing tears the pair down.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Default chunk size for each relay direction.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// A relay direction, named from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("client->target"),
            Direction::TargetToClient => f.write_str("target->client"),
        }
    }
}

/// What ended a relay.
#[derive(Debug)]
pub enum RelayEnd {
    /// The reading side of this direction returned end-of-stream.
    Eof(Direction),
    /// A read or write in this direction failed.
    Error(Direction, io::Error),
}

impl RelayEnd {
    pub fn direction(&self) -> Direction {
        match self {
            RelayEnd::Eof(d) | RelayEnd::Error(d, _) => *d,
        }
    }
}

/// Byte counts and cause of termination for one relay.
#[derive(Debug)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub end: RelayEnd,
}

/// Relay bytes between `client` and `target` until either side closes.
///
/// Never returns an error: a failure in one direction is reported in
/// [`RelayStats::end`] and only ends this pair.
pub async fn relay<C, T>(client: C, target: T, chunk_size: usize) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut target_rd, mut target_wr) = tokio::io::split(target);

    let mut client_to_target = 0u64;
    let mut target_to_client = 0u64;

    let end = {
        let upstream = pump(
            &mut client_rd,
            &mut target_wr,
            &mut client_to_target,
            chunk_size,
        );
        let downstream = pump(
            &mut target_rd,
            &mut client_wr,
            &mut target_to_client,
            chunk_size,
        );

        tokio::select! {
            result = upstream => finish(Direction::ClientToTarget, result),
            result = downstream => finish(Direction::TargetToClient, result),
        }
    };

    debug!(ended_by = %end.direction(), "relay ending, closing both sides");

    // Best effort: the peer may already be gone.
    let _ = target_wr.shutdown().await;
    let _ = client_wr.shutdown().await;

    RelayStats {
        client_to_target,
        target_to_client,
        end,
    }
}

fn finish(direction: Direction, result: io::Result<()>) -> RelayEnd {
    match result {
        Ok(()) => RelayEnd::Eof(direction),
        Err(e) => RelayEnd::Error(direction, e),
    }
}

/// Copy one direction until EOF or error.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    copied: &mut u64,
    chunk_size: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
