//! Bidirectional stream relay

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on shutting down both sides once a session ends
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    /// From the first stream to the second
    AToB,
    /// From the second stream to the first
    BToA,
}

impl fmt::Display for RelayDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayDirection::AToB => write!(f, "a->b"),
            RelayDirection::BToA => write!(f, "b->a"),
        }
    }
}

/// Byte counts and lifetime of a finished relay session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Includes the replayed prefix
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay I/O error ({direction}): {source}")]
    Io {
        direction: RelayDirection,
        source: io::Error,
        stats: RelayStats,
    },
}

impl RelayError {
    /// Counters up to the failure
    pub fn stats(&self) -> RelayStats {
        match self {
            RelayError::Io { stats, .. } => *stats,
        }
    }
}

/// Relay bytes between `a` and `b` until either side finishes
///
/// `prefix_for_b` is written to `b` before anything else. Both streams are
/// shut down and dropped when the first direction reaches end-of-stream or
/// fails; the other direction is abandoned at that point.
pub async fn relay<A, B>(a: A, b: B, prefix_for_b: Bytes) -> Result<RelayStats, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b: u64 = 0;
    let mut b_to_a: u64 = 0;

    let mut outcome = Ok(());
    if !prefix_for_b.is_empty() {
        outcome = write_chunk(&mut b_write, &prefix_for_b)
            .await
            .map_err(|e| (RelayDirection::AToB, e));
        if outcome.is_ok() {
            a_to_b = prefix_for_b.len() as u64;
        }
    }

    if outcome.is_ok() {
        let forward = copy_half(&mut a_read, &mut b_write, &mut a_to_b);
        let backward = copy_half(&mut b_read, &mut a_write, &mut b_to_a);

        outcome = tokio::select! {
            result = forward => {
                debug!("Relay a->b finished first");
                result.map_err(|e| (RelayDirection::AToB, e))
            }
            result = backward => {
                debug!("Relay b->a finished first");
                result.map_err(|e| (RelayDirection::BToA, e))
            }
        };
    }

    // Errors here just mean the peer is already gone. Both halves are dropped
    // when this returns, whether or not the shutdowns completed.
    let shutdown = async { tokio::join!(a_write.shutdown(), b_write.shutdown()) };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        debug!("Relay shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
    }

    let stats = RelayStats {
        bytes_a_to_b: a_to_b,
        bytes_b_to_a: b_to_a,
        duration: started.elapsed(),
    };

    match outcome {
        Ok(()) => Ok(stats),
        Err((direction, source)) => Err(RelayError::Io {
            direction,
            source,
            stats,
        }),
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, counter: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        write_chunk(writer, &buf[..n]).await?;
        *counter += n as u64;
    }
}

async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}
