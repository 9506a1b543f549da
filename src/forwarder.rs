//! One direction of a relayed session.
//!
//! A [`Forwarder`] reads a chunk from its source, passes it through the
//! [`Shaper`], writes whatever the shaper releases to its destination, and
//! repeats. The loop is strictly sequential, so chunks leave in the order they
//! were read unless the shaper drops or reorders them.
//!
//! A chunk still sleeping in random-delay mode when the other direction closes
//! is discarded: the forwarder stops at once with [`StreamEnd::PeerClosed`]
//! instead of finishing the delay and writing to a session that is going away.
//! Chunks held for reordering are still flushed.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::session::SessionLink;
use crate::shaper::{Shaped, Shaper};
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("CLIENT → SERVER"),
            Direction::ServerToClient => f.write_str("SERVER → CLIENT"),
        }
    }
}

/// Why a forwarder left its loop. None of these are failures of the proxy.
#[derive(Debug)]
pub enum StreamEnd {
    /// Source returned a zero-length read.
    Eof,
    /// The other direction of the session finished first.
    PeerClosed,
    Read(io::Error),
    Write(io::Error),
}

impl fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEnd::Eof => f.write_str("end of stream"),
            StreamEnd::PeerClosed => f.write_str("session closed by other direction"),
            StreamEnd::Read(e) => write!(f, "read error: {}", e),
            StreamEnd::Write(e) => write!(f, "write error: {}", e),
        }
    }
}

/// What one forwarder did over its lifetime.
#[derive(Debug)]
pub struct ForwardSummary {
    pub direction: Direction,
    pub chunks_read: u64,
    pub chunks_forwarded: u64,
    pub chunks_dropped: u64,
    pub chunks_flushed: u64,
    pub bytes_written: u64,
    pub end: StreamEnd,
}

pub struct Forwarder<R, W> {
    direction: Direction,
    source: R,
    destination: W,
    shaper: Shaper,
    stats: Stats,
}

impl<R, W> Forwarder<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(direction: Direction, source: R, destination: W, shaper: Shaper, stats: Stats) -> Self {
        Self {
            direction,
            source,
            destination,
            shaper,
            stats,
        }
    }

    /// Pumps chunks until the source ends, a write fails, or `link` reports
    /// that the sibling direction has closed.
    ///
    /// On the way out, chunks still held for reordering are written oldest
    /// first, the destination is shut down, and `link` is fired so the sibling
    /// stops too. Errors on that path are ignored.
    pub async fn run(mut self, mut link: SessionLink) -> ForwardSummary {
        let direction = self.direction;
        let mut buf = vec![0u8; self.shaper.config().chunk_size];
        let mut reorder = self.shaper.new_reorder_buffer();

        let mut chunks_read = 0u64;
        let mut chunks_forwarded = 0u64;
        let mut chunks_dropped = 0u64;
        let mut bytes_written = 0u64;

        let end = loop {
            let n = tokio::select! {
                _ = link.closed() => break StreamEnd::PeerClosed,
                res = self.source.read(&mut buf) => match res {
                    Ok(0) => break StreamEnd::Eof,
                    Ok(n) => n,
                    Err(e) => break StreamEnd::Read(e),
                },
            };
            chunks_read += 1;

            let shaped = tokio::select! {
                biased;
                shaped = self.shaper.shape(buf[..n].to_vec(), reorder.as_mut()) => shaped,
                _ = link.closed() => break StreamEnd::PeerClosed,
            };
            let (chunk, reordered) = match shaped {
                Shaped::Forward(chunk) => (chunk, false),
                Shaped::Reordered(chunk) => (chunk, true),
                Shaped::Hold => continue,
                Shaped::Drop => {
                    self.stats.chunk_dropped();
                    chunks_dropped += 1;
                    continue;
                }
            };
            if let Err(e) = self.destination.write_all(&chunk).await {
                break StreamEnd::Write(e);
            }
            if reordered {
                self.stats.chunk_reordered();
            }
            self.stats.chunk_forwarded(direction, chunk.len());
            chunks_forwarded += 1;
            bytes_written += chunk.len() as u64;
            debug!("{}: forwarded {} bytes", direction, chunk.len());
        };

        info!("{}: stopped ({})", direction, end);

        let mut chunks_flushed = 0u64;
        if let Some(buffer) = reorder.as_mut().filter(|b| !b.is_empty()) {
            info!("{}: flushing reorder buffer ({} chunks)", direction, buffer.len());
            for chunk in buffer.drain() {
                if self.destination.write_all(&chunk).await.is_ok() {
                    self.stats.chunk_flushed(direction, chunk.len());
                    chunks_flushed += 1;
                    bytes_written += chunk.len() as u64;
                }
            }
        }

        let _ = self.destination.shutdown().await;
        link.close();

        ForwardSummary {
            direction,
            chunks_read,
            chunks_forwarded,
            chunks_dropped,
            chunks_flushed,
            bytes_written,
            end,
        }
    }
}
