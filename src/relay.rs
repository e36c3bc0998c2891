//! Bidirectional relay
//!
//! Each direction runs in its own task so that neither can block the other:
//! a client may half-close while the backend keeps talking, or the backend
//! may never close at all. The relay finishes once both tasks are joined.

use crate::error::{Direction, RelayError};
use crate::stream::Tee;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Size of a single read
    pub chunk_size: usize,
    /// Keep a copy of everything relayed in both directions
    pub record: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            record: false,
        }
    }
}

/// What one relay moved, including a session cut short by an error
#[derive(Debug, Default)]
pub struct Transfer {
    /// Bytes written to the backend
    pub upstream: u64,
    /// Bytes written to the client
    pub downstream: u64,
    /// Everything read from the client, when recording
    pub request: Option<Bytes>,
    /// Everything read from the backend, when recording
    pub response: Option<Bytes>,
    /// Why the relay stopped early; `None` when both sides closed normally
    pub error: Option<RelayError>,
}

impl Transfer {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Split off the error, if any
    pub fn into_result(mut self) -> Result<Self, RelayError> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

struct Pumped {
    bytes: u64,
    capture: Option<Bytes>,
    result: Result<(), RelayError>,
}

impl Pumped {
    fn failed(error: RelayError) -> Self {
        Self {
            bytes: 0,
            capture: None,
            result: Err(error),
        }
    }
}

/// Relay bytes between `inbound` and `outbound` until both directions end.
///
/// End-of-stream on one side is forwarded as a write shutdown to the other
/// side, and the opposite direction keeps running. An I/O error in either
/// direction stops both. Cancelling `abort` stops both as well. Counts and
/// captures are kept either way; a failure is reported in
/// [`Transfer::error`].
///
/// Both streams are dropped, and therefore closed, before this returns.
pub async fn relay<A, B>(
    inbound: A,
    outbound: B,
    options: &RelayOptions,
    abort: &CancellationToken,
) -> Transfer
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (inbound_read, inbound_write) = tokio::io::split(inbound);
    let (outbound_read, outbound_write) = tokio::io::split(outbound);

    let session = abort.child_token();
    let chunk_size = options.chunk_size.max(1);

    let upstream = tokio::spawn(pump(
        Direction::Upstream,
        tee(inbound_read, options.record),
        outbound_write,
        chunk_size,
        session.clone(),
    ));
    let downstream = tokio::spawn(pump(
        Direction::Downstream,
        tee(outbound_read, options.record),
        inbound_write,
        chunk_size,
        session,
    ));

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    let upstream = upstream.unwrap_or_else(|e| Pumped::failed(e.into()));
    let downstream = downstream.unwrap_or_else(|e| Pumped::failed(e.into()));

    debug!(
        upstream_bytes = upstream.bytes,
        downstream_bytes = downstream.bytes,
        "Relay finished"
    );

    // A real I/O failure wins over the cancellation it caused on the other side
    let error = match (upstream.result, downstream.result) {
        (Ok(()), Ok(())) => None,
        (Err(e @ RelayError::Io { .. }), _) | (_, Err(e @ RelayError::Io { .. })) => Some(e),
        (Err(e), _) | (_, Err(e)) => Some(e),
    };

    Transfer {
        upstream: upstream.bytes,
        downstream: downstream.bytes,
        request: upstream.capture,
        response: downstream.capture,
        error,
    }
}

fn tee<R>(reader: R, record: bool) -> Tee<R> {
    if record {
        Tee::capturing(reader)
    } else {
        Tee::new(reader)
    }
}

/// Copy one direction until EOF, error or cancellation
async fn pump<R, W>(
    direction: Direction,
    mut reader: Tee<R>,
    mut writer: W,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Pumped
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;

    let result = tokio::select! {
        r = forward(&mut reader, &mut writer, chunk_size, &mut written) => {
            r.map_err(|source| RelayError::Io { direction, source })
        }
        _ = cancel.cancelled() => Err(RelayError::Aborted),
    };

    match result {
        Ok(()) => {
            // Pass the half-close on; the other direction carries on
            if let Err(e) = writer.shutdown().await {
                debug!(%direction, error = %e, "Shutdown after EOF failed");
            }
            trace!(%direction, bytes = written, "Direction reached EOF");
        }
        Err(ref e) => {
            debug!(%direction, error = %e, written, read = reader.count(), "Direction stopped");
            cancel.cancel();
        }
    }

    let (_, capture) = reader.into_parts();

    Pumped {
        bytes: written,
        capture,
        result,
    }
}

/// `written` only grows once a chunk has been fully handed to the writer
async fn forward<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    written: &mut u64,
) -> std::io::Result<()>
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
        *written += n as u64;
    }
}
