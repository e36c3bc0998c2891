//! Read-side decorator used by the relay to count and optionally record
//! the bytes flowing through one direction.

use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Wraps a reader, counting every byte read and, when capturing, appending
/// it to an in-memory buffer in read order.
#[derive(Debug)]
pub struct Tee<R> {
    inner: R,
    count: u64,
    capture: Option<BytesMut>,
}

impl<R> Tee<R> {
    /// Count only
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: 0,
            capture: None,
        }
    }

    /// Count and keep a copy of everything read
    pub fn capturing(inner: R) -> Self {
        Self {
            inner,
            count: 0,
            capture: Some(BytesMut::new()),
        }
    }

    /// Bytes read so far. The relay reports bytes written separately; the
    /// two differ when a write fails after the read.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Returns the inner reader and the captured bytes, if capturing
    pub fn into_parts(self) -> (R, Option<Bytes>) {
        (self.inner, self.capture.map(BytesMut::freeze))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Tee<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let read = &buf.filled()[before..];
        this.count += read.len() as u64;
        if let Some(capture) = this.capture.as_mut() {
            capture.extend_from_slice(read);
        }

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn captures_bytes_in_order_across_reads() {
        let (mut writer, reader) = tokio::io::duplex(4);
        let mut tee = Tee::capturing(reader);

        tokio::spawn(async move {
            writer.write_all(b"hello, ").await.unwrap();
            writer.write_all(b"world").await.unwrap();
        });

        let mut out = Vec::new();
        tee.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"hello, world");
        assert_eq!(tee.count(), 12);
        let (_, captured) = tee.into_parts();
        assert_eq!(captured.unwrap(), Bytes::from_static(b"hello, world"));
    }

    #[tokio::test]
    async fn counting_only_keeps_no_copy() {
        let data: &[u8] = b"0123456789";
        let mut tee = Tee::new(data);

        let mut buf = [0u8; 3];
        let n = tee.read(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(tee.count(), 3);
        assert!(!tee.is_capturing());

        let mut rest = Vec::new();
        tee.read_to_end(&mut rest).await.unwrap();
        assert_eq!(tee.count(), 10);
        assert!(tee.into_parts().1.is_none());
    }
}
