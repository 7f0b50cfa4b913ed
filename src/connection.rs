//! Buffered byte-stream channel used on both legs of the proxy.
//!
//! Reads go through a read-ahead buffer so one socket read can satisfy several
//! `read_line` calls, and `read_exact` picks up whatever is already buffered
//! before touching the socket again.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Longest line accepted by `read_line`, terminator included.
pub const MAX_LINE: usize = 8192;

const READ_CHUNK: usize = 8192;

/// A byte stream plus its read-ahead buffer.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    buf: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read up to and including the next line terminator (`\r\n`, or a bare `\n`).
    pub async fn read_line(&mut self) -> Result<Bytes> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + pos + 1;
                if end > MAX_LINE {
                    return Err(Error::LineTooLong(MAX_LINE));
                }
                return Ok(self.buf.split_to(end).freeze());
            }
            scanned = self.buf.len();
            if scanned >= MAX_LINE {
                return Err(Error::LineTooLong(MAX_LINE));
            }
            if self.fill(READ_CHUNK).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Read exactly `n` bytes, resuming after short reads.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            let wanted = (n - self.buf.len()).min(READ_CHUNK * 8);
            if self.fill(wanted).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read between 1 and `max` bytes, preferring bytes already buffered.
    pub async fn read_some(&mut self, max: usize) -> Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        if self.buf.is_empty() && self.fill(max.min(READ_CHUNK * 8)).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
        let n = self.buf.len().min(max);
        Ok(self.buf.split_to(n).freeze())
    }

    /// Write every byte, retrying partial writes, then flush.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Half-close the write side so the peer sees end of stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Bytes read from the stream but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn fill(&mut self, wanted: usize) -> Result<usize> {
        self.buf.reserve(wanted);
        let n = self.stream.read_buf(&mut self.buf).await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_line_spans_short_reads() {
        let mock = Builder::new()
            .read(b"GET / HT")
            .read(b"TP/1.0\r")
            .read(b"\nHost: a\r\n\r\n")
            .build();
        let mut conn = Connection::new(mock);

        assert_eq!(&conn.read_line().await.unwrap()[..], b"GET / HTTP/1.0\r\n");
        assert_eq!(&conn.read_line().await.unwrap()[..], b"Host: a\r\n");
        assert_eq!(&conn.read_line().await.unwrap()[..], b"\r\n");
    }

    #[tokio::test]
    async fn test_one_read_serves_many_lines() {
        let mock = Builder::new().read(b"a\r\nb\r\nc\n").build();
        let mut conn = Connection::new(mock);

        assert_eq!(&conn.read_line().await.unwrap()[..], b"a\r\n");
        assert_eq!(conn.buffered(), 5);
        assert_eq!(&conn.read_line().await.unwrap()[..], b"b\r\n");
        assert_eq!(&conn.read_line().await.unwrap()[..], b"c\n");
    }

    #[tokio::test]
    async fn test_read_exact_consumes_buffer_then_stream() {
        let mock = Builder::new()
            .read(b"HTTP/1.0 200 OK\r\n\r\nhel")
            .read(b"lo ")
            .read(b"world")
            .build();
        let mut conn = Connection::new(mock);

        conn.read_line().await.unwrap();
        conn.read_line().await.unwrap();
        assert_eq!(&conn.read_exact(11).await.unwrap()[..], b"hello world");
    }

    #[tokio::test]
    async fn test_read_exact_preserves_binary_bytes() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mock = Builder::new().read(&payload[..100]).read(&payload[100..]).build();
        let mut conn = Connection::new(mock);

        assert_eq!(&conn.read_exact(256).await.unwrap()[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_peer_close_mid_line() {
        let mock = Builder::new().read(b"partial").build();
        let mut conn = Connection::new(mock);

        assert!(matches!(conn.read_line().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_peer_close_before_body_complete() {
        let mock = Builder::new().read(b"short").build();
        let mut conn = Connection::new(mock);

        assert!(matches!(conn.read_exact(10).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_error_is_io() {
        let mock = Builder::new()
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();
        let mut conn = Connection::new(mock);

        assert!(matches!(conn.read_line().await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let long = vec![b'x'; MAX_LINE];
        let mock = Builder::new().read(&long).build();
        let mut conn = Connection::new(mock);

        assert!(matches!(conn.read_line().await, Err(Error::LineTooLong(_))));
    }

    #[tokio::test]
    async fn test_read_some_drains_buffer_first() {
        let mock = Builder::new().read(b"abc\r\ndefgh").read(b"ij").build();
        let mut conn = Connection::new(mock);

        conn.read_line().await.unwrap();
        assert_eq!(&conn.read_some(3).await.unwrap()[..], b"def");
        assert_eq!(&conn.read_some(10).await.unwrap()[..], b"gh");
        assert_eq!(&conn.read_some(10).await.unwrap()[..], b"ij");
        assert!(matches!(conn.read_some(1).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_write_all_survives_partial_writes() {
        let mock = Builder::new().write(b"HTTP/1.0 ").write(b"200 OK\r\n").build();
        let mut conn = Connection::new(mock);

        conn.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();
    }
}
