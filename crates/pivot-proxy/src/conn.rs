use std::io;

use pivot_http::{HeadBuffer, ParseError, ParseLimits};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Object-safe transport bound. Both plain TCP and TLS-wrapped streams go
/// through this, so the protocol handler stays transport-agnostic.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type IoStream = Box<dyn AsyncReadWrite>;

#[derive(Debug)]
pub(crate) enum HeadReadError {
    Io(io::Error),
    Malformed(ParseError),
    ClosedMidHead,
}

impl From<io::Error> for HeadReadError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// A connection endpoint with a buffered read side. Bytes that arrive past a
/// message boundary stay in `read_buf` for the next phase. The buffer never
/// grows past the configured receive cap: each fill is clamped to the room
/// left, and a message head that cannot fit the cap is rejected.
pub(crate) struct BufferedConn<S> {
    pub(crate) stream: S,
    pub(crate) read_buf: Vec<u8>,
    recv_cap: usize,
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    pub(crate) fn new(stream: S, recv_cap: usize) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            recv_cap: recv_cap.max(1),
        }
    }

    /// One read from the kernel into the buffer, clamped to the room left
    /// under the receive cap. Returns the byte count; 0 means EOF.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self.recv_cap.saturating_sub(self.read_buf.len());
        if room == 0 {
            return Err(io::Error::other("receive buffer full"));
        }
        let mut chunk = vec![0_u8; room.min(IO_CHUNK_SIZE)];
        let read = self.stream.read(&mut chunk).await?;
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Read until a complete message head is buffered, then drain and return
    /// it. `Ok(None)` means the peer closed cleanly before sending anything.
    /// A head that fills the receive cap without completing is rejected the
    /// same way as one over the parse limit.
    pub(crate) async fn read_head(
        &mut self,
        limits: ParseLimits,
    ) -> Result<Option<Vec<u8>>, HeadReadError> {
        let mut head = HeadBuffer::new(limits);
        loop {
            match head.scan(&self.read_buf) {
                Ok(Some(end)) => {
                    let raw = self.read_buf.drain(..end).collect::<Vec<_>>();
                    return Ok(Some(raw));
                }
                Ok(None) => {}
                Err(error) => return Err(HeadReadError::Malformed(error)),
            }

            if self.read_buf.len() >= self.recv_cap {
                return Err(HeadReadError::Malformed(ParseError::HeadTooLarge));
            }
            let read = self.fill().await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(HeadReadError::ClosedMidHead);
            }
        }
    }

    /// Buffered bytes if any, otherwise one read from the stream. Empty
    /// result means EOF.
    pub(crate) async fn next_chunk(&mut self) -> io::Result<Vec<u8>> {
        if self.read_buf.is_empty() {
            let read = self.fill().await?;
            if read == 0 {
                return Ok(Vec::new());
            }
        }
        Ok(std::mem::take(&mut self.read_buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_head_returns_head_and_keeps_body_buffered() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server, 64 * 1024);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbodybytes")
            .await
            .expect("write");
        client.shutdown().await.expect("shutdown");

        let head = conn
            .read_head(ParseLimits::default())
            .await
            .expect("read head")
            .expect("head present");
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(conn.read_buf, b"bodybytes");
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_is_none() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server, 64 * 1024);
        drop(client);

        let head = conn
            .read_head(ParseLimits::default())
            .await
            .expect("read head");
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn eof_mid_head_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server, 64 * 1024);

        client.write_all(b"GET / HT").await.expect("write");
        client.shutdown().await.expect("shutdown");

        let error = conn
            .read_head(ParseLimits::default())
            .await
            .expect_err("must fail");
        assert!(matches!(error, HeadReadError::ClosedMidHead));
    }

    #[tokio::test]
    async fn buffer_never_grows_past_the_receive_cap() {
        let (mut client, server) = tokio::io::duplex(8 * 1024);
        let recv_cap = 1024;
        let mut conn = BufferedConn::new(server, recv_cap);

        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        while raw.len() < 2 * recv_cap {
            raw.extend_from_slice(b"X-Filler: value\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        client.write_all(&raw).await.expect("write");

        let error = conn
            .read_head(ParseLimits::default())
            .await
            .expect_err("must fail");
        assert!(matches!(
            error,
            HeadReadError::Malformed(ParseError::HeadTooLarge)
        ));
        assert!(conn.read_buf.len() <= recv_cap);
    }

    #[tokio::test]
    async fn oversized_head_is_malformed() {
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let mut conn = BufferedConn::new(server, 64 * 1024);

        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        while raw.len() <= ParseLimits::default().max_head_bytes {
            raw.extend_from_slice(b"X-Filler: some value\r\n");
        }
        client.write_all(&raw).await.expect("write");

        let error = conn
            .read_head(ParseLimits::default())
            .await
            .expect_err("must fail");
        assert!(matches!(
            error,
            HeadReadError::Malformed(ParseError::HeadTooLarge)
        ));
    }
}
