use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use pivot_tls::CertificateStore;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

use crate::conn::{AsyncReadWrite, IoStream, IO_CHUNK_SIZE};

/// Byte counts moved in each direction by a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TunnelTotals {
    pub from_client: u64,
    pub from_server: u64,
}

/// Relay raw bytes in both directions until both sides reach EOF, an error
/// occurs, or no byte moves for `idle_timeout`.
///
/// Half-close is honored: one side hitting EOF shuts down the peer's write
/// half while the opposite direction keeps draining.
pub(crate) async fn pipe_bidirectional<A, B>(
    client: &mut A,
    server: &mut B,
    idle_timeout: Duration,
) -> io::Result<TunnelTotals>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut totals = TunnelTotals::default();
    let mut client_buf = [0_u8; IO_CHUNK_SIZE];
    let mut server_buf = [0_u8; IO_CHUNK_SIZE];
    let mut client_open = true;
    let mut server_open = true;

    while client_open || server_open {
        let step = tokio::time::timeout(idle_timeout, async {
            tokio::select! {
                read = client.read(&mut client_buf), if client_open => {
                    let read = read?;
                    if read == 0 {
                        server.shutdown().await.ok();
                        Ok::<_, io::Error>((true, 0))
                    } else {
                        server.write_all(&client_buf[..read]).await?;
                        Ok((true, read))
                    }
                }
                read = server.read(&mut server_buf), if server_open => {
                    let read = read?;
                    if read == 0 {
                        client.shutdown().await.ok();
                        Ok((false, 0))
                    } else {
                        client.write_all(&server_buf[..read]).await?;
                        Ok((false, read))
                    }
                }
            }
        })
        .await;

        match step {
            Ok(Ok((true, 0))) => client_open = false,
            Ok(Ok((false, 0))) => server_open = false,
            Ok(Ok((true, read))) => totals.from_client += read as u64,
            Ok(Ok((false, read))) => totals.from_server += read as u64,
            Ok(Err(error)) => return Err(error),
            // Idle: both directions stalled past the watchdog.
            Err(_) => break,
        }
    }
    Ok(totals)
}

/// Terminate client TLS inside an established CONNECT tunnel. The leaf host
/// comes from the CONNECT target but is overridden by ClientHello SNI when
/// the client sends one.
pub(crate) async fn accept_client_tls(
    store: &CertificateStore,
    connect_host: &str,
    client: IoStream,
) -> io::Result<IoStream> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), client);
    let handshake = acceptor.await?;

    let sni = handshake
        .client_hello()
        .server_name()
        .map(str::to_string);
    let host = sni.as_deref().unwrap_or(connect_host);
    let leaf = store
        .leaf_for_host(host)
        .await
        .map_err(|error| io::Error::other(format!("leaf issuance for {host} failed: {error}")))?;

    let stream = handshake
        .into_stream(Arc::clone(&leaf.server_config))
        .await?;
    Ok(Box::new(stream))
}

/// Open the upstream half of an intercepted tunnel: TLS to the real origin,
/// validated against the trust store unless the insecure policy flag built
/// the client config.
pub(crate) async fn connect_upstream_tls(
    tls_config: Arc<rustls::ClientConfig>,
    host: &str,
    stream: tokio::net::TcpStream,
) -> io::Result<IoStream> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| io::Error::other(format!("invalid upstream TLS name: {host}")))?;
    let connector = TlsConnector::from(tls_config);
    let stream = connector.connect(server_name, stream).await?;
    Ok(Box::new(stream))
}

/// Serves buffered bytes before falling through to the inner stream. Used
/// when protocol bytes arrived together with the head that preceded them.
pub(crate) struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let take = std::cmp::min(buf.remaining(), self.prefix.len() - self.offset);
            let offset = self.offset;
            buf.put_slice(&self.prefix[offset..offset + take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Re-box a stream together with bytes already pulled off it.
pub(crate) fn prefixed(prefix: Vec<u8>, inner: IoStream) -> IoStream {
    if prefix.is_empty() {
        inner
    } else {
        Box::new(PrefixedStream::new(prefix, inner))
    }
}

// Object safety check: PrefixedStream over a boxed stream is itself usable
// as an IoStream.
const _: fn() = || {
    fn assert_io_stream<T: AsyncReadWrite>() {}
    assert_io_stream::<PrefixedStream<IoStream>>();
};
