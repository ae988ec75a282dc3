use std::io;

use bytes::Bytes;
use pivot_http::{BodyMode, ChunkEvent, ChunkedDecoder};
use pivot_plugin::{FlowContext, PluginChain};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::conn::BufferedConn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyDirection {
    Request,
    Response,
}

/// Relay one message body from `source` to `sink` according to its framing,
/// feeding plugins along the way.
///
/// Fixed-length and close-delimited bodies pass through the plugin chain as
/// wire chunks and plugin rewrites are forwarded. Chunked bodies are
/// forwarded byte-identical; plugins observe the decoded chunk payloads, and
/// a rewrite attempt at that point is ignored and logged because the framing
/// already left for the peer.
pub(crate) async fn relay_body<S, W>(
    source: &mut BufferedConn<S>,
    sink: &mut W,
    mode: BodyMode,
    chain: &PluginChain,
    context: &FlowContext,
    direction: BodyDirection,
) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match mode {
        BodyMode::None => Ok(0),
        BodyMode::ContentLength(length) => {
            relay_exact(source, sink, length, chain, context, direction).await
        }
        BodyMode::Chunked => relay_chunked(source, sink, chain, context, direction).await,
        BodyMode::CloseDelimited => {
            relay_until_eof(source, sink, chain, context, direction).await
        }
    }
}

fn observe(
    chain: &PluginChain,
    context: &FlowContext,
    direction: BodyDirection,
    chunk: Bytes,
) -> Bytes {
    match direction {
        BodyDirection::Request => chain.on_request_body_chunk(context, chunk),
        BodyDirection::Response => chain.on_response_chunk(context, chunk),
    }
}

async fn relay_exact<S, W>(
    source: &mut BufferedConn<S>,
    sink: &mut W,
    mut remaining: u64,
    chain: &PluginChain,
    context: &FlowContext,
    direction: BodyDirection,
) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    while remaining > 0 {
        let mut chunk = source.next_chunk().await?;
        if chunk.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body completed",
            ));
        }
        // Bytes past the declared length belong to the next message.
        if (chunk.len() as u64) > remaining {
            let keep = chunk.split_off(remaining as usize);
            source.read_buf.splice(0..0, keep);
        }
        remaining -= chunk.len() as u64;

        let observed = observe(chain, context, direction, Bytes::from(chunk));
        sink.write_all(&observed).await?;
        total += observed.len() as u64;
    }
    Ok(total)
}

async fn relay_chunked<S, W>(
    source: &mut BufferedConn<S>,
    sink: &mut W,
    chain: &PluginChain,
    context: &FlowContext,
    direction: BodyDirection,
) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = ChunkedDecoder::new();
    let mut total = 0_u64;

    while !decoder.is_done() {
        let chunk = source.next_chunk().await?;
        if chunk.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before chunked body completed",
            ));
        }

        let mut consumed = 0;
        while consumed < chunk.len() && !decoder.is_done() {
            let (step, event) = decoder
                .advance(&chunk[consumed..])
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error.to_string()))?;
            consumed += step;
            if let Some(ChunkEvent::Data(data)) = event {
                let observed = observe(
                    chain,
                    context,
                    direction,
                    Bytes::copy_from_slice(data),
                );
                if observed.as_ref() != data {
                    tracing::warn!(
                        "plugin rewrite of a chunked body ignored; framing already sent"
                    );
                }
            }
        }

        sink.write_all(&chunk[..consumed]).await?;
        total += consumed as u64;
        if consumed < chunk.len() {
            // Decoder finished inside this chunk; the rest belongs to the
            // next message on this connection.
            source.read_buf.splice(0..0, chunk[consumed..].iter().copied());
        }
    }
    Ok(total)
}

async fn relay_until_eof<S, W>(
    source: &mut BufferedConn<S>,
    sink: &mut W,
    chain: &PluginChain,
    context: &FlowContext,
    direction: BodyDirection,
) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    loop {
        let chunk = source.next_chunk().await?;
        if chunk.is_empty() {
            return Ok(total);
        }
        let observed = observe(chain, context, direction, Bytes::from(chunk));
        sink.write_all(&observed).await?;
        total += observed.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivot_plugin::{
        PluginCapabilities, PluginError, ProxyPlugin, RequestAction,
    };
    use pivot_http::RequestHead;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt as _;

    struct BodyRecorder {
        seen: Arc<Mutex<Vec<u8>>>,
    }

    impl ProxyPlugin for BodyRecorder {
        fn name(&self) -> &str {
            "body_recorder"
        }

        fn capabilities(&self) -> PluginCapabilities {
            PluginCapabilities::REQUEST_BODY
        }

        fn on_client_request(
            &self,
            _context: &FlowContext,
            _request: &mut RequestHead,
        ) -> Result<RequestAction, PluginError> {
            Ok(RequestAction::Continue)
        }

        fn on_request_body_chunk(
            &self,
            _context: &FlowContext,
            chunk: Bytes,
        ) -> Result<Bytes, PluginError> {
            self.seen.lock().expect("lock").extend_from_slice(&chunk);
            Ok(chunk)
        }
    }

    async fn run_relay(wire: &[u8], mode: BodyMode, chain: &PluginChain) -> (Vec<u8>, u64) {
        let (mut writer, reader) = tokio::io::duplex(256 * 1024);
        let mut source = BufferedConn::new(reader, 64 * 1024);
        writer.write_all(wire).await.expect("write wire");
        writer.shutdown().await.expect("shutdown");

        let mut sink = Vec::new();
        let total = relay_body(
            &mut source,
            &mut sink,
            mode,
            chain,
            &FlowContext::default(),
            BodyDirection::Request,
        )
        .await
        .expect("relay");
        (sink, total)
    }

    #[tokio::test]
    async fn fixed_length_body_is_forwarded_exactly() {
        let chain = PluginChain::empty();
        let (sink, total) =
            run_relay(b"hello worldEXTRA", BodyMode::ContentLength(11), &chain).await;
        assert_eq!(sink, b"hello world");
        assert_eq!(total, 11);
    }

    #[tokio::test]
    async fn chunked_body_passes_through_byte_identical_and_plugins_see_plaintext() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(vec![Arc::new(BodyRecorder {
            seen: Arc::clone(&seen),
        })]);

        let wire = b"5\r\nhello\r\n0\r\n\r\n";
        let (sink, total) = run_relay(wire, BodyMode::Chunked, &chain).await;
        assert_eq!(sink, wire);
        assert_eq!(total, wire.len() as u64);
        assert_eq!(seen.lock().expect("lock").as_slice(), b"hello");
    }

    #[tokio::test]
    async fn chunked_relay_leaves_next_pipelined_message_buffered() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut source = BufferedConn::new(reader, 64 * 1024);
        writer
            .write_all(b"2\r\nhi\r\n0\r\n\r\nGET / HTTP/1.1\r\n")
            .await
            .expect("write");

        let mut sink = Vec::new();
        let chain = PluginChain::empty();
        relay_body(
            &mut source,
            &mut sink,
            BodyMode::Chunked,
            &chain,
            &FlowContext::default(),
            BodyDirection::Request,
        )
        .await
        .expect("relay");

        assert_eq!(sink, b"2\r\nhi\r\n0\r\n\r\n");
        assert_eq!(source.read_buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn close_delimited_body_runs_to_eof() {
        let chain = PluginChain::empty();
        let (sink, total) = run_relay(b"stream until close", BodyMode::CloseDelimited, &chain).await;
        assert_eq!(sink, b"stream until close");
        assert_eq!(total, 18);
    }

    #[tokio::test]
    async fn truncated_fixed_body_is_an_error() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut source = BufferedConn::new(reader, 64 * 1024);
        writer.write_all(b"abc").await.expect("write");
        writer.shutdown().await.expect("shutdown");

        let mut sink = Vec::new();
        let chain = PluginChain::empty();
        let error = relay_body(
            &mut source,
            &mut sink,
            BodyMode::ContentLength(10),
            &chain,
            &FlowContext::default(),
            BodyDirection::Request,
        )
        .await
        .expect_err("must fail");
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }
}
