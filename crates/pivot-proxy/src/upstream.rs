use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use pivot_core::ProxyError;
use pivot_http::{parse_response_head, ParseLimits};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::conn::BufferedConn;

const DNS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Small positive resolver cache so keep-alive bursts to one host do not
/// re-resolve on every request.
#[derive(Default)]
pub(crate) struct DnsCache {
    entries: DashMap<String, (Vec<SocketAddr>, Instant)>,
}

impl DnsCache {
    fn lookup(&self, key: &str) -> Option<Vec<SocketAddr>> {
        let entry = self.entries.get(key)?;
        let (addrs, resolved_at) = entry.value();
        if resolved_at.elapsed() > DNS_CACHE_TTL {
            return None;
        }
        Some(addrs.clone())
    }

    fn store(&self, key: String, addrs: Vec<SocketAddr>) {
        self.entries.insert(key, (addrs, Instant::now()));
    }
}

/// Open a TCP connection to `host:port` within `connect_timeout`.
/// Resolution failures and refused connections map to
/// `UpstreamUnreachable`; running out the clock maps to `UpstreamTimeout`.
pub(crate) async fn connect_upstream(
    dns_cache: &DnsCache,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let deadline = Instant::now() + connect_timeout;
    let addrs = resolve(dns_cache, host, port, deadline).await?;

    let mut last_error: Option<std::io::Error> = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProxyError::UpstreamTimeout);
        }
        match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(error)) => last_error = Some(error),
            Err(_) => return Err(ProxyError::UpstreamTimeout),
        }
    }

    Err(ProxyError::UpstreamUnreachable(match last_error {
        Some(error) => format!("{host}:{port}: {error}"),
        None => format!("{host}:{port}: no addresses resolved"),
    }))
}

async fn resolve(
    dns_cache: &DnsCache,
    host: &str,
    port: u16,
    deadline: Instant,
) -> Result<Vec<SocketAddr>, ProxyError> {
    let key = format!("{host}:{port}");
    if let Some(addrs) = dns_cache.lookup(&key) {
        return Ok(addrs);
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(ProxyError::UpstreamTimeout);
    }
    let resolved = tokio::time::timeout(remaining, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|error| ProxyError::UpstreamUnreachable(format!("{host}:{port}: {error}")))?
        .collect::<Vec<_>>();

    if resolved.is_empty() {
        return Err(ProxyError::UpstreamUnreachable(format!(
            "{host}:{port}: resolution returned no addresses"
        )));
    }
    dns_cache.store(key, resolved.clone());
    Ok(resolved)
}

/// Establish a tunnel through the configured parent proxy by issuing our own
/// CONNECT to it. The returned stream carries raw bytes to the target.
pub(crate) async fn connect_via_parent(
    dns_cache: &DnsCache,
    parent_host: &str,
    parent_port: u16,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
    recv_cap: usize,
) -> Result<TcpStream, ProxyError> {
    let stream = connect_upstream(dns_cache, parent_host, parent_port, connect_timeout).await?;
    let mut conn = BufferedConn::new(stream, recv_cap);

    let connect = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n\r\n"
    );
    conn.stream
        .write_all(connect.as_bytes())
        .await
        .map_err(|error| {
            ProxyError::UpstreamUnreachable(format!("parent proxy write failed: {error}"))
        })?;

    let head = tokio::time::timeout(connect_timeout, conn.read_head(ParseLimits::default()))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|_| {
            ProxyError::UpstreamUnreachable("parent proxy closed during CONNECT".to_string())
        })?
        .ok_or_else(|| {
            ProxyError::UpstreamUnreachable("parent proxy closed during CONNECT".to_string())
        })?;

    let response = parse_response_head(&head, "CONNECT", ParseLimits::default()).map_err(|error| {
        ProxyError::UpstreamUnreachable(format!("parent proxy sent invalid response: {error}"))
    })?;
    if response.status_code != 200 {
        return Err(ProxyError::UpstreamUnreachable(format!(
            "parent proxy refused CONNECT: {}",
            response.status_code
        )));
    }

    Ok(conn.stream)
}
