use std::sync::Arc;
use std::time::Duration;

use pivot_core::ProxyError;
use pivot_http::{
    build_forward_request_head, build_response, parse_authority, parse_request_head,
    parse_response_head, ForwardRewrite, ParseLimits, RequestHead, ResponseHead,
};
use pivot_plugin::{AccessLogEntry, ChainOutcome, FlowContext, PluginChain};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::acceptor::Inbound;
use crate::conn::{BufferedConn, HeadReadError, IoStream};
use crate::relay::{relay_body, BodyDirection};
use crate::tunnel::{
    accept_client_tls, connect_upstream_tls, pipe_bidirectional, prefixed,
};
use crate::upstream::{connect_upstream, connect_via_parent};
use crate::ServerShared;

/// Lifecycle position of a work unit. Each await point advances at most one
/// phase; the phase decides whether a failure may still synthesize an error
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitHead,
    Classify,
    PluginRequest,
    UpstreamConnect,
    Relay,
    Tunnel,
    KeepAlive,
}

/// Where the session's upstream bytes go.
enum SessionUpstream {
    /// Forward-proxy mode: the upstream is (re)opened per request from the
    /// request target, or routed through the configured parent proxy.
    Forward {
        conn: Option<(String, u16, BufferedConn<IoStream>)>,
    },
    /// Intercepted tunnel mode: one fixed TLS upstream for the connection.
    Fixed {
        port: u16,
        conn: BufferedConn<IoStream>,
    },
}

/// Per-connection state bundle. Owned by exactly one worker task for the
/// connection's lifetime.
pub(crate) struct WorkUnit {
    shared: Arc<ServerShared>,
    chain: PluginChain,
    context: FlowContext,
    phase: Phase,
    started_at: Instant,
    limits: ParseLimits,
    response_started: bool,
    response_bytes: u64,
    last_method: String,
    last_path: String,
    last_status: Option<(u16, String)>,
    failure: Option<&'static str>,
}

pub(crate) async fn handle_connection(shared: Arc<ServerShared>, inbound: Inbound) {
    let Inbound {
        stream,
        peer,
        permit: _permit,
    } = inbound;

    let chain = shared.chain();
    let flow_id = shared.next_flow_id();
    let context = FlowContext {
        flow_id,
        client_addr: peer.to_string(),
        ..FlowContext::default()
    };
    let unit = WorkUnit {
        shared: Arc::clone(&shared),
        chain,
        context,
        phase: Phase::AwaitHead,
        started_at: Instant::now(),
        limits: ParseLimits::default(),
        response_started: false,
        response_bytes: 0,
        last_method: String::new(),
        last_path: String::new(),
        last_status: None,
        failure: None,
    };

    let stream: IoStream = Box::new(stream);
    let client = BufferedConn::new(stream, shared.config.client_recvbuf_size);
    unit.run(client).await;
}

impl WorkUnit {
    async fn run(mut self, client: BufferedConn<IoStream>) {
        let mut client = Some(client);
        match self.drive(&mut client).await {
            Ok(()) => {}
            Err(error) => {
                self.failure = Some(error.kind_label());
                tracing::debug!(
                    flow_id = self.context.flow_id,
                    client = %self.context.client_addr,
                    phase = ?self.phase,
                    error = %error,
                    "work unit ended with failure"
                );
                if let Some(conn) = client.as_mut() {
                    // Before the first response byte a synthesized error
                    // response is still possible; afterwards only a close.
                    if !self.response_started {
                        let (status, reason, body) = error.response_parts();
                        let response = build_response(status, reason, body);
                        let _ = conn.stream.write_all(&response).await;
                        self.last_status = Some((status, reason.to_string()));
                    }
                }
            }
        }
        if let Some(conn) = client.as_mut() {
            let _ = conn.stream.shutdown().await;
        }
        self.finish();
    }

    /// The keep-alive loop over one client connection.
    async fn drive(
        &mut self,
        client_slot: &mut Option<BufferedConn<IoStream>>,
    ) -> Result<(), ProxyError> {
        let idle = self.shared.config.idle_timeout();
        let mut upstream = SessionUpstream::Forward { conn: None };

        // With HTTP proxying disabled and a parent configured, every byte is
        // piped blindly to the parent without local parsing.
        if self.shared.config.disable_http_proxy {
            if let Some(parent) = self.shared.config.upstream_proxy.clone() {
                self.phase = Phase::Tunnel;
                self.context.server_host = parent.hostname.clone();
                self.context.server_port = parent.port;
                let upstream_tcp = connect_upstream(
                    &self.shared.dns_cache,
                    &parent.hostname,
                    parent.port,
                    self.shared.config.connect_timeout(),
                )
                .await?;
                return self.relay_raw_tunnel(client_slot, upstream_tcp).await;
            }
        }

        loop {
            self.phase = Phase::AwaitHead;
            self.response_started = false;
            let client = client_slot.as_mut().expect("client connection present");

            let raw_head = match tokio::time::timeout(idle, client.read_head(self.limits)).await {
                Err(_) => {
                    if client.read_buf.is_empty() {
                        // Quiet keep-alive connection going away; nothing to
                        // report to anyone.
                        return Ok(());
                    }
                    return Err(ProxyError::ClientTimeout);
                }
                Ok(Err(HeadReadError::Malformed(error))) => {
                    return Err(ProxyError::MalformedProtocol(error.to_string()));
                }
                Ok(Err(HeadReadError::ClosedMidHead)) => return Ok(()),
                Ok(Err(HeadReadError::Io(error))) => {
                    tracing::debug!(
                        flow_id = self.context.flow_id,
                        %error,
                        "client read failed"
                    );
                    return Ok(());
                }
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(raw))) => raw,
            };

            let mut request = parse_request_head(&raw_head, self.limits)
                .map_err(|error| ProxyError::MalformedProtocol(error.to_string()))?;
            self.last_method = request.method.clone();
            self.last_path = request.target.clone();

            self.phase = Phase::Classify;
            if let Some(guard) = &self.shared.auth {
                if !guard.allows(&request) {
                    let challenge = pivot_core::basic_auth_challenge();
                    let client = client_slot.as_mut().expect("client connection present");
                    let _ = client.stream.write_all(&challenge).await;
                    self.response_started = true;
                    self.last_status =
                        Some((407, "Proxy Authentication Required".to_string()));
                    return Ok(());
                }
            }

            if request.is_connect() {
                self.phase = Phase::Tunnel;
                return self.handle_connect(client_slot, request).await;
            }

            if !request.target.starts_with("http://") {
                if request.target.starts_with('/') {
                    // The client treated us as a direct server; that belongs
                    // to the embedded web server collaborator.
                    return self.hand_off_to_origin(client_slot, request).await;
                }
                return Err(ProxyError::MalformedProtocol(
                    "request target must be absolute-form or CONNECT".to_string(),
                ));
            }
            if self.shared.config.disable_http_proxy {
                return Err(ProxyError::MalformedProtocol(
                    "http proxying is disabled".to_string(),
                ));
            }

            let keep_alive = self
                .forward_one_request(client_slot, &mut request, &mut upstream)
                .await?;
            if !keep_alive {
                return Ok(());
            }
            self.phase = Phase::KeepAlive;
        }
    }

    /// One forward-proxy request/response exchange. Returns whether the
    /// client connection persists.
    async fn forward_one_request(
        &mut self,
        client_slot: &mut Option<BufferedConn<IoStream>>,
        request: &mut RequestHead,
        upstream: &mut SessionUpstream,
    ) -> Result<bool, ProxyError> {
        let idle = self.shared.config.idle_timeout();

        self.phase = Phase::PluginRequest;
        match self
            .chain
            .before_upstream_connection(&self.context, request)
        {
            ChainOutcome::Continue => {}
            ChainOutcome::Respond(bytes) => {
                return self.write_synthesized(client_slot, &bytes).await;
            }
            ChainOutcome::Reject { status, reason } => {
                return self.write_rejection(client_slot, status, &reason).await;
            }
        }
        match self.chain.on_client_request(&self.context, request) {
            ChainOutcome::Continue => {}
            ChainOutcome::Respond(bytes) => {
                return self.write_synthesized(client_slot, &bytes).await;
            }
            ChainOutcome::Reject { status, reason } => {
                return self.write_rejection(client_slot, status, &reason).await;
            }
        }

        let parent = self.shared.config.upstream_proxy.clone();
        let default_port = match upstream {
            SessionUpstream::Fixed { port, .. } => *port,
            SessionUpstream::Forward { .. } => 80,
        };
        let rewrite = ForwardRewrite {
            via: self.shared.config.via_header.clone(),
            disable_headers: self.shared.config.disable_headers.clone(),
            keep_absolute_target: parent.is_some()
                && matches!(upstream, SessionUpstream::Forward { .. }),
        };
        let forward = build_forward_request_head(request, default_port, &rewrite)
            .map_err(|error| ProxyError::MalformedProtocol(error.to_string()))?;
        self.context.server_host = forward.host.clone();
        self.context.server_port = forward.port;
        self.last_path = forward.head.target.clone();

        self.phase = Phase::UpstreamConnect;
        let upstream_conn = match upstream {
            SessionUpstream::Fixed { conn, .. } => conn,
            SessionUpstream::Forward { conn } => {
                let (route_host, route_port) = match &parent {
                    Some(proxy) => (proxy.hostname.clone(), proxy.port),
                    None => (forward.host.clone(), forward.port),
                };
                let reusable = matches!(
                    conn,
                    Some((host, port, _)) if *host == route_host && *port == route_port
                );
                if !reusable {
                    let stream = connect_upstream(
                        &self.shared.dns_cache,
                        &route_host,
                        route_port,
                        self.shared.config.connect_timeout(),
                    )
                    .await?;
                    let stream: IoStream = Box::new(stream);
                    *conn = Some((
                        route_host,
                        route_port,
                        BufferedConn::new(stream, self.shared.config.server_recvbuf_size),
                    ));
                }
                let (_, _, buffered) = conn.as_mut().expect("upstream just set");
                buffered
            }
        };

        self.phase = Phase::Relay;
        let head_bytes = forward.head.to_bytes();
        with_idle(idle, upstream_conn.stream.write_all(&head_bytes), true).await?;

        let client = client_slot.as_mut().expect("client connection present");
        with_idle(
            idle,
            relay_body(
                client,
                &mut upstream_conn.stream,
                request.body_mode,
                &self.chain,
                &self.context,
                BodyDirection::Request,
            ),
            false,
        )
        .await?;

        let response_raw =
            match tokio::time::timeout(idle, upstream_conn.read_head(self.limits)).await {
                Err(_) => return Err(ProxyError::UpstreamTimeout),
                Ok(Err(HeadReadError::Malformed(error))) => {
                    return Err(ProxyError::UpstreamUnreachable(format!(
                        "upstream sent an invalid response: {error}"
                    )));
                }
                Ok(Err(_)) | Ok(Ok(None)) => {
                    return Err(ProxyError::UpstreamUnreachable(
                        "upstream closed before responding".to_string(),
                    ));
                }
                Ok(Ok(Some(raw))) => raw,
            };
        let response = parse_response_head(&response_raw, &request.method, self.limits)
            .map_err(|error| {
                ProxyError::UpstreamUnreachable(format!(
                    "upstream sent an invalid response: {error}"
                ))
            })?;

        let response_head_bytes = response.to_bytes();
        with_idle(idle, client.stream.write_all(&response_head_bytes), false).await?;
        self.response_started = true;
        self.response_bytes += response_head_bytes.len() as u64;
        self.last_status = Some((response.status_code, response.reason_phrase.clone()));

        let body_bytes = with_idle(
            idle,
            relay_body(
                upstream_conn,
                &mut client.stream,
                response.body_mode,
                &self.chain,
                &self.context,
                BodyDirection::Response,
            ),
            true,
        )
        .await?;
        self.response_bytes += body_bytes;

        Ok(self.persists(request, &response))
    }

    fn persists(&self, request: &RequestHead, response: &ResponseHead) -> bool {
        request.wants_keep_alive() && response.allows_keep_alive()
    }

    /// CONNECT handling: raw tunnel, or TLS interception when enabled.
    async fn handle_connect(
        &mut self,
        client_slot: &mut Option<BufferedConn<IoStream>>,
        mut request: RequestHead,
    ) -> Result<(), ProxyError> {
        let idle = self.shared.config.idle_timeout();
        let (host, port) = parse_authority(&request.target).ok_or_else(|| {
            ProxyError::MalformedProtocol("CONNECT target must be host:port".to_string())
        })?;
        self.context.server_host = host.clone();
        self.context.server_port = port;

        self.phase = Phase::PluginRequest;
        match self
            .chain
            .before_upstream_connection(&self.context, &mut request)
        {
            ChainOutcome::Continue => {}
            ChainOutcome::Respond(bytes) => {
                self.write_synthesized(client_slot, &bytes).await?;
                return Ok(());
            }
            ChainOutcome::Reject { status, reason } => {
                self.write_rejection(client_slot, status, &reason).await?;
                return Ok(());
            }
        }
        match self.chain.on_client_request(&self.context, &mut request) {
            ChainOutcome::Continue => {}
            ChainOutcome::Respond(bytes) => {
                self.write_synthesized(client_slot, &bytes).await?;
                return Ok(());
            }
            ChainOutcome::Reject { status, reason } => {
                self.write_rejection(client_slot, status, &reason).await?;
                return Ok(());
            }
        }

        self.phase = Phase::UpstreamConnect;
        let upstream_tcp = self.open_tunnel_transport(&host, port).await?;

        let client = client_slot.as_mut().expect("client connection present");
        with_idle(
            idle,
            client
                .stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n"),
            false,
        )
        .await?;
        self.response_started = true;

        let intercept = self.shared.cert_store().is_some()
            && !self.shared.config.disable_http_proxy;
        if intercept {
            self.intercept_tunnel(client_slot, upstream_tcp, &host, port)
                .await
        } else {
            self.relay_raw_tunnel(client_slot, upstream_tcp).await
        }
    }

    async fn open_tunnel_transport(
        &self,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, ProxyError> {
        match &self.shared.config.upstream_proxy {
            Some(parent) => {
                connect_via_parent(
                    &self.shared.dns_cache,
                    &parent.hostname,
                    parent.port,
                    host,
                    port,
                    self.shared.config.connect_timeout(),
                    self.shared.config.server_recvbuf_size,
                )
                .await
            }
            None => {
                connect_upstream(
                    &self.shared.dns_cache,
                    host,
                    port,
                    self.shared.config.connect_timeout(),
                )
                .await
            }
        }
    }

    async fn relay_raw_tunnel(
        &mut self,
        client_slot: &mut Option<BufferedConn<IoStream>>,
        mut upstream: TcpStream,
    ) -> Result<(), ProxyError> {
        self.phase = Phase::Tunnel;
        let mut client = client_slot.take().expect("client connection present");

        // Protocol bytes may have arrived right behind the CONNECT head.
        if !client.read_buf.is_empty() {
            let early = std::mem::take(&mut client.read_buf);
            if upstream.write_all(&early).await.is_err() {
                return Ok(());
            }
        }

        match pipe_bidirectional(
            &mut client.stream,
            &mut upstream,
            self.shared.config.idle_timeout(),
        )
        .await
        {
            Ok(totals) => {
                self.response_bytes += totals.from_server;
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    async fn intercept_tunnel(
        &mut self,
        client_slot: &mut Option<BufferedConn<IoStream>>,
        upstream_tcp: TcpStream,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        self.phase = Phase::Tunnel;
        let store = self
            .shared
            .cert_store()
            .expect("interception requires a certificate store");

        let client = client_slot.take().expect("client connection present");
        let leftover = client.read_buf;
        let client_stream = prefixed(leftover, client.stream);

        let tls_client = accept_client_tls(&store, host, client_stream)
            .await
            .map_err(|error| ProxyError::TlsHandshakeFailed(error.to_string()))?;
        let tls_upstream = connect_upstream_tls(
            Arc::clone(&self.shared.upstream_tls),
            host,
            upstream_tcp,
        )
        .await
        .map_err(|error| ProxyError::TlsHandshakeFailed(error.to_string()))?;

        self.context.intercepted = true;
        let client_conn = BufferedConn::new(tls_client, self.shared.config.client_recvbuf_size);
        let upstream_conn =
            BufferedConn::new(tls_upstream, self.shared.config.server_recvbuf_size);
        *client_slot = Some(client_conn);

        // The decrypted tunnel is an origin-form HTTP session against a
        // fixed upstream; drive it with the same request loop.
        let mut upstream = SessionUpstream::Fixed {
            port,
            conn: upstream_conn,
        };
        loop {
            self.phase = Phase::AwaitHead;
            self.response_started = false;
            let client = client_slot.as_mut().expect("client connection present");
            let raw_head = match tokio::time::timeout(
                self.shared.config.idle_timeout(),
                client.read_head(self.limits),
            )
            .await
            {
                Err(_) => {
                    if client.read_buf.is_empty() {
                        return Ok(());
                    }
                    return Err(ProxyError::ClientTimeout);
                }
                Ok(Err(HeadReadError::Malformed(error))) => {
                    return Err(ProxyError::MalformedProtocol(error.to_string()));
                }
                Ok(Err(_)) | Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(raw))) => raw,
            };

            let mut request = parse_request_head(&raw_head, self.limits)
                .map_err(|error| ProxyError::MalformedProtocol(error.to_string()))?;
            self.last_method = request.method.clone();
            self.last_path = request.target.clone();

            let keep_alive = self
                .forward_one_request(client_slot, &mut request, &mut upstream)
                .await?;
            if !keep_alive {
                return Ok(());
            }
            self.phase = Phase::KeepAlive;
        }
    }

    async fn hand_off_to_origin(
        &mut self,
        client_slot: &mut Option<BufferedConn<IoStream>>,
        request: RequestHead,
    ) -> Result<(), ProxyError> {
        let client = client_slot.take().expect("client connection present");
        if !self.shared.config.enable_web_server {
            *client_slot = Some(client);
            return Err(ProxyError::MalformedProtocol(
                "origin-form request without web server".to_string(),
            ));
        }
        self.last_status = Some((0, "handed to web server".to_string()));
        let stream = prefixed(client.read_buf, client.stream);
        let _ = self.shared.origin.handle(request, stream).await;
        Ok(())
    }

    async fn write_synthesized(
        &mut self,
        client_slot: &mut Option<BufferedConn<IoStream>>,
        bytes: &[u8],
    ) -> Result<bool, ProxyError> {
        let client = client_slot.as_mut().expect("client connection present");
        let _ = client.stream.write_all(bytes).await;
        self.response_started = true;
        self.response_bytes += bytes.len() as u64;
        self.last_status = Some((0, "synthesized by plugin".to_string()));
        Ok(false)
    }

    async fn write_rejection(
        &mut self,
        client_slot: &mut Option<BufferedConn<IoStream>>,
        status: u16,
        reason: &str,
    ) -> Result<bool, ProxyError> {
        let client = client_slot.as_mut().expect("client connection present");
        let response = build_response(status, status_reason(status), reason);
        let _ = client.stream.write_all(&response).await;
        self.response_started = true;
        self.response_bytes += response.len() as u64;
        self.last_status = Some((status, status_reason(status).to_string()));
        self.failure = Some("plugin_rejected");
        Ok(false)
    }

    /// Connection teardown: close hooks, then the access log record, which
    /// plugins may rewrite or consume.
    fn finish(self) {
        self.chain.on_client_connection_close(&self.context);

        let (response_code, response_reason) = match &self.last_status {
            Some((code, reason)) if *code > 0 => (Some(*code), reason.clone()),
            Some((_, reason)) => (None, reason.clone()),
            None => (None, String::new()),
        };
        let entry = AccessLogEntry {
            client_addr: self.context.client_addr.clone(),
            method: self.last_method.clone(),
            path: self.last_path.clone(),
            server_host: self.context.server_host.clone(),
            server_port: self.context.server_port,
            response_code,
            response_reason,
            response_bytes: self.response_bytes,
            connection_time_ms: self.started_at.elapsed().as_millis() as u64,
            failure: self.failure,
        };
        if let Some(entry) = self.chain.on_access_log(&self.context, entry) {
            self.shared.access_log.emit(&entry);
        }
    }
}

/// Bound one relay step by the idle watchdog. `upstream_side` picks which
/// side a timeout or hard I/O failure is attributed to.
async fn with_idle<T, E>(
    idle: Duration,
    operation: impl std::future::Future<Output = Result<T, E>>,
    upstream_side: bool,
) -> Result<T, ProxyError>
where
    E: std::fmt::Display,
{
    match tokio::time::timeout(idle, operation).await {
        Err(_) if upstream_side => Err(ProxyError::UpstreamTimeout),
        Err(_) => Err(ProxyError::ClientTimeout),
        Ok(Err(error)) if upstream_side => Err(ProxyError::UpstreamUnreachable(format!(
            "relay failed: {error}"
        ))),
        Ok(Err(error)) => Err(ProxyError::ClientDisconnected(error.to_string())),
        Ok(Ok(value)) => Ok(value),
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reasons_cover_the_synthesized_set() {
        assert_eq!(status_reason(400), "Bad Request");
        assert_eq!(status_reason(407), "Proxy Authentication Required");
        assert_eq!(status_reason(502), "Bad Gateway");
        assert_eq!(status_reason(999), "Error");
    }
}
