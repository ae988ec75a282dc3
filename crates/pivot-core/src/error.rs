use thiserror::Error;

/// Failure classes surfaced by the proxy data path.
///
/// Anything detected before the first response byte maps to a synthesized
/// HTTP error response; afterwards the connection is closed silently. The
/// class label also feeds the access log.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("upstream timed out")]
    UpstreamTimeout,
    #[error("client timed out")]
    ClientTimeout,
    #[error("client connection failed: {0}")]
    ClientDisconnected(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
    #[error("rejected by plugin {0}")]
    PluginRejected(String),
    #[error("plugin {0} crashed")]
    PluginCrashed(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl ProxyError {
    /// Stable label used in access log records.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::MalformedProtocol(_) => "malformed_protocol",
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::ClientTimeout => "client_timeout",
            Self::ClientDisconnected(_) => "client_disconnected",
            Self::TlsHandshakeFailed(_) => "tls_handshake_failed",
            Self::PluginRejected(_) => "plugin_rejected",
            Self::PluginCrashed(_) => "plugin_crashed",
            Self::ResourceExhausted(_) => "resource_exhausted",
        }
    }

    /// Synthesized response for failures caught before any response byte
    /// reached the client. The body names only the failure class, never
    /// internal detail.
    pub fn response_parts(&self) -> (u16, &'static str, &'static str) {
        match self {
            Self::MalformedProtocol(_) => (400, "Bad Request", "malformed request"),
            Self::ClientTimeout => (408, "Request Timeout", "client timed out"),
            Self::ClientDisconnected(_) => (400, "Bad Request", "client connection failed"),
            Self::PluginRejected(_) => (403, "Forbidden", "request rejected"),
            Self::UpstreamUnreachable(_) | Self::TlsHandshakeFailed(_) => {
                (502, "Bad Gateway", "upstream unreachable")
            }
            Self::ResourceExhausted(_) => (503, "Service Unavailable", "server at capacity"),
            Self::UpstreamTimeout => (504, "Gateway Timeout", "upstream timed out"),
            Self::PluginCrashed(_) => (502, "Bad Gateway", "internal proxy error"),
        }
    }
}
