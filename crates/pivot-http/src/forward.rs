use thiserror::Error;

use crate::{parse_absolute_form, BodyMode, Header, RequestHead};

/// Hop-by-hop headers stripped before a request is dispatched upstream.
/// `Proxy-Connection` is undocumented but widely emitted; `Proxy-Authorization`
/// is of no use beyond this hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RewriteError {
    #[error("request target is not absolute-form or origin-form")]
    InvalidTarget,
    #[error("origin-form request carries no Host header")]
    MissingHost,
}

/// Knobs applied while rewriting a client request for upstream dispatch.
#[derive(Debug, Clone, Default)]
pub struct ForwardRewrite {
    /// `Via` receiver token to append, e.g. `1.1 pivot`.
    pub via: Option<String>,
    /// Additional header names to drop before dispatch.
    pub disable_headers: Vec<String>,
    /// Keep the absolute-form target (used when chaining to a parent proxy).
    pub keep_absolute_target: bool,
}

/// Resolved upstream route plus the rewritten head to send there.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub host: String,
    pub port: u16,
    pub head: RequestHead,
}

/// Rewrite a forward-proxy request for upstream dispatch: resolve the target
/// host/port, reformat the request-target to origin-form (unless chaining),
/// strip hop-by-hop headers plus anything the client named in `Connection`,
/// and append `Via` when configured.
pub fn build_forward_request_head(
    head: &RequestHead,
    default_port: u16,
    rewrite: &ForwardRewrite,
) -> Result<ForwardRequest, RewriteError> {
    let (host, port, origin_path) = resolve_target(head, default_port)?;

    let connection_named = head.headers.tokens("connection");
    let mut out = head.clone();
    if !rewrite.keep_absolute_target {
        out.target = origin_path;
    }

    let chunked = head.body_mode == BodyMode::Chunked;
    let mut drop_names: Vec<&str> = HOP_BY_HOP.to_vec();
    // Transfer-Encoding still frames the body we are about to relay; only
    // strip it when the request is not actually chunked.
    if !chunked {
        drop_names.push("transfer-encoding");
    }
    for name in &connection_named {
        drop_names.push(name.as_str());
    }
    for name in &rewrite.disable_headers {
        drop_names.push(name.as_str());
    }
    out.headers.remove_all(&drop_names);

    if let Some(via) = &rewrite.via {
        out.headers.push(Header::new("Via", via.clone()));
    }

    Ok(ForwardRequest {
        host,
        port,
        head: out,
    })
}

/// Resolve the upstream host, port, and origin-form path of a request.
/// Absolute-form targets carry their own authority; origin-form targets fall
/// back to the `Host` header and `default_port`.
pub fn resolve_target(
    head: &RequestHead,
    default_port: u16,
) -> Result<(String, u16, String), RewriteError> {
    if let Some((host, port, path)) = parse_absolute_form(&head.target) {
        return Ok((host, port, path));
    }
    if head.target.starts_with('/') {
        let host_header = head.headers.first("host").ok_or(RewriteError::MissingHost)?;
        let (host, port) = match crate::parse_authority(host_header) {
            Some(parts) => parts,
            None => (host_header.to_string(), default_port),
        };
        return Ok((host, port, head.target.clone()));
    }
    Err(RewriteError::InvalidTarget)
}
