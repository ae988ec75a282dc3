//! Lifecycle plugin dispatch for the pivot proxy.
//!
//! Plugins are a capability set: a record of optional hooks declared up
//! front via a bitmask, so each dispatch site pays one branch when no
//! plugin registered for it. Dispatch is strictly ordered; the first plugin
//! returning a terminal outcome short-circuits the rest of the chain.

mod builtins;
mod chain;
mod context;
mod registry;

pub use builtins::{AppendHeadersPlugin, UrlFilterPlugin};
pub use chain::{ChainOutcome, PluginChain};
pub use context::{
    AccessLogEntry, AccessLogSink, FlowContext, TracingAccessLog, VecAccessLog,
};
pub use registry::PluginRegistry;

use bytes::Bytes;
use pivot_http::RequestHead;
use thiserror::Error;

/// Failure raised inside a plugin hook. Treated as `continue` (fail-open)
/// everywhere except `before_upstream_connection`, where it becomes a
/// rejection (fail-closed).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

/// Hook sites a plugin participates in. Hooks not declared here are never
/// invoked for the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginCapabilities(u8);

impl PluginCapabilities {
    pub const BEFORE_UPSTREAM: Self = Self(1 << 0);
    pub const CLIENT_REQUEST: Self = Self(1 << 1);
    pub const REQUEST_BODY: Self = Self(1 << 2);
    pub const RESPONSE_CHUNK: Self = Self(1 << 3);
    pub const CONNECTION_CLOSE: Self = Self(1 << 4);
    pub const ACCESS_LOG: Self = Self(1 << 5);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Outcome of a request-phase hook.
#[derive(Debug)]
pub enum RequestAction {
    /// Proceed; the request may have been rewritten in place.
    Continue,
    /// Skip the upstream entirely and send these response bytes.
    Respond(Vec<u8>),
    /// Deny the connection with a synthesized error response.
    Reject { status: u16, reason: String },
}

/// A proxy lifecycle plugin. Hooks run on the connection's worker and must
/// not block; long operations are the plugin author's responsibility to
/// offload.
pub trait ProxyPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> PluginCapabilities;

    /// Runs before any upstream connection is opened. May veto the
    /// connection or answer from cache.
    fn before_upstream_connection(
        &self,
        _context: &FlowContext,
        _request: &mut RequestHead,
    ) -> Result<RequestAction, PluginError> {
        Ok(RequestAction::Continue)
    }

    /// Runs once the request head is complete, before dispatch upstream.
    fn on_client_request(
        &self,
        _context: &FlowContext,
        _request: &mut RequestHead,
    ) -> Result<RequestAction, PluginError> {
        Ok(RequestAction::Continue)
    }

    /// Observes each decoded request body chunk in arrival order.
    fn on_request_body_chunk(
        &self,
        _context: &FlowContext,
        chunk: Bytes,
    ) -> Result<Bytes, PluginError> {
        Ok(chunk)
    }

    /// Observes (and may rewrite) each response chunk flowing to the client.
    fn on_response_chunk(
        &self,
        _context: &FlowContext,
        chunk: Bytes,
    ) -> Result<Bytes, PluginError> {
        Ok(chunk)
    }

    fn on_client_connection_close(&self, _context: &FlowContext) {}

    /// May rewrite the access log record, or consume it by returning `None`.
    fn on_access_log(
        &self,
        _context: &FlowContext,
        entry: AccessLogEntry,
    ) -> Option<AccessLogEntry> {
        Some(entry)
    }
}
