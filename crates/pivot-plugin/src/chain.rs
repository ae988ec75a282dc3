use std::sync::Arc;

use bytes::Bytes;
use pivot_http::RequestHead;

use crate::{AccessLogEntry, FlowContext, PluginCapabilities, ProxyPlugin, RequestAction};

/// Terminal result of dispatching a request-phase hook across the chain.
#[derive(Debug)]
pub enum ChainOutcome {
    Continue,
    Respond(Vec<u8>),
    Reject { status: u16, reason: String },
}

/// The ordered plugin chain attached to one work unit.
///
/// Plugin instances are shared across work units (they are stateless between
/// connections); the chain itself is a cheap per-connection handle carrying
/// the union bitmask so no-op hook sites cost a single branch.
#[derive(Clone)]
pub struct PluginChain {
    plugins: Arc<[Arc<dyn ProxyPlugin>]>,
    capabilities: PluginCapabilities,
}

impl std::fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChain")
            .field("plugin_count", &self.plugins.len())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn ProxyPlugin>>) -> Self {
        let capabilities = plugins
            .iter()
            .fold(PluginCapabilities::default(), |acc, plugin| {
                acc.union(plugin.capabilities())
            });
        Self {
            plugins: plugins.into(),
            capabilities,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn wants(&self, capability: PluginCapabilities) -> bool {
        self.capabilities.contains(capability)
    }

    /// Dispatch `before_upstream_connection`. Plugin failures here are
    /// fail-closed: the connection is rejected.
    pub fn before_upstream_connection(
        &self,
        context: &FlowContext,
        request: &mut RequestHead,
    ) -> ChainOutcome {
        if !self.wants(PluginCapabilities::BEFORE_UPSTREAM) {
            return ChainOutcome::Continue;
        }
        for plugin in self.plugins.iter() {
            if !plugin
                .capabilities()
                .contains(PluginCapabilities::BEFORE_UPSTREAM)
            {
                continue;
            }
            match plugin.before_upstream_connection(context, request) {
                Ok(RequestAction::Continue) => {}
                Ok(RequestAction::Respond(bytes)) => return ChainOutcome::Respond(bytes),
                Ok(RequestAction::Reject { status, reason }) => {
                    return ChainOutcome::Reject { status, reason };
                }
                Err(error) => {
                    tracing::error!(
                        plugin = plugin.name(),
                        %error,
                        "plugin failed in before_upstream_connection; rejecting connection"
                    );
                    return ChainOutcome::Reject {
                        status: 502,
                        reason: "internal proxy error".to_string(),
                    };
                }
            }
        }
        ChainOutcome::Continue
    }

    /// Dispatch `on_client_request`. Plugin failures are fail-open.
    pub fn on_client_request(
        &self,
        context: &FlowContext,
        request: &mut RequestHead,
    ) -> ChainOutcome {
        if !self.wants(PluginCapabilities::CLIENT_REQUEST) {
            return ChainOutcome::Continue;
        }
        for plugin in self.plugins.iter() {
            if !plugin
                .capabilities()
                .contains(PluginCapabilities::CLIENT_REQUEST)
            {
                continue;
            }
            match plugin.on_client_request(context, request) {
                Ok(RequestAction::Continue) => {}
                Ok(RequestAction::Respond(bytes)) => return ChainOutcome::Respond(bytes),
                Ok(RequestAction::Reject { status, reason }) => {
                    return ChainOutcome::Reject { status, reason };
                }
                Err(error) => {
                    tracing::error!(
                        plugin = plugin.name(),
                        %error,
                        "plugin failed in on_client_request; continuing"
                    );
                }
            }
        }
        ChainOutcome::Continue
    }

    /// Pass a decoded request body chunk through every interested plugin.
    pub fn on_request_body_chunk(&self, context: &FlowContext, mut chunk: Bytes) -> Bytes {
        if !self.wants(PluginCapabilities::REQUEST_BODY) {
            return chunk;
        }
        for plugin in self.plugins.iter() {
            if !plugin
                .capabilities()
                .contains(PluginCapabilities::REQUEST_BODY)
            {
                continue;
            }
            match plugin.on_request_body_chunk(context, chunk.clone()) {
                Ok(rewritten) => chunk = rewritten,
                Err(error) => {
                    tracing::error!(
                        plugin = plugin.name(),
                        %error,
                        "plugin failed in on_request_body_chunk; continuing"
                    );
                }
            }
        }
        chunk
    }

    /// Pass a response chunk through every interested plugin.
    pub fn on_response_chunk(&self, context: &FlowContext, mut chunk: Bytes) -> Bytes {
        if !self.wants(PluginCapabilities::RESPONSE_CHUNK) {
            return chunk;
        }
        for plugin in self.plugins.iter() {
            if !plugin
                .capabilities()
                .contains(PluginCapabilities::RESPONSE_CHUNK)
            {
                continue;
            }
            match plugin.on_response_chunk(context, chunk.clone()) {
                Ok(rewritten) => chunk = rewritten,
                Err(error) => {
                    tracing::error!(
                        plugin = plugin.name(),
                        %error,
                        "plugin failed in on_response_chunk; continuing"
                    );
                }
            }
        }
        chunk
    }

    pub fn on_client_connection_close(&self, context: &FlowContext) {
        if !self.wants(PluginCapabilities::CONNECTION_CLOSE) {
            return;
        }
        for plugin in self.plugins.iter() {
            if plugin
                .capabilities()
                .contains(PluginCapabilities::CONNECTION_CLOSE)
            {
                plugin.on_client_connection_close(context);
            }
        }
    }

    /// Offer the access log record to the chain. Returns `None` when a
    /// plugin consumed it.
    pub fn on_access_log(
        &self,
        context: &FlowContext,
        mut entry: AccessLogEntry,
    ) -> Option<AccessLogEntry> {
        if !self.wants(PluginCapabilities::ACCESS_LOG) {
            return Some(entry);
        }
        for plugin in self.plugins.iter() {
            if !plugin
                .capabilities()
                .contains(PluginCapabilities::ACCESS_LOG)
            {
                continue;
            }
            match plugin.on_access_log(context, entry) {
                Some(rewritten) => entry = rewritten,
                None => return None,
            }
        }
        Some(entry)
    }
}
