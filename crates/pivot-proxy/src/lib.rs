//! Fast, lightweight, pluggable, TLS-interception-capable forwarding proxy.
//!
//! One acceptor distributes client sockets round-robin over a pool of
//! workers through depth-1 inboxes; each worker owns its work units until
//! they terminate. The protocol handler classifies HTTP/1.x forward-proxy
//! requests, CONNECT tunnels, and origin-form requests, and can terminate
//! TLS on both sides of a tunnel using leaf certificates signed by a local
//! CA so plugins observe plaintext.

mod acceptor;
mod conn;
mod handler;
mod logging;
mod relay;
mod signals;
mod tunnel;
mod upstream;
mod webserver;
mod worker;

pub use conn::{AsyncReadWrite, IoStream};
pub use logging::{init_logging, LogHandle};
pub use signals::install_signal_handlers;
pub use webserver::{NotFoundResponder, OriginResponder};

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use pivot_core::{BasicAuthGuard, ConfigError, ProxyConfig};
use pivot_plugin::{
    AccessLogSink, PluginChain, PluginError, PluginRegistry, TracingAccessLog,
};
use pivot_tls::{
    build_upstream_client_config, load_signing_key, CaAuthority, CertificateStore, TlsError,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch, Semaphore};

use crate::upstream::DnsCache;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("plugin setup failed: {0}")]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    CaMaterial(#[from] TlsError),
    #[error("bind failed: {0}")]
    Bind(io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Process exit code contract: 1 configuration, 2 bind, 3 CA material.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Plugin(_) => 1,
            Self::Bind(_) => 2,
            Self::CaMaterial(_) => 3,
            Self::Io(_) => 1,
        }
    }
}

/// State swapped atomically on SIGHUP reload: the plugin chain template and
/// the certificate store (CA material is re-read from disk).
pub(crate) struct ReloadableState {
    chain: PluginChain,
    cert_store: Option<Arc<CertificateStore>>,
}

pub(crate) struct ServerShared {
    pub config: Arc<ProxyConfig>,
    pub auth: Option<BasicAuthGuard>,
    registry: PluginRegistry,
    reloadable: RwLock<ReloadableState>,
    pub access_log: Arc<dyn AccessLogSink>,
    pub origin: Arc<dyn OriginResponder>,
    pub upstream_tls: Arc<rustls::ClientConfig>,
    pub dns_cache: DnsCache,
    flow_counter: AtomicU64,
}

impl ServerShared {
    pub(crate) fn chain(&self) -> PluginChain {
        self.reloadable
            .read()
            .expect("reloadable state lock poisoned")
            .chain
            .clone()
    }

    pub(crate) fn cert_store(&self) -> Option<Arc<CertificateStore>> {
        self.reloadable
            .read()
            .expect("reloadable state lock poisoned")
            .cert_store
            .clone()
    }

    pub(crate) fn next_flow_id(&self) -> u64 {
        self.flow_counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Builder for a [`ProxyServer`]; lets embedders mount their own plugin
/// registry, access-log sink, and web-server collaborator.
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    registry: PluginRegistry,
    access_log: Arc<dyn AccessLogSink>,
    origin: Arc<dyn OriginResponder>,
}

impl ProxyServerBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            registry: PluginRegistry::with_builtins(),
            access_log: Arc::new(TracingAccessLog),
            origin: Arc::new(NotFoundResponder),
        }
    }

    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn access_log(mut self, sink: Arc<dyn AccessLogSink>) -> Self {
        self.access_log = sink;
        self
    }

    pub fn origin_responder(mut self, responder: Arc<dyn OriginResponder>) -> Self {
        self.origin = responder;
        self
    }

    pub fn build(self) -> Result<ProxyServer, ServerError> {
        self.config.validate()?;
        let reloadable = build_reloadable(&self.config, &self.registry)?;
        let auth = self.config.basic_auth.as_deref().map(BasicAuthGuard::new);
        let upstream_tls =
            build_upstream_client_config(self.config.upstream_tls_insecure_skip_verify);

        Ok(ProxyServer {
            shared: Arc::new(ServerShared {
                config: Arc::new(self.config),
                auth,
                registry: self.registry,
                reloadable: RwLock::new(reloadable),
                access_log: self.access_log,
                origin: self.origin,
                upstream_tls,
                dns_cache: DnsCache::default(),
                flow_counter: AtomicU64::new(1),
            }),
        })
    }
}

fn build_reloadable(
    config: &ProxyConfig,
    registry: &PluginRegistry,
) -> Result<ReloadableState, ServerError> {
    let chain = registry.build_chain(&config.plugins, &config.plugin_settings)?;
    let cert_store = match (&config.ca_cert_file, &config.ca_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let ca = CaAuthority::load(cert_path, key_path)?;
            let mut store =
                CertificateStore::new(ca, config.cert_validity_days, config.ca_cert_dir.clone());
            if let Some(signing_key_path) = &config.ca_signing_key_file {
                store = store.with_signing_key(load_signing_key(signing_key_path)?);
            }
            Some(Arc::new(store))
        }
        _ => None,
    };
    Ok(ReloadableState { chain, cert_store })
}

/// The proxy server. Cheap to clone; clones share all runtime state.
#[derive(Clone)]
pub struct ProxyServer {
    shared: Arc<ServerShared>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        ProxyServerBuilder::new(config).build()
    }

    pub fn builder(config: ProxyConfig) -> ProxyServerBuilder {
        ProxyServerBuilder::new(config)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    /// Rebuild the plugin chain and reload CA material from disk. Existing
    /// connections keep the chain they started with.
    pub fn reload(&self) -> Result<(), ServerError> {
        let fresh = build_reloadable(&self.shared.config, &self.shared.registry)?;
        *self
            .shared
            .reloadable
            .write()
            .expect("reloadable state lock poisoned") = fresh;
        tracing::info!("reloaded plugin chain and CA material");
        Ok(())
    }

    /// Bind the listening socket with `SO_REUSEADDR` (and `SO_REUSEPORT`
    /// where supported) and the configured backlog.
    pub async fn bind_listener(&self) -> Result<TcpListener, ServerError> {
        let config = &self.shared.config;
        let mut addrs =
            tokio::net::lookup_host((config.hostname.as_str(), config.port))
                .await
                .map_err(ServerError::Bind)?;
        let addr = addrs.next().ok_or_else(|| {
            ServerError::Bind(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve", config.hostname),
            ))
        })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ServerError::Bind)?;
        socket.set_reuseaddr(true).map_err(ServerError::Bind)?;
        #[cfg(unix)]
        socket.set_reuseport(true).map_err(ServerError::Bind)?;
        socket.bind(addr).map_err(ServerError::Bind)?;
        let listener = socket
            .listen(config.backlog)
            .map_err(ServerError::Bind)?;

        tracing::info!(addr = %addr, workers = config.effective_workers(), "listening");
        Ok(listener)
    }

    /// Run the acceptor and worker pool over an already-bound listener until
    /// the shutdown flag flips, then drain workers through the grace period.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let worker_count = self.shared.config.effective_workers();
        let gate = Arc::new(Semaphore::new(
            self.shared.config.max_concurrent_connections,
        ));

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            // Depth 1: a busy worker pushes back on the acceptor instead of
            // queueing connections invisibly.
            let (sender, receiver) = mpsc::channel(1);
            senders.push(sender);
            workers.push(tokio::spawn(worker::run_worker(
                Arc::clone(&self.shared),
                receiver,
                shutdown.clone(),
            )));
        }

        acceptor::run_acceptor(
            Arc::clone(&self.shared),
            listener,
            senders,
            shutdown,
            gate,
        )
        .await;

        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Bind and serve until shutdown.
    pub async fn run_until_shutdown(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener, shutdown)
            .await
            .map_err(ServerError::Io)
    }
}
