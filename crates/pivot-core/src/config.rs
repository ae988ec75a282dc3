use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parent proxy endpoint for upstream chaining. When set, forward-proxy
/// requests and CONNECT tunnels are dispatched to this proxy instead of the
/// origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamProxyConfig {
    pub hostname: String,
    pub port: u16,
}

/// Runtime configuration, parsed once at startup and shared read-only with
/// every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub hostname: String,
    pub port: u16,
    /// Worker count; 0 means one per logical CPU.
    pub num_workers: usize,
    pub backlog: u32,
    pub client_recvbuf_size: usize,
    pub server_recvbuf_size: usize,
    pub max_concurrent_connections: usize,
    /// Idle seconds after which an inactive connection is dropped.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub ca_cert_file: Option<PathBuf>,
    pub ca_key_file: Option<PathBuf>,
    /// Optional pre-generated leaf signing key, reused for every issued
    /// certificate instead of generating a fresh key per host.
    pub ca_signing_key_file: Option<PathBuf>,
    /// Directory mirroring issued leaf certificates across restarts.
    pub ca_cert_dir: Option<PathBuf>,
    pub cert_validity_days: u32,
    pub upstream_tls_insecure_skip_verify: bool,
    /// Ordered plugin identifiers; order defines rewrite precedence.
    pub plugins: Vec<String>,
    /// Per-plugin settings, keyed by plugin identifier.
    pub plugin_settings: BTreeMap<String, serde_json::Value>,
    pub pid_file: Option<PathBuf>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Route every connection as a raw tunnel without HTTP parsing.
    pub disable_http_proxy: bool,
    /// Hand authority-less origin-form requests to the embedded web server
    /// collaborator instead of rejecting them.
    pub enable_web_server: bool,
    /// `user:pass` credentials required on Proxy-Authorization.
    pub basic_auth: Option<String>,
    /// Receiver token appended as a `Via` header, e.g. `1.1 pivot`.
    pub via_header: Option<String>,
    /// Header names removed before dispatching requests upstream.
    pub disable_headers: Vec<String>,
    pub upstream_proxy: Option<UpstreamProxyConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 8899,
            num_workers: 0,
            backlog: 128,
            client_recvbuf_size: 64 * 1024,
            server_recvbuf_size: 64 * 1024,
            max_concurrent_connections: 1024,
            timeout_secs: 30,
            connect_timeout_secs: 10,
            shutdown_grace_secs: 10,
            ca_cert_file: None,
            ca_key_file: None,
            ca_signing_key_file: None,
            ca_cert_dir: None,
            cert_validity_days: 365,
            upstream_tls_insecure_skip_verify: false,
            plugins: Vec::new(),
            plugin_settings: BTreeMap::new(),
            pid_file: None,
            log_level: "info".to_string(),
            log_file: None,
            disable_http_proxy: false,
            enable_web_server: false,
            basic_auth: None,
            via_header: None,
            disable_headers: Vec::new(),
            upstream_proxy: None,
        }
    }
}

impl ProxyConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|error| ConfigError::Unreadable {
            path: path.to_path_buf(),
            detail: error.to_string(),
        })?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|error| ConfigError::Invalid {
                path: path.to_path_buf(),
                detail: error.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::EmptyHostname);
        }
        if self.backlog == 0 {
            return Err(ConfigError::ZeroValue("backlog"));
        }
        if self.client_recvbuf_size == 0 {
            return Err(ConfigError::ZeroValue("client_recvbuf_size"));
        }
        if self.server_recvbuf_size == 0 {
            return Err(ConfigError::ZeroValue("server_recvbuf_size"));
        }
        if self.max_concurrent_connections == 0 {
            return Err(ConfigError::ZeroValue("max_concurrent_connections"));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("timeout_secs"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("connect_timeout_secs"));
        }
        if self.cert_validity_days == 0 {
            return Err(ConfigError::ZeroValue("cert_validity_days"));
        }
        if self.ca_cert_file.is_some() != self.ca_key_file.is_some() {
            return Err(ConfigError::InvalidCaPathPair);
        }
        if self.ca_signing_key_file.is_some() && self.ca_cert_file.is_none() {
            return Err(ConfigError::SigningKeyWithoutCa);
        }
        if let Some(credentials) = &self.basic_auth {
            if !credentials.contains(':') {
                return Err(ConfigError::InvalidBasicAuth);
            }
        }
        if parse_log_level(&self.log_level).is_none() {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        if let Some(proxy) = &self.upstream_proxy {
            if proxy.hostname.trim().is_empty() {
                return Err(ConfigError::EmptyUpstreamProxyHost);
            }
            if proxy.port == 0 {
                return Err(ConfigError::ZeroValue("upstream_proxy.port"));
            }
        }
        if self.plugins.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::EmptyPluginName);
        }
        Ok(())
    }

    /// TLS interception is active only when the CA material pair is
    /// configured.
    pub fn tls_interception_enabled(&self) -> bool {
        self.ca_cert_file.is_some() && self.ca_key_file.is_some()
    }

    /// Worker count with the 0-means-auto default resolved.
    pub fn effective_workers(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get()
        } else {
            self.num_workers
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

pub(crate) fn parse_log_level(level: &str) -> Option<&'static str> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config file {path} could not be read: {detail}")]
    Unreadable { path: PathBuf, detail: String },
    #[error("config file {path} is invalid: {detail}")]
    Invalid { path: PathBuf, detail: String },
    #[error("hostname must not be empty")]
    EmptyHostname,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("ca_cert_file and ca_key_file must be provided together")]
    InvalidCaPathPair,
    #[error("ca_signing_key_file requires ca_cert_file and ca_key_file")]
    SigningKeyWithoutCa,
    #[error("basic_auth must be of the form user:pass")]
    InvalidBasicAuth,
    #[error("unknown log level: {0}")]
    InvalidLogLevel(String),
    #[error("upstream_proxy.hostname must not be empty")]
    EmptyUpstreamProxyHost,
    #[error("plugins must not contain empty identifiers")]
    EmptyPluginName,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        ProxyConfig::default().validate().expect("valid");
    }

    #[test]
    fn rejects_partial_ca_pair() {
        let config = ProxyConfig {
            ca_cert_file: Some(PathBuf::from("/tmp/ca.pem")),
            ..ProxyConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidCaPathPair));
    }

    #[test]
    fn rejects_basic_auth_without_separator() {
        let config = ProxyConfig {
            basic_auth: Some("justuser".to_string()),
            ..ProxyConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidBasicAuth));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let config = ProxyConfig {
            log_level: "loud".to_string(),
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn interception_requires_ca_material() {
        let mut config = ProxyConfig::default();
        assert!(!config.tls_interception_enabled());
        config.ca_cert_file = Some(PathBuf::from("/tmp/ca.pem"));
        config.ca_key_file = Some(PathBuf::from("/tmp/ca.key"));
        assert!(config.tls_interception_enabled());
    }

    #[test]
    fn zero_workers_resolves_to_cpu_count() {
        let config = ProxyConfig::default();
        assert!(config.effective_workers() >= 1);
        let pinned = ProxyConfig {
            num_workers: 3,
            ..ProxyConfig::default()
        };
        assert_eq!(pinned.effective_workers(), 3);
    }

    #[test]
    fn loads_config_from_json_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"port": 9000, "plugins": ["url_filter"], "basic_auth": "u:p"}"#,
        )
        .expect("write config");

        let config = ProxyConfig::from_file(&path).expect("load");
        assert_eq!(config.port, 9000);
        assert_eq!(config.plugins, vec!["url_filter".to_string()]);
        assert_eq!(config.hostname, "127.0.0.1");
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"no_such_option": true}"#).expect("write config");
        assert!(matches!(
            ProxyConfig::from_file(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
