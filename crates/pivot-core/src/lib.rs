//! Configuration, error taxonomy, and shared policy for the pivot proxy.

mod auth;
mod config;
mod error;

pub use auth::{basic_auth_challenge, BasicAuthGuard};
pub use config::{ConfigError, ProxyConfig, UpstreamProxyConfig};
pub use error::ProxyError;
