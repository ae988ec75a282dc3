use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::sync::OnceCell;

use crate::ca::{CaAuthority, TlsError};

/// A leaf certificate issued for one hostname, ready to terminate client
/// TLS inside a CONNECT tunnel.
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
    pub disk_loads: u64,
}

/// Per-process certificate store.
///
/// Entries are generated on first need and retained for the process
/// lifetime. Each hostname maps to its own `OnceCell`, so a burst of
/// concurrent CONNECTs to one host performs exactly one signing operation
/// while other hostnames proceed independently. An optional directory
/// mirrors issued leaves to disk so they survive restarts.
pub struct CertificateStore {
    ca: CaAuthority,
    validity: Duration,
    cert_dir: Option<PathBuf>,
    signing_key: Option<KeyPair>,
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<IssuedLeaf>>>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
    disk_loads: AtomicU64,
}

impl CertificateStore {
    pub fn new(ca: CaAuthority, validity_days: u32, cert_dir: Option<PathBuf>) -> Self {
        Self {
            ca,
            validity: Duration::from_secs(u64::from(validity_days) * 24 * 60 * 60),
            cert_dir,
            signing_key: None,
            entries: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
            disk_loads: AtomicU64::new(0),
        }
    }

    /// Use one pre-generated key for every issued leaf instead of
    /// generating a fresh key per host.
    pub fn with_signing_key(mut self, key: KeyPair) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.ca.cert_pem()
    }

    /// Leaf material for `host`, issuing and caching it on first need.
    pub async fn leaf_for_host(&self, host: &str) -> Result<Arc<IssuedLeaf>, TlsError> {
        let normalized = normalize_host(host);
        let cell = {
            let mut entries = self.entries.lock().expect("certificate store lock poisoned");
            Arc::clone(
                entries
                    .entry(normalized.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        if cell.initialized() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let leaf = cell
            .get_or_try_init(|| async { self.load_or_issue(&normalized) })
            .await?;
        Ok(Arc::clone(leaf))
    }

    pub fn metrics_snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            disk_loads: self.disk_loads.load(Ordering::Relaxed),
        }
    }

    fn load_or_issue(&self, host: &str) -> Result<Arc<IssuedLeaf>, TlsError> {
        if let Some(dir) = &self.cert_dir {
            if let Some(leaf) = self.load_from_disk(dir, host)? {
                self.disk_loads.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::new(leaf));
            }
        }

        let leaf = self.issue(host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        if let Some(dir) = &self.cert_dir {
            persist_leaf(dir, host, &leaf)?;
        }
        Ok(Arc::new(leaf))
    }

    fn issue(&self, host: &str) -> Result<IssuedLeaf, TlsError> {
        let params = leaf_params(host, self.validity)?;
        let generated;
        let leaf_key = match &self.signing_key {
            Some(key) => key,
            None => {
                generated = KeyPair::generate()?;
                &generated
            }
        };
        let leaf_cert = params.signed_by(leaf_key, &self.ca.issuer)?;

        build_leaf(
            leaf_cert.pem(),
            leaf_key.serialize_pem(),
            leaf_cert.der().clone(),
            PrivatePkcs8KeyDer::from(leaf_key.serialize_der()).into(),
            &self.ca.cert_der,
        )
    }

    fn load_from_disk(&self, dir: &Path, host: &str) -> Result<Option<IssuedLeaf>, TlsError> {
        let cert_path = leaf_cert_path(dir, host);
        let key_path = leaf_key_path(dir, host);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;
        let cert_der = match CertificateDer::from_pem_slice(cert_pem.as_bytes()) {
            Ok(der) => der,
            // A corrupt mirror entry is not fatal; reissue over it.
            Err(_) => return Ok(None),
        };
        let Ok(key_der) = PrivateKeyDer::from_pem_slice(key_pem.as_bytes()) else {
            return Ok(None);
        };

        let leaf = build_leaf(cert_pem, key_pem, cert_der, key_der, &self.ca.cert_der)?;
        Ok(Some(leaf))
    }
}

fn build_leaf(
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
    ca_cert_der: &CertificateDer<'static>,
) -> Result<IssuedLeaf, TlsError> {
    let chain = vec![cert_der.clone(), ca_cert_der.clone()];
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key_der)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(IssuedLeaf {
        server_config: Arc::new(server_config),
        cert_pem,
        key_pem,
        cert_der,
    })
}

fn leaf_params(host: &str, validity: Duration) -> Result<CertificateParams, TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::seconds(validity.as_secs() as i64);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn leaf_cert_path(dir: &Path, host: &str) -> PathBuf {
    dir.join(format!("{host}.pem"))
}

fn leaf_key_path(dir: &Path, host: &str) -> PathBuf {
    dir.join(format!("{host}.key"))
}

/// Mirror an issued leaf to disk. Writes go to a temp file first and are
/// renamed into place so a crash never leaves a partial entry.
fn persist_leaf(dir: &Path, host: &str, leaf: &IssuedLeaf) -> Result<(), TlsError> {
    fs::create_dir_all(dir)?;
    write_via_temp(&leaf_cert_path(dir, host), leaf.cert_pem.as_bytes())?;
    write_via_temp(&leaf_key_path(dir, host), leaf.key_pem.as_bytes())?;
    Ok(())
}

fn write_via_temp(path: &Path, contents: &[u8]) -> Result<(), TlsError> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    fs::write(&temp, contents)?;
    fs::rename(&temp, path)?;
    Ok(())
}
