use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("CA material missing: {0}")]
    MissingCaMaterial(String),
    #[error("CA material invalid: {0}")]
    InvalidCaMaterial(String),
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The signing authority loaded once at startup and shared read-only by
/// every worker.
#[derive(Debug)]
pub struct CaAuthority {
    pub(crate) issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    key_pem: String,
    pub(crate) cert_der: CertificateDer<'static>,
}

impl CaAuthority {
    /// Load the CA pair from PEM files. Both files must exist and agree;
    /// the proxy refuses to start interception otherwise.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        for path in [cert_path, key_path] {
            if !path.exists() {
                return Err(TlsError::MissingCaMaterial(path.display().to_string()));
            }
        }
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            TlsError::InvalidCaMaterial(format!(
                "failed to parse CA certificate {}: {error}",
                cert_path.display()
            ))
        })?;
        let ca_key = KeyPair::from_pem(&key_pem).map_err(|error| {
            TlsError::InvalidCaMaterial(format!(
                "failed to parse CA key {}: {error}",
                key_path.display()
            ))
        })?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
            TlsError::InvalidCaMaterial(format!(
                "failed to derive issuer from CA certificate {}: {error}",
                cert_path.display()
            ))
        })?;

        Ok(Self {
            issuer,
            cert_pem,
            key_pem,
            cert_der,
        })
    }

    /// Generate a fresh self-signed CA in memory. Used by tests and by
    /// operators bootstrapping trust material.
    pub fn generate(common_name: &str, organization: &str) -> Result<Self, TlsError> {
        let ca_key = KeyPair::generate()?;
        let key_pem = ca_key.serialize_pem();
        let params = ca_params(common_name, organization);
        let ca_cert = params.self_signed(&ca_key)?;
        let cert_pem = ca_cert.pem();
        let cert_der = ca_cert.der().clone();
        let issuer = Issuer::new(params, ca_key);

        Ok(Self {
            issuer,
            cert_pem,
            key_pem,
            cert_der,
        })
    }

    /// Persist the pair as PEM files, creating parent directories.
    pub fn persist(&self, cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        fs::write(cert_path, self.cert_pem.as_bytes())?;
        fs::write(key_path, self.key_pem.as_bytes())?;
        Ok(())
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

/// Load the pre-generated leaf signing key, reused for every issued
/// certificate instead of generating a fresh key per host.
pub fn load_signing_key(path: &Path) -> Result<KeyPair, TlsError> {
    if !path.exists() {
        return Err(TlsError::MissingCaMaterial(path.display().to_string()));
    }
    let key_pem = fs::read_to_string(path)?;
    KeyPair::from_pem(&key_pem).map_err(|error| {
        TlsError::InvalidCaMaterial(format!(
            "failed to parse signing key {}: {error}",
            path.display()
        ))
    })
}

fn ca_params(common_name: &str, organization: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name.to_string());
    distinguished_name.push(DnType::OrganizationName, organization.to_string());
    params.distinguished_name = distinguished_name;
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ca_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");

        let generated = CaAuthority::generate("pivot test CA", "pivot").expect("generate");
        generated.persist(&cert_path, &key_path).expect("persist");

        let loaded = CaAuthority::load(&cert_path, &key_path).expect("load");
        assert_eq!(loaded.cert_pem(), generated.cert_pem());
    }

    #[test]
    fn missing_ca_files_are_reported_as_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = CaAuthority::load(
            &dir.path().join("absent-cert.pem"),
            &dir.path().join("absent-key.pem"),
        )
        .expect_err("must fail");
        assert!(matches!(error, TlsError::MissingCaMaterial(_)));
    }

    #[test]
    fn signing_key_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("signing-key.pem");
        let key = KeyPair::generate().expect("generate key");
        fs::write(&key_path, key.serialize_pem()).expect("write key");

        let loaded = load_signing_key(&key_path).expect("load");
        assert_eq!(loaded.serialize_pem(), key.serialize_pem());

        let missing = load_signing_key(&dir.path().join("absent.pem")).expect_err("must fail");
        assert!(matches!(missing, TlsError::MissingCaMaterial(_)));
    }

    #[test]
    fn garbage_ca_files_are_reported_as_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");
        fs::write(&cert_path, "not a certificate").expect("write");
        fs::write(&key_path, "not a key").expect("write");

        let error = CaAuthority::load(&cert_path, &key_path).expect_err("must fail");
        assert!(matches!(error, TlsError::InvalidCaMaterial(_)));
    }
}
