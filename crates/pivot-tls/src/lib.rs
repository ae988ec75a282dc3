//! CA material and TLS session configuration for the pivot proxy.
//!
//! The interceptor terminates TLS on the client side with leaf certificates
//! signed by a user-provided CA and opens a validating TLS session to the
//! real upstream. Leaf issuance is cached per hostname with a single-flight
//! guarantee so concurrent tunnels to the same host trigger one signing
//! operation.

mod ca;
mod store;

pub use ca::{load_signing_key, CaAuthority, TlsError};
pub use store::{CertificateStore, IssuedLeaf, StoreMetricsSnapshot};

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

/// Client-side TLS configuration for upstream sessions. Validation uses the
/// webpki root set unless `insecure_skip_verify` is set, which is a testing
/// policy flag only.
pub fn build_upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DisabledCertVerification))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[derive(Debug)]
struct DisabledCertVerification;

impl ServerCertVerifier for DisabledCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_client_config_pins_http1_alpn() {
        let secure = build_upstream_client_config(false);
        assert_eq!(secure.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let insecure = build_upstream_client_config(true);
        assert_eq!(insecure.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
