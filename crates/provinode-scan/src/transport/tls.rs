//! Leaf-pinned TLS client configuration.
//!
//! Trust here is not the WebPKI: a paired desktop presents a
//! self-managed certificate whose SHA-256 (over the leaf DER) the
//! scanner learned during pairing. Verification hashes the presented
//! leaf and compares it to the pin in constant time; when no pin is
//! available the connection fails closed. There is no fallback to the
//! system roots.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use subtle::ConstantTimeEq;

use provinode_core::ident::{is_hex_fingerprint, normalize_fingerprint, sha256_hex};

use crate::error::{ScanError, ScanResult};
use crate::identity::ClientTlsIdentity;

/// Certificate verifier that accepts exactly one pinned leaf.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pin: String,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    /// Creates a verifier for the given fingerprint pin.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::UntrustedEndpoint`] unless the pin is a
    /// 64-character hex fingerprint.
    pub fn new(pin: &str, provider: Arc<CryptoProvider>) -> ScanResult<Self> {
        if !is_hex_fingerprint(pin) {
            return Err(ScanError::UntrustedEndpoint);
        }
        Ok(Self {
            pin: normalize_fingerprint(pin),
            provider,
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = sha256_hex(end_entity.as_ref());
        if bool::from(presented.as_bytes().ct_eq(self.pin.as_bytes())) {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(
                presented = %presented,
                "peer leaf certificate does not match pin"
            );
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds a rustls client config pinned to `pin`.
///
/// When a [`ClientTlsIdentity`] is supplied, its PEM bundle is parsed
/// into a client certificate chain and key for mutual TLS.
///
/// # Errors
///
/// [`ScanError::UntrustedEndpoint`] for a missing or malformed pin;
/// [`ScanError::IdentityCorrupt`] when the client bundle is unusable;
/// [`ScanError::TransportClosed`] for protocol configuration failures.
pub fn pinned_client_config(
    pin: &str,
    client_identity: Option<&ClientTlsIdentity>,
) -> ScanResult<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(PinnedCertVerifier::new(pin, Arc::clone(&provider))?);

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ScanError::TransportClosed(format!("tls protocol setup: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match client_identity {
        Some(identity) => {
            let (certs, key) = parse_client_bundle(&identity.bundle)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ScanError::IdentityCorrupt(format!("client TLS material: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

/// Parses a PEM client bundle into a certificate chain and private key.
fn parse_client_bundle(
    bundle: &[u8],
) -> ScanResult<(
    Vec<CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    let mut reader = std::io::BufReader::new(bundle);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ScanError::IdentityCorrupt(format!("client bundle certs: {e}")))?;
    if certs.is_empty() {
        return Err(ScanError::IdentityCorrupt(
            "client bundle has no certificates".to_string(),
        ));
    }

    let mut key_reader = std::io::BufReader::new(bundle);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ScanError::IdentityCorrupt(format!("client bundle key: {e}")))?
        .ok_or_else(|| ScanError::IdentityCorrupt("client bundle has no key".to_string()))?;

    Ok((certs, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    #[test]
    fn verifier_requires_a_plausible_pin() {
        assert!(matches!(
            PinnedCertVerifier::new("", provider()),
            Err(ScanError::UntrustedEndpoint)
        ));
        assert!(matches!(
            PinnedCertVerifier::new("not-hex", provider()),
            Err(ScanError::UntrustedEndpoint)
        ));
        assert!(PinnedCertVerifier::new(&"ab".repeat(32), provider()).is_ok());
    }

    #[test]
    fn pin_is_compared_case_insensitively() {
        let leaf = CertificateDer::from(b"fake der bytes".to_vec());
        let pin = sha256_hex(leaf.as_ref()).to_ascii_uppercase();
        let verifier = PinnedCertVerifier::new(&pin, provider()).unwrap();

        let name = ServerName::try_from("192.168.1.44".to_string()).unwrap();
        let verified = verifier.verify_server_cert(
            &leaf,
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(verified.is_ok());
    }

    #[test]
    fn wrong_leaf_fails_closed() {
        let verifier = PinnedCertVerifier::new(&"ab".repeat(32), provider()).unwrap();
        let leaf = CertificateDer::from(b"some other cert".to_vec());
        let name = ServerName::try_from("192.168.1.44".to_string()).unwrap();
        assert!(verifier
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn config_without_pin_is_refused() {
        assert!(matches!(
            pinned_client_config("", None),
            Err(ScanError::UntrustedEndpoint)
        ));
    }

    #[test]
    fn garbage_client_bundle_is_rejected() {
        use secrecy::SecretString;
        let identity = ClientTlsIdentity {
            bundle: b"definitely not pem".to_vec(),
            password: SecretString::from("pw".to_string()),
            peer_fingerprint_sha256: "ab".repeat(32),
        };
        assert!(matches!(
            pinned_client_config(&"ab".repeat(32), Some(&identity)),
            Err(ScanError::IdentityCorrupt(_))
        ));
    }
}
