//! Persistent device identity.
//!
//! Each scanner owns exactly one identity document: a stable 26-char
//! device id and an ECDSA P-256 signing keypair, created on first use
//! and kept for the lifetime of the install. During pairing the desktop
//! may hand back a client mutual-TLS bundle; that bundle (and its
//! passphrase) is sealed with AES-256-GCM under a key derived from the
//! signing scalar before it ever touches disk.
//!
//! Earlier releases stored the client-TLS triple in plaintext fields;
//! those are migrated to the sealed form on load and cleared.

use std::path::{Path, PathBuf};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{info, warn};

use provinode_core::ident::{normalize_fingerprint, sha256_hex, ScanId};

use crate::error::{ScanError, ScanResult};
use crate::fsutil;

/// Version tag stored alongside the sealed client-TLS blob.
pub const TLS_SEAL_VERSION: &str = "provinode.scan.tls.v1";

/// Fixed HKDF info string for the identity sealing key.
const SEAL_HKDF_INFO: &str = "provinode.scan.identity.hkdf.v1";

/// HKDF salt prefix; the device id is appended.
const SEAL_SALT_PREFIX: &str = "scan-device:";

const NONCE_LEN: usize = 12;

/// On-disk identity document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityDocument {
    device_id: String,
    signing_key_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_tls_sealed_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_tls_version: Option<String>,
    // Legacy plaintext fields, read for migration and never written back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_tls_bundle_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_tls_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_tls_fingerprint: Option<String>,
}

/// Sealed client-TLS plaintext, serialized then encrypted.
#[derive(Debug, Serialize, Deserialize)]
struct SealedTlsFields {
    bytes_b64: String,
    password: String,
    fingerprint_lower: String,
}

/// Derived identity material handed to the rest of the agent.
#[derive(Clone)]
pub struct DeviceIdentity {
    /// Stable device identifier.
    pub device_id: String,
    /// The device signing key.
    pub signing_key: SigningKey,
    /// SHA-256 hex over the X9.63-uncompressed public key.
    pub cert_fingerprint_sha256: String,
    /// Base64 of the X9.63-uncompressed public key.
    pub public_key_b64: String,
    /// Base64 of the raw private scalar.
    pub private_key_b64: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("cert_fingerprint_sha256", &self.cert_fingerprint_sha256)
            .finish_non_exhaustive()
    }
}

/// Client mutual-TLS material installed during pairing.
pub struct ClientTlsIdentity {
    /// Opaque credential bundle bytes.
    pub bundle: Vec<u8>,
    /// Bundle passphrase.
    pub password: SecretString,
    /// Fingerprint the desktop agreed to present.
    pub peer_fingerprint_sha256: String,
}

impl std::fmt::Debug for ClientTlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTlsIdentity")
            .field("bundle_len", &self.bundle.len())
            .field("peer_fingerprint_sha256", &self.peer_fingerprint_sha256)
            .finish_non_exhaustive()
    }
}

/// Single-writer store for the identity document.
pub struct IdentityStore {
    path: PathBuf,
    inner: Mutex<IdentityDocument>,
}

impl IdentityStore {
    /// Opens the store at `path`, creating a fresh identity if absent.
    ///
    /// Legacy plaintext client-TLS fields are migrated (sealed and the
    /// document rewritten) before the store is returned.
    ///
    /// # Errors
    ///
    /// [`ScanError::IdentityCorrupt`] when the document or stored key
    /// cannot be parsed, [`ScanError::LegacyMigrationIncomplete`] when
    /// only part of the legacy triple is present.
    pub async fn open(path: impl Into<PathBuf>) -> ScanResult<Self> {
        let path = path.into();
        let document = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<IdentityDocument>(&bytes)
                .map_err(|e| ScanError::IdentityCorrupt(format!("document parse: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let document = Self::fresh_document();
                persist(&path, &document).await?;
                info!(device_id = %document.device_id, "created device identity");
                document
            }
            Err(e) => return Err(ScanError::IdentityCorrupt(format!("document read: {e}"))),
        };

        // Validate the stored key eagerly so corruption is fatal at
        // startup, not at first use.
        decode_signing_key(&document.signing_key_b64)?;

        let store = Self {
            path,
            inner: Mutex::new(document),
        };
        store.migrate_legacy_tls().await?;
        Ok(store)
    }

    fn fresh_document() -> IdentityDocument {
        let signing_key = SigningKey::random(&mut OsRng);
        IdentityDocument {
            device_id: ScanId::generate().to_string(),
            signing_key_b64: BASE64.encode(signing_key.to_bytes()),
            client_tls_sealed_b64: None,
            client_tls_version: None,
            client_tls_bundle_b64: None,
            client_tls_password: None,
            client_tls_fingerprint: None,
        }
    }

    /// Returns the derived identity material.
    ///
    /// # Errors
    ///
    /// [`ScanError::IdentityCorrupt`] when the stored key is unusable.
    pub async fn material(&self) -> ScanResult<DeviceIdentity> {
        let document = self.inner.lock().await;
        let signing_key = decode_signing_key(&document.signing_key_b64)?;
        let public_x963 = signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();

        Ok(DeviceIdentity {
            device_id: document.device_id.clone(),
            cert_fingerprint_sha256: sha256_hex(&public_x963),
            public_key_b64: BASE64.encode(&public_x963),
            private_key_b64: document.signing_key_b64.clone(),
            signing_key,
        })
    }

    /// Reads the client mutual-TLS bundle, if one has been installed.
    ///
    /// # Errors
    ///
    /// [`ScanError::IdentityCorrupt`] when the sealed blob cannot be
    /// opened or has an unknown seal version.
    pub async fn client_tls_identity(&self) -> ScanResult<Option<ClientTlsIdentity>> {
        let document = self.inner.lock().await;
        let Some(sealed_b64) = document.client_tls_sealed_b64.as_deref() else {
            return Ok(None);
        };
        if document.client_tls_version.as_deref() != Some(TLS_SEAL_VERSION) {
            return Err(ScanError::IdentityCorrupt(format!(
                "unknown client TLS seal version: {:?}",
                document.client_tls_version
            )));
        }

        let fields = open_sealed(&document, sealed_b64)?;
        let bundle = BASE64
            .decode(&fields.bytes_b64)
            .map_err(|e| ScanError::IdentityCorrupt(format!("sealed bundle base64: {e}")))?;
        Ok(Some(ClientTlsIdentity {
            bundle,
            password: SecretString::from(fields.password),
            peer_fingerprint_sha256: fields.fingerprint_lower,
        }))
    }

    /// Seals and persists the client mutual-TLS bundle.
    ///
    /// Any legacy plaintext fields are cleared by the same write.
    ///
    /// # Errors
    ///
    /// [`ScanError::IdentityCorrupt`] when sealing or persisting fails.
    pub async fn persist_client_tls_identity(
        &self,
        bundle: &[u8],
        password: &SecretString,
        peer_fingerprint_sha256: &str,
    ) -> ScanResult<()> {
        let mut document = self.inner.lock().await;
        let fields = SealedTlsFields {
            bytes_b64: BASE64.encode(bundle),
            password: password.expose_secret().clone(),
            fingerprint_lower: normalize_fingerprint(peer_fingerprint_sha256),
        };
        let sealed = seal(&document, &fields)?;

        document.client_tls_sealed_b64 = Some(sealed);
        document.client_tls_version = Some(TLS_SEAL_VERSION.to_string());
        document.client_tls_bundle_b64 = None;
        document.client_tls_password = None;
        document.client_tls_fingerprint = None;

        persist(&self.path, &document).await?;
        info!(device_id = %document.device_id, "client TLS identity sealed");
        Ok(())
    }

    /// Migrates a legacy plaintext client-TLS triple to the sealed form.
    async fn migrate_legacy_tls(&self) -> ScanResult<()> {
        let mut document = self.inner.lock().await;
        let present = [
            document.client_tls_bundle_b64.is_some(),
            document.client_tls_password.is_some(),
            document.client_tls_fingerprint.is_some(),
        ];
        if present.iter().all(|p| !p) {
            return Ok(());
        }
        if !present.iter().all(|p| *p) {
            return Err(ScanError::LegacyMigrationIncomplete);
        }

        let fields = SealedTlsFields {
            bytes_b64: document.client_tls_bundle_b64.clone().unwrap_or_default(),
            password: document.client_tls_password.clone().unwrap_or_default(),
            fingerprint_lower: normalize_fingerprint(
                document.client_tls_fingerprint.as_deref().unwrap_or_default(),
            ),
        };
        let sealed = seal(&document, &fields)?;

        document.client_tls_sealed_b64 = Some(sealed);
        document.client_tls_version = Some(TLS_SEAL_VERSION.to_string());
        document.client_tls_bundle_b64 = None;
        document.client_tls_password = None;
        document.client_tls_fingerprint = None;

        persist(&self.path, &document).await?;
        warn!(device_id = %document.device_id, "migrated legacy plaintext client TLS fields");
        Ok(())
    }
}

fn decode_signing_key(b64: &str) -> ScanResult<SigningKey> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| ScanError::IdentityCorrupt(format!("signing key base64: {e}")))?;
    SigningKey::from_slice(&bytes)
        .map_err(|e| ScanError::IdentityCorrupt(format!("signing key parse: {e}")))
}

/// Derives the 256-bit sealing key from the signing scalar.
fn sealing_key(document: &IdentityDocument) -> ScanResult<[u8; 32]> {
    let scalar = BASE64
        .decode(&document.signing_key_b64)
        .map_err(|e| ScanError::IdentityCorrupt(format!("signing key base64: {e}")))?;
    let salt = format!("{SEAL_SALT_PREFIX}{}", document.device_id);

    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), &scalar);
    let mut okm = [0u8; 32];
    hk.expand(SEAL_HKDF_INFO.as_bytes(), &mut okm)
        .map_err(|e| ScanError::IdentityCorrupt(format!("hkdf expand: {e}")))?;
    Ok(okm)
}

fn seal(document: &IdentityDocument, fields: &SealedTlsFields) -> ScanResult<String> {
    let key = sealing_key(document)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let plaintext = serde_json::to_vec(fields)
        .map_err(|e| ScanError::IdentityCorrupt(format!("seal encode: {e}")))?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| ScanError::IdentityCorrupt("seal encrypt failed".to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(BASE64.encode(blob))
}

fn open_sealed(document: &IdentityDocument, sealed_b64: &str) -> ScanResult<SealedTlsFields> {
    let blob = BASE64
        .decode(sealed_b64)
        .map_err(|e| ScanError::IdentityCorrupt(format!("sealed blob base64: {e}")))?;
    if blob.len() <= NONCE_LEN {
        return Err(ScanError::IdentityCorrupt("sealed blob truncated".to_string()));
    }
    let (nonce, sealed) = blob.split_at(NONCE_LEN);

    let key = sealing_key(document)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| ScanError::IdentityCorrupt("sealed blob authentication failed".to_string()))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| ScanError::IdentityCorrupt(format!("sealed blob parse: {e}")))
}

async fn persist(path: &Path, document: &IdentityDocument) -> ScanResult<()> {
    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|e| ScanError::IdentityCorrupt(format!("document encode: {e}")))?;
    fsutil::write_atomic(path, &bytes)
        .await
        .map_err(|e| ScanError::IdentityCorrupt(format!("document write: {e}")))?;
    fsutil::mark_no_backup(path).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("identity.json")
    }

    #[tokio::test]
    async fn creates_identity_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::open(store_path(&dir)).await.unwrap();
        let material = store.material().await.unwrap();

        assert_eq!(material.device_id.len(), 26);
        assert_eq!(material.cert_fingerprint_sha256.len(), 64);
        // X9.63 uncompressed P-256 keys are 65 bytes.
        assert_eq!(BASE64.decode(&material.public_key_b64).unwrap().len(), 65);
        assert_eq!(BASE64.decode(&material.private_key_b64).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn two_reads_agree_and_recreation_diverges() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let first = IdentityStore::open(&path).await.unwrap();
        let a = first.material().await.unwrap();
        let b = first.material().await.unwrap();
        assert_eq!(a.device_id, b.device_id);
        assert_eq!(a.private_key_b64, b.private_key_b64);

        drop(first);
        let reread = IdentityStore::open(&path).await.unwrap();
        let c = reread.material().await.unwrap();
        assert_eq!(a.device_id, c.device_id);

        tokio::fs::remove_file(&path).await.unwrap();
        let recreated = IdentityStore::open(&path).await.unwrap();
        let d = recreated.material().await.unwrap();
        assert_ne!(a.device_id, d.device_id);
        assert_ne!(a.private_key_b64, d.private_key_b64);
    }

    #[tokio::test]
    async fn client_tls_identity_roundtrip_without_plaintext_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let store = IdentityStore::open(&path).await.unwrap();

        let bundle = b"OPAQUE-MTLS-BUNDLE-BYTES";
        let password = SecretString::from("bundle-pass-123".to_string());
        store
            .persist_client_tls_identity(bundle, &password, &"CD".repeat(32))
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains(&BASE64.encode(bundle)));
        assert!(!raw.contains("bundle-pass-123"));
        assert!(raw.contains(TLS_SEAL_VERSION));

        let tls = store.client_tls_identity().await.unwrap().unwrap();
        assert_eq!(tls.bundle, bundle);
        assert_eq!(tls.password.expose_secret(), "bundle-pass-123");
        assert_eq!(tls.peer_fingerprint_sha256, "cd".repeat(32));
    }

    #[tokio::test]
    async fn missing_bundle_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::open(store_path(&dir)).await.unwrap();
        assert!(store.client_tls_identity().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn legacy_plaintext_triple_is_migrated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let signing_key = SigningKey::random(&mut OsRng);
        let legacy = serde_json::json!({
            "device_id": "01LEGACYDEVICE0000000000AA",
            "signing_key_b64": BASE64.encode(signing_key.to_bytes()),
            "client_tls_bundle_b64": BASE64.encode(b"legacy-bundle"),
            "client_tls_password": "legacy-pass",
            "client_tls_fingerprint": "EF".repeat(32),
        });
        tokio::fs::write(&path, serde_json::to_vec(&legacy).unwrap())
            .await
            .unwrap();

        let store = IdentityStore::open(&path).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains("legacy-pass"));
        assert!(!raw.contains(&BASE64.encode(b"legacy-bundle")));

        let tls = store.client_tls_identity().await.unwrap().unwrap();
        assert_eq!(tls.bundle, b"legacy-bundle");
        assert_eq!(tls.password.expose_secret(), "legacy-pass");
        assert_eq!(tls.peer_fingerprint_sha256, "ef".repeat(32));
    }

    #[tokio::test]
    async fn partial_legacy_triple_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let signing_key = SigningKey::random(&mut OsRng);
        let legacy = serde_json::json!({
            "device_id": "01LEGACYDEVICE0000000000AB",
            "signing_key_b64": BASE64.encode(signing_key.to_bytes()),
            "client_tls_password": "orphan-pass",
        });
        tokio::fs::write(&path, serde_json::to_vec(&legacy).unwrap())
            .await
            .unwrap();

        let result = IdentityStore::open(&path).await;
        assert!(matches!(result, Err(ScanError::LegacyMigrationIncomplete)));
    }

    #[tokio::test]
    async fn malformed_signing_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let doc = serde_json::json!({
            "device_id": "01BADKEYDEVICE0000000000AC",
            "signing_key_b64": "not base64 at all!!!",
        });
        tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            IdentityStore::open(&path).await,
            Err(ScanError::IdentityCorrupt(_))
        ));
    }
}
