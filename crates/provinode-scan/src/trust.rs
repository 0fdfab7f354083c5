//! Trusted peer store.
//!
//! One record per paired desktop, keyed by its device id. The record
//! set is serialized to a single document sealed with AES-256-GCM; the
//! 256-bit store key is random, minted on first write, and kept in a
//! sibling file. A fixed info string rides as associated data so a blob
//! copied between stores fails authentication.
//!
//! Files written before the sealed format carry the records in
//! plaintext; they load transparently and the next persist upgrades
//! them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use provinode_core::ident::normalize_fingerprint;

use crate::error::{ScanError, ScanResult};
use crate::fsutil;

/// Format tag identifying the sealed document.
pub const TRUST_FORMAT: &str = "provinode.scan.trust.v1";

/// Associated data authenticated with every sealed trust document.
const TRUST_AAD: &[u8] = b"provinode.scan.trust.aad.v1";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Trust standing of a paired peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    /// Peer may receive capture streams.
    Trusted,
    /// Peer was explicitly revoked.
    Revoked,
}

/// A paired desktop peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustRecord {
    /// Peer device identifier (record key).
    pub peer_device_id: String,
    /// Human-readable peer name.
    pub peer_display_name: String,
    /// Current TLS leaf fingerprint, lowercase hex.
    pub peer_cert_fingerprint_sha256: String,
    /// RFC-3339 time the pairing was created.
    pub created_at_utc: String,
    /// RFC-3339 time the peer was last seen.
    pub last_seen_at_utc: String,
    /// Trust standing.
    pub status: TrustStatus,
    /// Fingerprints superseded by certificate rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_cert_fingerprints_sha256: Option<Vec<String>>,
}

/// Sealed on-disk document shape.
#[derive(Debug, Serialize, Deserialize)]
struct SealedDocument {
    format: String,
    nonce_b64: String,
    ciphertext_b64: String,
    tag_b64: String,
}

/// Single-writer store for the trust record set.
pub struct TrustStore {
    path: PathBuf,
    key_path: PathBuf,
    inner: Mutex<BTreeMap<String, TrustRecord>>,
}

impl TrustStore {
    /// Opens the store at `path`; the store key lives next to it.
    ///
    /// # Errors
    ///
    /// [`ScanError::TrustStoreCorrupt`] when the document or key file
    /// cannot be read, decrypted, or parsed. Absence of both files is a
    /// fresh, empty store.
    pub async fn open(path: impl Into<PathBuf>) -> ScanResult<Self> {
        let path = path.into();
        let key_path = path.with_extension("key");

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => Self::parse_document(&bytes, &key_path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(ScanError::TrustStoreCorrupt(format!("document read: {e}")));
            }
        };

        Ok(Self {
            path,
            key_path,
            inner: Mutex::new(records),
        })
    }

    async fn parse_document(
        bytes: &[u8],
        key_path: &Path,
    ) -> ScanResult<BTreeMap<String, TrustRecord>> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| ScanError::TrustStoreCorrupt(format!("document parse: {e}")))?;

        let is_sealed = value
            .get("format")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|tag| tag == TRUST_FORMAT);

        if is_sealed {
            let sealed: SealedDocument = serde_json::from_value(value)
                .map_err(|e| ScanError::TrustStoreCorrupt(format!("sealed shape: {e}")))?;
            let key = load_key(key_path).await?.ok_or_else(|| {
                ScanError::TrustStoreCorrupt("sealed document without key file".to_string())
            })?;
            open_sealed(&sealed, &key)
        } else {
            // Pre-seal plaintext layout: the record map itself.
            let records: BTreeMap<String, TrustRecord> = serde_json::from_value(value)
                .map_err(|e| ScanError::TrustStoreCorrupt(format!("legacy parse: {e}")))?;
            debug!(count = records.len(), "loaded legacy plaintext trust store");
            Ok(records)
        }
    }

    /// Inserts or replaces the record for its peer, then persists.
    ///
    /// On fingerprint rotation the superseded fingerprint is appended
    /// to the record's history.
    ///
    /// # Errors
    ///
    /// [`ScanError::TrustStoreCorrupt`] when persisting fails.
    pub async fn upsert(&self, mut record: TrustRecord) -> ScanResult<()> {
        record.peer_cert_fingerprint_sha256 =
            normalize_fingerprint(&record.peer_cert_fingerprint_sha256);

        let mut records = self.inner.lock().await;
        if let Some(existing) = records.get(&record.peer_device_id) {
            if existing.peer_cert_fingerprint_sha256 != record.peer_cert_fingerprint_sha256 {
                let mut previous = existing
                    .previous_cert_fingerprints_sha256
                    .clone()
                    .unwrap_or_default();
                if !previous.contains(&existing.peer_cert_fingerprint_sha256) {
                    previous.push(existing.peer_cert_fingerprint_sha256.clone());
                }
                record.previous_cert_fingerprints_sha256 = Some(previous);
            }
        }

        info!(
            peer_device_id = %record.peer_device_id,
            status = ?record.status,
            "trust record upserted"
        );
        records.insert(record.peer_device_id.clone(), record);
        self.persist(&records).await
    }

    /// Marks a peer revoked, if present, and persists.
    ///
    /// # Errors
    ///
    /// [`ScanError::TrustStoreCorrupt`] when persisting fails.
    pub async fn revoke(&self, peer_device_id: &str) -> ScanResult<bool> {
        let mut records = self.inner.lock().await;
        let Some(record) = records.get_mut(peer_device_id) else {
            return Ok(false);
        };
        record.status = TrustStatus::Revoked;
        info!(peer_device_id, "trust record revoked");
        self.persist(&records).await?;
        Ok(true)
    }

    /// Returns the record for `peer_device_id` when it is trusted.
    pub async fn trusted_peer(&self, peer_device_id: &str) -> Option<TrustRecord> {
        let records = self.inner.lock().await;
        records
            .get(peer_device_id)
            .filter(|r| r.status == TrustStatus::Trusted)
            .cloned()
    }

    /// Returns all records ordered by peer device id.
    pub async fn all(&self) -> Vec<TrustRecord> {
        let records = self.inner.lock().await;
        records.values().cloned().collect()
    }

    async fn persist(&self, records: &BTreeMap<String, TrustRecord>) -> ScanResult<()> {
        let key = match load_key(&self.key_path).await? {
            Some(key) => key,
            None => create_key(&self.key_path).await?,
        };

        let plaintext = serde_json::to_vec(records)
            .map_err(|e| ScanError::TrustStoreCorrupt(format!("record encode: {e}")))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: TRUST_AAD,
                },
            )
            .map_err(|_| ScanError::TrustStoreCorrupt("seal encrypt failed".to_string()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let document = SealedDocument {
            format: TRUST_FORMAT.to_string(),
            nonce_b64: BASE64.encode(nonce),
            ciphertext_b64: BASE64.encode(ciphertext),
            tag_b64: BASE64.encode(tag),
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| ScanError::TrustStoreCorrupt(format!("document encode: {e}")))?;

        fsutil::write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| ScanError::TrustStoreCorrupt(format!("document write: {e}")))?;
        fsutil::mark_no_backup(&self.path).await;
        Ok(())
    }
}

fn open_sealed(sealed: &SealedDocument, key: &[u8; KEY_LEN]) -> ScanResult<BTreeMap<String, TrustRecord>> {
    let nonce = BASE64
        .decode(&sealed.nonce_b64)
        .map_err(|e| ScanError::TrustStoreCorrupt(format!("nonce base64: {e}")))?;
    let mut ciphertext = BASE64
        .decode(&sealed.ciphertext_b64)
        .map_err(|e| ScanError::TrustStoreCorrupt(format!("ciphertext base64: {e}")))?;
    let tag = BASE64
        .decode(&sealed.tag_b64)
        .map_err(|e| ScanError::TrustStoreCorrupt(format!("tag base64: {e}")))?;
    if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(ScanError::TrustStoreCorrupt(
            "sealed document field lengths".to_string(),
        ));
    }
    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad: TRUST_AAD,
            },
        )
        .map_err(|_| ScanError::TrustStoreCorrupt("document authentication failed".to_string()))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| ScanError::TrustStoreCorrupt(format!("record parse: {e}")))
}

async fn load_key(key_path: &Path) -> ScanResult<Option<[u8; KEY_LEN]>> {
    match tokio::fs::read_to_string(key_path).await {
        Ok(contents) => {
            let bytes = BASE64
                .decode(contents.trim())
                .map_err(|e| ScanError::TrustStoreCorrupt(format!("key base64: {e}")))?;
            let key: [u8; KEY_LEN] = bytes
                .try_into()
                .map_err(|_| ScanError::TrustStoreCorrupt("key length".to_string()))?;
            Ok(Some(key))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ScanError::TrustStoreCorrupt(format!("key read: {e}"))),
    }
}

async fn create_key(key_path: &Path) -> ScanResult<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    fsutil::write_atomic(key_path, BASE64.encode(key).as_bytes())
        .await
        .map_err(|e| ScanError::TrustStoreCorrupt(format!("key write: {e}")))?;
    fsutil::mark_no_backup(key_path).await;
    Ok(key)
}
