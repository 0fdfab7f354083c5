//! Content-addressed session package writer.
//!
//! One recorder owns one session directory:
//!
//! ```text
//! <root>/<session_id>/
//!   session.manifest.json    written by finalize
//!   samples.log              newline-delimited JSON, one line per sample
//!   blobs/sha256/<hex>       payload blobs, one per distinct hash
//!   integrity.json           digests over manifest, log, and blobs
//! ```
//!
//! Writes are append-only while the session runs; every distinct
//! payload hash lands on disk exactly once. Log lines and the manifest
//! serialize with sorted keys so byte-identical re-runs are possible.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use provinode_core::ident::sha256_hex;
use provinode_core::sample::{SampleEnvelope, BLOB_PREFIX};

use crate::error::{ScanError, ScanResult};
use crate::fsutil;

/// Manifest schema version.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Extension of an exported session package.
pub const EXPORT_EXTENSION: &str = "roomcapture";

/// One line of `samples.log`. Field order is alphabetical, which is
/// what keeps the serialized key order deterministic.
#[derive(Debug, Serialize)]
struct LogLine<'a> {
    blob_path: &'a str,
    byte_size: usize,
    capture_time_ns: i64,
    hash_sha256: &'a str,
    sample_kind: &'a str,
    sample_seq: i64,
}

#[derive(Debug, Default)]
struct RecorderState {
    sample_count: u64,
    blob_count: u64,
    blob_hashes: BTreeMap<String, String>,
    end_at_utc: Option<String>,
    finalized: bool,
}

/// Single-writer recorder for one capture session.
pub struct SessionRecorder {
    session_id: String,
    source_device_id: String,
    dir: PathBuf,
    started_at_utc: String,
    state: Mutex<RecorderState>,
}

impl SessionRecorder {
    /// Creates the session directory layout under `root`.
    ///
    /// # Errors
    ///
    /// [`ScanError::RecorderIoFailure`] when the layout cannot be
    /// created.
    pub async fn create(
        root: impl AsRef<Path>,
        session_id: &str,
        source_device_id: &str,
    ) -> ScanResult<Self> {
        let dir = root.as_ref().join(session_id);
        let blobs = dir.join(BLOB_PREFIX);
        tokio::fs::create_dir_all(&blobs)
            .await
            .map_err(|e| io_failure(&blobs, e))?;

        let log_path = dir.join("samples.log");
        if tokio::fs::metadata(&log_path).await.is_err() {
            tokio::fs::write(&log_path, b"")
                .await
                .map_err(|e| io_failure(&log_path, e))?;
        }

        info!(session_id, dir = %dir.display(), "session package initialized");
        Ok(Self {
            session_id: session_id.to_string(),
            source_device_id: source_device_id.to_string(),
            dir,
            started_at_utc: chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            state: Mutex::new(RecorderState::default()),
        })
    }

    /// The session directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records one sample: blob (if new) plus a log line.
    ///
    /// # Errors
    ///
    /// [`ScanError::PayloadHashMismatch`] when the payload does not
    /// hash to the envelope digest; [`ScanError::RecorderIoFailure`]
    /// for disk problems.
    pub async fn record(&self, envelope: &SampleEnvelope, payload: &[u8]) -> ScanResult<()> {
        let actual = sha256_hex(payload);
        if actual != envelope.hash_sha256 {
            return Err(ScanError::PayloadHashMismatch {
                expected: envelope.hash_sha256.clone(),
                actual,
            });
        }

        let mut state = self.state.lock().await;

        let blob_rel = format!("{BLOB_PREFIX}/{}", envelope.hash_sha256);
        let blob_path = self.dir.join(&blob_rel);
        if tokio::fs::metadata(&blob_path).await.is_err() {
            fsutil::write_atomic(&blob_path, payload)
                .await
                .map_err(|e| io_failure(&blob_path, e))?;
            state.blob_count += 1;
        } else {
            debug!(hash = %envelope.hash_sha256, "blob already present, reusing");
        }

        let line = LogLine {
            blob_path: &blob_rel,
            byte_size: payload.len(),
            capture_time_ns: envelope.capture_time_ns,
            hash_sha256: &envelope.hash_sha256,
            sample_kind: envelope.sample_kind.as_str(),
            sample_seq: envelope.sample_seq,
        };
        let mut encoded =
            serde_json::to_vec(&line).expect("log line serialization cannot fail");
        encoded.push(b'\n');

        let log_path = self.dir.join("samples.log");
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| io_failure(&log_path, e))?;
        file.write_all(&encoded)
            .await
            .map_err(|e| io_failure(&log_path, e))?;
        file.flush().await.map_err(|e| io_failure(&log_path, e))?;

        state.sample_count += 1;
        state.end_at_utc = Some(
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        );
        state
            .blob_hashes
            .insert(blob_rel, envelope.hash_sha256.clone());
        Ok(())
    }

    /// Writes the manifest and integrity digest, closing the package.
    ///
    /// Returns the session directory. The partial directory stays on
    /// disk when finalize fails, for diagnostics.
    ///
    /// # Errors
    ///
    /// [`ScanError::RecorderIoFailure`] when a file cannot be written.
    pub async fn finalize(
        &self,
        extra_metadata: BTreeMap<String, String>,
    ) -> ScanResult<PathBuf> {
        let mut state = self.state.lock().await;

        let mut metadata = BTreeMap::new();
        metadata.insert("room.session_id".to_string(), self.session_id.clone());
        metadata.insert(
            "schema_version".to_string(),
            MANIFEST_SCHEMA_VERSION.to_string(),
        );
        metadata.insert(
            "source_device_id".to_string(),
            self.source_device_id.clone(),
        );
        metadata.insert(
            "capture_started_at_utc".to_string(),
            self.started_at_utc.clone(),
        );
        // Caller keys override the defaults.
        metadata.extend(extra_metadata);

        let manifest = serde_json::json!({
            "session_id": self.session_id,
            "schema_version": MANIFEST_SCHEMA_VERSION,
            "source_device_id": self.source_device_id,
            "capture_started_at_utc": self.started_at_utc,
            "end_at_utc": state.end_at_utc,
            "sample_count": state.sample_count,
            "blob_count": state.blob_count,
            "producer_version": env!("CARGO_PKG_VERSION"),
            "metadata": metadata,
        });
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .expect("manifest serialization cannot fail");

        let manifest_path = self.dir.join("session.manifest.json");
        fsutil::write_atomic(&manifest_path, &manifest_bytes)
            .await
            .map_err(|e| io_failure(&manifest_path, e))?;

        let log_path = self.dir.join("samples.log");
        let log_bytes = tokio::fs::read(&log_path)
            .await
            .map_err(|e| io_failure(&log_path, e))?;

        let provenance = format!(
            "{}:{}:{}",
            self.session_id, state.sample_count, state.blob_count
        );
        let integrity = serde_json::json!({
            "manifest_sha256": sha256_hex(&manifest_bytes),
            "samples_log_sha256": sha256_hex(&log_bytes),
            "blob_hashes": state.blob_hashes,
            "provenance_digest": sha256_hex(provenance.as_bytes()),
        });
        let integrity_path = self.dir.join("integrity.json");
        fsutil::write_atomic(
            &integrity_path,
            &serde_json::to_vec_pretty(&integrity).expect("integrity serialization cannot fail"),
        )
        .await
        .map_err(|e| io_failure(&integrity_path, e))?;

        state.finalized = true;
        info!(
            session_id = %self.session_id,
            samples = state.sample_count,
            blobs = state.blob_count,
            "session finalized"
        );
        Ok(self.dir.clone())
    }

    /// Exports the package as `<destination>/<session_id>.roomcapture`.
    ///
    /// Any existing export is removed first; the copy is byte-identical.
    ///
    /// # Errors
    ///
    /// [`ScanError::RecorderIoFailure`] when the copy fails.
    pub async fn export(&self, destination: impl AsRef<Path>) -> ScanResult<PathBuf> {
        let target = destination
            .as_ref()
            .join(format!("{}.{EXPORT_EXTENSION}", self.session_id));

        let source = self.dir.clone();
        let target_clone = target.clone();
        tokio::task::spawn_blocking(move || {
            if target_clone.exists() {
                std::fs::remove_dir_all(&target_clone)?;
            }
            copy_dir_all(&source, &target_clone)
        })
        .await
        .map_err(|e| {
            io_failure(&target, std::io::Error::other(format!("export task: {e}")))
        })?
        .map_err(|e| io_failure(&target, e))?;

        info!(target = %target.display(), "session exported");
        Ok(target)
    }
}

fn copy_dir_all(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

fn io_failure(path: &Path, source: std::io::Error) -> ScanError {
    ScanError::RecorderIoFailure {
        path: path.to_path_buf(),
        source,
    }
}
