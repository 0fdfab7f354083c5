//! Capture sample envelopes and typed control messages.
//!
//! A capture session produces a stream of heterogeneous samples. Each
//! sample is an opaque payload plus a [`SampleEnvelope`] describing it:
//! the envelope is what lands in `samples.log` and what rides ahead of
//! the payload bytes on the transport. Control traffic between the
//! peers (resume checkpoints, backpressure hints) is carried as a
//! tagged [`ControlMessage`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ident::sha256_hex;

/// Relative path prefix for content-addressed payload blobs.
pub const BLOB_PREFIX: &str = "blobs/sha256";

/// Stream id the scan device stamps on the checkpoints it originates.
pub const STREAM_ID_SCAN_DEVICE: &str = "scan-device";

/// Stream id a desktop peer uses to request a resume retransmission.
pub const STREAM_ID_DESKTOP_RESUME: &str = "desktop-resume";

/// The kind of a capture sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    /// JPEG keyframe from the color camera.
    KeyframeRgb,
    /// Depth map snapshot.
    DepthFrame,
    /// Batch of mesh anchor geometry updates.
    MeshAnchorBatch,
    /// 4x4 column-major camera transform.
    CameraPose,
    /// 3x3 camera intrinsics plus resolution.
    Intrinsics,
    /// Liveness beacon carrying the frame counter.
    Heartbeat,
}

impl SampleKind {
    /// Stable string form, used as a structured log field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeyframeRgb => "KeyframeRgb",
            Self::DepthFrame => "DepthFrame",
            Self::MeshAnchorBatch => "MeshAnchorBatch",
            Self::CameraPose => "CameraPose",
            Self::Intrinsics => "Intrinsics",
            Self::Heartbeat => "Heartbeat",
        }
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-sample metadata record.
///
/// Written to `samples.log` and sent ahead of the payload bytes on the
/// transport. The map type keeps serialized key order deterministic.
///
/// # Invariants
///
/// - `hash_sha256` is the SHA-256 of the payload bytes
/// - `payload_ref` is `blobs/sha256/<hash_sha256>`
/// - `sample_seq` is strictly increasing within a session
/// - `capture_time_ns` is non-decreasing within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleEnvelope {
    /// Session this sample belongs to.
    pub session_id: String,
    /// Monotonic per-session sequence number, starting at 0.
    pub sample_seq: i64,
    /// Capture timestamp in nanoseconds on `clock_id`.
    pub capture_time_ns: i64,
    /// Identifier of the clock `capture_time_ns` was read from.
    pub clock_id: String,
    /// Kind of the payload.
    pub sample_kind: SampleKind,
    /// Lowercase SHA-256 hex of the payload bytes.
    pub hash_sha256: String,
    /// Content-addressed blob path, `blobs/sha256/<hash>`.
    pub payload_ref: String,
    /// Kind-specific string metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl SampleEnvelope {
    /// Builds an envelope for `payload`, computing its hash and blob ref.
    #[must_use]
    pub fn for_payload(
        session_id: impl Into<String>,
        sample_seq: i64,
        capture_time_ns: i64,
        clock_id: impl Into<String>,
        sample_kind: SampleKind,
        payload: &[u8],
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let hash = sha256_hex(payload);
        let payload_ref = format!("{BLOB_PREFIX}/{hash}");
        Self {
            session_id: session_id.into(),
            sample_seq,
            capture_time_ns,
            clock_id: clock_id.into(),
            sample_kind,
            hash_sha256: hash,
            payload_ref,
            metadata,
        }
    }

    /// Checks the envelope hash against the actual payload bytes.
    #[must_use]
    pub fn matches_payload(&self, payload: &[u8]) -> bool {
        sha256_hex(payload) == self.hash_sha256
    }
}

/// High-water acknowledgement for resumable sample delivery.
///
/// Sent by the device right after the secure handshake, and by the
/// desktop to acknowledge receipt (or, with
/// [`STREAM_ID_DESKTOP_RESUME`], to request a retransmission of
/// everything past the acknowledged sequence).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeCheckpoint {
    /// Session the checkpoint applies to.
    pub session_id: String,
    /// Highest contiguous `sample_seq` the sender has durably received;
    /// −1 when nothing has been accepted yet.
    pub last_acked_sample_seq: i64,
    /// RFC-3339 timestamp the checkpoint was taken.
    pub captured_at_utc: String,
    /// Originating stream identity.
    pub stream_id: String,
}

/// Capture tuning requested by the receiving peer.
///
/// Field semantics are hints; the pipeline clamps them to safe ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackpressureHint {
    /// Desired keyframe rate; non-positive means "default cadence".
    pub target_keyframe_fps: f64,
    /// Emit every Nth depth frame; clamped to at least 1.
    pub depth_stride_hint: u32,
    /// Minimum interval between mesh batches, in milliseconds.
    pub mesh_update_interval_ms: u64,
    /// When set, suppress depth and mesh samples entirely.
    pub drop_non_keyframes: bool,
}

/// Control-plane message carried inside the secure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ControlMessage {
    /// Resume acknowledgement / retransmission request.
    ResumeCheckpoint(ResumeCheckpoint),
    /// Capture tuning hint.
    BackpressureHint(BackpressureHint),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_hashes_payload() {
        let env = SampleEnvelope::for_payload(
            "01SESSION",
            0,
            123,
            "device-mono",
            SampleKind::Heartbeat,
            b"payload",
            BTreeMap::new(),
        );
        assert_eq!(
            env.hash_sha256,
            "239f59ed55e737c77147cf55ad0c1b030b6d7ee748a7426952f9b852d5a935e5"
        );
        assert_eq!(
            env.payload_ref,
            "blobs/sha256/239f59ed55e737c77147cf55ad0c1b030b6d7ee748a7426952f9b852d5a935e5"
        );
        assert!(env.matches_payload(b"payload"));
        assert!(!env.matches_payload(b"tampered"));
    }

    #[test]
    fn envelope_serializes_with_sorted_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("zeta".to_string(), "1".to_string());
        metadata.insert("alpha".to_string(), "2".to_string());
        let env = SampleEnvelope::for_payload(
            "01SESSION",
            4,
            99,
            "device-mono",
            SampleKind::CameraPose,
            b"pose",
            metadata,
        );
        let json = serde_json::to_string(&env).unwrap();
        let alpha = json.find("alpha").unwrap();
        let zeta = json.find("zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn envelope_rejects_unknown_fields() {
        let json = r#"{
            "session_id": "s", "sample_seq": 0, "capture_time_ns": 1,
            "clock_id": "c", "sample_kind": "Heartbeat",
            "hash_sha256": "00", "payload_ref": "blobs/sha256/00",
            "surprise": true
        }"#;
        assert!(serde_json::from_str::<SampleEnvelope>(json).is_err());
    }

    #[test]
    fn control_message_roundtrip() {
        let msg = ControlMessage::ResumeCheckpoint(ResumeCheckpoint {
            session_id: "s".into(),
            last_acked_sample_seq: -1,
            captured_at_utc: "2026-01-01T00:00:00Z".into(),
            stream_id: STREAM_ID_SCAN_DEVICE.into(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"resume_checkpoint\""));
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn backpressure_hint_roundtrip() {
        let msg = ControlMessage::BackpressureHint(BackpressureHint {
            target_keyframe_fps: 2.0,
            depth_stride_hint: 3,
            mesh_update_interval_ms: 1500,
            drop_non_keyframes: true,
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn sample_kind_strings_are_stable() {
        assert_eq!(SampleKind::KeyframeRgb.as_str(), "KeyframeRgb");
        assert_eq!(
            serde_json::to_string(&SampleKind::MeshAnchorBatch).unwrap(),
            "\"MeshAnchorBatch\""
        );
    }
}
