//! Error taxonomy for the scan agent.
//!
//! One sum type covers the whole data plane so callers can match on
//! the failure kind without chasing subsystem-specific error types.
//! Channel-layer failures map onto their transport-facing kinds via
//! `From<ChannelError>`.

use std::path::PathBuf;

use provinode_core::channel::ChannelError;
use thiserror::Error;

/// Result alias for scan agent operations.
pub type ScanResult<T> = Result<T, ScanError>;

/// Why a QR payload was rejected.
///
/// Each validation step of the pairing ladder has its own reason so the
/// UI can show the operator something actionable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrReason {
    /// Bytes were not UTF-8 JSON of the expected shape.
    NotJson,
    /// `pairing_endpoint` is not an https URL with a host.
    SchemeNotHttps,
    /// `protocol_version` major is not 1.
    UnsupportedVersion,
    /// `expires_at_utc` is unparseable or in the past.
    Expired,
    /// `desktop_cert_fingerprint_sha256` is not 64 hex characters.
    FingerprintInvalid,
    /// `signature_b64` does not decode to exactly 32 bytes.
    SignatureInvalid,
    /// `pairing_endpoint` failed URL parsing outright.
    BadEndpoint,
    /// `quic_endpoint` is not `host:port` with a valid port.
    BadQuicEndpoint,
}

impl std::fmt::Display for QrReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::NotJson => "payload is not valid JSON",
            Self::SchemeNotHttps => "pairing endpoint must use https",
            Self::UnsupportedVersion => "unsupported protocol version",
            Self::Expired => "payload is expired or carries a bad expiry",
            Self::FingerprintInvalid => "desktop certificate fingerprint is not 64 hex chars",
            Self::SignatureInvalid => "signature does not decode to 32 bytes",
            Self::BadEndpoint => "pairing endpoint is not a valid URL",
            Self::BadQuicEndpoint => "quic endpoint is not host:port",
        };
        f.write_str(reason)
    }
}

/// Failures across the scan data plane.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScanError {
    /// Desktop rejected the pairing code (HTTP 401).
    #[error("pairing code rejected")]
    InvalidCode,

    /// Pairing token expired on the desktop side (HTTP 410).
    #[error("pairing token expired")]
    Expired,

    /// Too many failed attempts; desktop is rate limiting (HTTP 429).
    #[error("pairing locked out, retry later")]
    LockedOut,

    /// Desktop refused the exchange for another reason.
    #[error("desktop rejected pairing (status {status})")]
    ServerRejected {
        /// HTTP status received.
        status: u16,
    },

    /// No pinned fingerprint available for the endpoint; pairing never
    /// proceeds unpinned.
    #[error("endpoint has no pinned certificate fingerprint")]
    UntrustedEndpoint,

    /// QR payload failed validation.
    #[error("QR payload invalid: {0}")]
    QrMalformed(QrReason),

    /// Stored identity document cannot be used.
    #[error("identity store corrupt: {0}")]
    IdentityCorrupt(String),

    /// Legacy plaintext client-TLS fields are present but incomplete.
    #[error("legacy client TLS material incomplete, cannot migrate")]
    LegacyMigrationIncomplete,

    /// Trust store document cannot be decrypted or parsed.
    #[error("trust store corrupt: {0}")]
    TrustStoreCorrupt(String),

    /// Secure handshake failed protocol or session binding.
    #[error("secure handshake mismatch: {0}")]
    HandshakeMismatch(String),

    /// Inbound frame rejected by the replay window.
    #[error("frame rejected by replay protection")]
    ReplayRejected,

    /// Authenticated decryption failed; session torn down.
    #[error("AEAD failure, session terminated")]
    AeadFailure,

    /// Per-direction counter space exhausted; session torn down.
    #[error("secure channel counter exhausted")]
    CounterExhausted,

    /// Recorded payload does not hash to its envelope digest.
    #[error("payload hash mismatch: envelope {expected}, payload {actual}")]
    PayloadHashMismatch {
        /// Hash claimed by the envelope.
        expected: String,
        /// Hash of the actual payload bytes.
        actual: String,
    },

    /// Stream transport is not usable.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Session package write failed.
    #[error("recorder I/O failure at {path}: {source}")]
    RecorderIoFailure {
        /// Path the failed operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ChannelError> for ScanError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::HandshakeMismatch { .. } | ChannelError::SignatureInvalid => {
                Self::HandshakeMismatch(err.to_string())
            }
            ChannelError::AeadFailure => Self::AeadFailure,
            ChannelError::CounterExhausted => Self::CounterExhausted,
            ChannelError::MalformedEnvelope(_) | ChannelError::Crypto(_) => {
                Self::TransportClosed(err.to_string())
            }
            _ => Self::TransportClosed(err.to_string()),
        }
    }
}
