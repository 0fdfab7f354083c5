//! Secure channel error types.

use thiserror::Error;

/// Errors produced by the secure channel handshake and codec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// Peer answered the handshake with an unexpected protocol or
    /// session binding.
    #[error("handshake mismatch: {field} expected {expected}, got {actual}")]
    HandshakeMismatch {
        /// Field that failed the check.
        field: &'static str,
        /// Locally expected value.
        expected: String,
        /// Value the peer supplied.
        actual: String,
    },

    /// Hello signature did not verify against the embedded signing key.
    #[error("hello signature verification failed")]
    SignatureInvalid,

    /// Authenticated decryption failed; the session must be torn down.
    #[error("AEAD authentication failed")]
    AeadFailure,

    /// The per-direction counter space is exhausted; the session must
    /// be re-established before any further traffic.
    #[error("outbound counter exhausted after {max} frames", max = u32::MAX as u64 + 1)]
    CounterExhausted,

    /// Envelope shape or encoding is not usable.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Key material could not be parsed or derived.
    #[error("crypto failure: {0}")]
    Crypto(String),
}
