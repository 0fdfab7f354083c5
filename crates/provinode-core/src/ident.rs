//! Sortable identifiers and hash helpers.
//!
//! Every long-lived object in the scan plane (devices, sessions, hello
//! nonces, correlation ids) is named by a 26-character Crockford-base32
//! identifier whose lexicographic order is its creation order. Content
//! addressing uses lowercase SHA-256 hex throughout.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// A 26-character sortable identifier.
///
/// Identifiers sort lexicographically by creation time, which keeps
/// session directories and log correlation ids naturally ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    /// Mints a new identifier from the current time and OS entropy.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wraps an existing identifier string without validation.
    ///
    /// Used when an id arrives from a peer or from disk; the scan plane
    /// treats foreign ids as opaque keys.
    #[must_use]
    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ScanId> for String {
    fn from(id: ScanId) -> Self {
        id.0
    }
}

/// Computes the lowercase SHA-256 hex digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Returns true if `s` is exactly 64 hex characters (either case).
#[must_use]
pub fn is_hex_fingerprint(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalizes a certificate fingerprint to the canonical lowercase form.
#[must_use]
pub fn normalize_fingerprint(s: &str) -> String {
    s.to_ascii_lowercase()
}
