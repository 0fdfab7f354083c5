//! Environment bootstrap hooks consumed by the controller.
//!
//! CI rigs and field test harnesses drive the controller through these
//! variables: a QR payload can be injected, pairing and capture can
//! run without a UI, and the session id can be pinned for reproducible
//! package paths.

use std::path::Path;

/// Environment variable carrying a QR payload path or inline JSON.
pub const ENV_QR: &str = "PROVINODE_QR";

/// Environment variable enabling automatic pairing on startup.
pub const ENV_AUTOPAIR: &str = "PROVINODE_AUTOPAIR";

/// Environment variable holding an automatic capture duration.
pub const ENV_AUTO_CAPTURE_SECS: &str = "PROVINODE_AUTO_CAPTURE_SECS";

/// Environment variable enabling package export after finalize.
pub const ENV_AUTO_EXPORT: &str = "PROVINODE_AUTO_EXPORT";

/// Environment variable overriding the generated session id.
pub const ENV_SESSION_ID: &str = "PROVINODE_SESSION_ID";

/// Parsed bootstrap environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapEnv {
    /// QR payload bytes, resolved from a path or inline JSON.
    pub qr_payload: Option<Vec<u8>>,
    /// Pair automatically once a QR payload is imported.
    pub autopair: bool,
    /// Capture for this many seconds, then stop.
    pub auto_capture_secs: Option<u64>,
    /// Export the package after finalize.
    pub auto_export: bool,
    /// Session id override.
    pub session_id: Option<String>,
}

impl BootstrapEnv {
    /// Reads the bootstrap variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the bootstrap variables through `lookup` (test seam).
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let qr_payload = lookup(ENV_QR).map(|raw| resolve_qr_value(&raw));
        Self {
            qr_payload,
            autopair: lookup(ENV_AUTOPAIR).is_some_and(|v| is_truthy(&v)),
            auto_capture_secs: lookup(ENV_AUTO_CAPTURE_SECS).and_then(|v| v.parse().ok()),
            auto_export: lookup(ENV_AUTO_EXPORT).is_some_and(|v| is_truthy(&v)),
            session_id: lookup(ENV_SESSION_ID).filter(|v| !v.is_empty()),
        }
    }
}

/// A value that looks like a path to a readable file is read as one;
/// anything else is treated as inline JSON.
fn resolve_qr_value(raw: &str) -> Vec<u8> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        if let Ok(bytes) = std::fs::read(Path::new(trimmed)) {
            return bytes;
        }
    }
    trimmed.as_bytes().to_vec()
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
