//! TXT-record fields the scan core consumes from LAN discovery.
//!
//! The mDNS browser itself is an external collaborator; the core only
//! interprets the key/value fields of an advertised service and fills
//! in protocol defaults for anything the desktop left out.

use std::collections::HashMap;

use crate::ident::normalize_fingerprint;

/// Default pairing endpoint scheme.
pub const DEFAULT_PAIRING_SCHEME: &str = "https";

/// Default pairing endpoint port.
pub const DEFAULT_PAIRING_PORT: u16 = 7448;

/// Default QUIC stream port.
pub const DEFAULT_QUIC_PORT: u16 = 7447;

/// A desktop peer as advertised over service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedPeer {
    /// Human-readable peer name.
    pub display_name: String,
    /// Peer device identifier, when advertised.
    pub device_id: Option<String>,
    /// Resolved host (address or hostname).
    pub host: String,
    /// Pairing endpoint scheme.
    pub pairing_scheme: String,
    /// Pairing endpoint port.
    pub pairing_port: u16,
    /// QUIC stream port.
    pub quic_port: u16,
    /// Pairing certificate fingerprint, lowercase hex, when advertised.
    pub pairing_cert_fingerprint_sha256: Option<String>,
}

impl AdvertisedPeer {
    /// Interprets a TXT record map for a service resolved at `host`.
    ///
    /// Missing fields fall back to protocol defaults; fingerprints are
    /// normalized to lowercase. `fallback_name` is used when the record
    /// carries no `display_name`.
    #[must_use]
    pub fn from_txt_records(
        host: impl Into<String>,
        fallback_name: &str,
        records: &HashMap<String, String>,
    ) -> Self {
        let display_name = records
            .get("display_name")
            .map_or_else(|| fallback_name.to_string(), Clone::clone);
        let device_id = records.get("device_id").cloned();
        let pairing_scheme = records
            .get("pairing_scheme")
            .map_or_else(|| DEFAULT_PAIRING_SCHEME.to_string(), Clone::clone);
        let quic_port = records
            .get("quic_port")
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_QUIC_PORT);
        let pairing_cert_fingerprint_sha256 = records
            .get("pairing_cert_fingerprint_sha256")
            .map(|fp| normalize_fingerprint(fp));

        Self {
            display_name,
            device_id,
            host: host.into(),
            pairing_scheme,
            pairing_port: DEFAULT_PAIRING_PORT,
            quic_port,
            pairing_cert_fingerprint_sha256,
        }
    }

    /// Pairing endpoint base URL, e.g. `https://192.168.1.44:7448`.
    #[must_use]
    pub fn pairing_endpoint(&self) -> String {
        format!(
            "{}://{}:{}",
            self.pairing_scheme, self.host, self.pairing_port
        )
    }

    /// QUIC endpoint as `host:port`.
    #[must_use]
    pub fn quic_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.quic_port)
    }
}
