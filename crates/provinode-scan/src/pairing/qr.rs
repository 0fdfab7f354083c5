//! QR pairing payload validation.
//!
//! The desktop renders a signed, short-lived JSON payload; the scanner
//! validates it field by field before any network traffic happens. The
//! checks run in a fixed order and each failure carries its own reason
//! so the operator sees exactly what went wrong.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use provinode_core::ident::{is_hex_fingerprint, normalize_fingerprint};

use crate::error::{QrReason, ScanError, ScanResult};

/// Byte length `signature_b64` must decode to.
const SIGNATURE_LEN: usize = 32;

/// A validated QR pairing payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    /// Opaque pairing token minted by the desktop.
    pub pairing_token: String,
    /// Short confirmation code typed or scanned by the operator.
    pub pairing_code: String,
    /// One-time nonce echoed in the confirm exchange.
    pub pairing_nonce: String,
    /// Desktop device identifier.
    pub desktop_device_id: String,
    /// Desktop display name.
    pub desktop_display_name: String,
    /// Pairing HTTPS endpoint.
    pub pairing_endpoint: String,
    /// Stream endpoint as `host:port`.
    pub quic_endpoint: String,
    /// RFC-3339 expiry.
    pub expires_at_utc: String,
    /// Desktop TLS leaf fingerprint, 64 hex chars.
    pub desktop_cert_fingerprint_sha256: String,
    /// Payload version; major 1 only.
    pub protocol_version: String,
    /// Detached payload signature; length-validated only, the
    /// verification key is distributed out of band.
    pub signature_b64: String,
}

impl QrPayload {
    /// Parses and validates a QR payload.
    ///
    /// Validation order: JSON shape, endpoint URL, protocol version,
    /// expiry, fingerprint, signature length, stream endpoint. The
    /// fingerprint is normalized to lowercase in the returned payload.
    ///
    /// # Errors
    ///
    /// [`ScanError::QrMalformed`] with the reason of the first failed
    /// check.
    pub fn parse(bytes: &[u8]) -> ScanResult<Self> {
        let mut payload: Self = serde_json::from_slice(bytes)
            .map_err(|_| ScanError::QrMalformed(QrReason::NotJson))?;

        let endpoint = Url::parse(&payload.pairing_endpoint)
            .map_err(|_| ScanError::QrMalformed(QrReason::BadEndpoint))?;
        if endpoint.scheme() != "https" {
            return Err(ScanError::QrMalformed(QrReason::SchemeNotHttps));
        }
        if endpoint.host_str().unwrap_or_default().is_empty() {
            return Err(ScanError::QrMalformed(QrReason::BadEndpoint));
        }

        let major = payload
            .protocol_version
            .split('.')
            .next()
            .and_then(|m| m.parse::<u32>().ok())
            .ok_or(ScanError::QrMalformed(QrReason::UnsupportedVersion))?;
        if major != 1 {
            return Err(ScanError::QrMalformed(QrReason::UnsupportedVersion));
        }

        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at_utc)
            .map_err(|_| ScanError::QrMalformed(QrReason::Expired))?;
        if expires_at.with_timezone(&Utc) <= Utc::now() {
            return Err(ScanError::QrMalformed(QrReason::Expired));
        }

        if !is_hex_fingerprint(&payload.desktop_cert_fingerprint_sha256) {
            return Err(ScanError::QrMalformed(QrReason::FingerprintInvalid));
        }

        let signature = BASE64
            .decode(&payload.signature_b64)
            .map_err(|_| ScanError::QrMalformed(QrReason::SignatureInvalid))?;
        if signature.len() != SIGNATURE_LEN {
            return Err(ScanError::QrMalformed(QrReason::SignatureInvalid));
        }

        if parse_host_port(&payload.quic_endpoint).is_none() {
            return Err(ScanError::QrMalformed(QrReason::BadQuicEndpoint));
        }

        payload.desktop_cert_fingerprint_sha256 =
            normalize_fingerprint(&payload.desktop_cert_fingerprint_sha256);
        Ok(payload)
    }

    /// Host half of the stream endpoint.
    #[must_use]
    pub fn quic_host(&self) -> String {
        parse_host_port(&self.quic_endpoint)
            .map(|(host, _)| host)
            .unwrap_or_default()
    }

    /// Port half of the stream endpoint.
    #[must_use]
    pub fn quic_port(&self) -> u16 {
        parse_host_port(&self.quic_endpoint)
            .map(|(_, port)| port)
            .unwrap_or_default()
    }

    /// Port of the pairing endpoint (default https port when omitted).
    #[must_use]
    pub fn pairing_port(&self) -> u16 {
        Url::parse(&self.pairing_endpoint)
            .ok()
            .and_then(|url| url.port_or_known_default())
            .unwrap_or(443)
    }

    /// URL of the confirm endpoint.
    ///
    /// Desktops embed the confirm path in the QR; older ones advertise
    /// the service root, so the path is appended when missing.
    #[must_use]
    pub fn confirm_url(&self) -> String {
        let trimmed = self.pairing_endpoint.trim_end_matches('/');
        if trimmed.ends_with("/pairing/confirm") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/pairing/confirm")
        }
    }

    /// Parsed expiry timestamp.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.expires_at_utc)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

fn parse_host_port(endpoint: &str) -> Option<(String, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;

    /// A well-formed QR JSON value with a far-future expiry.
    pub(crate) fn valid_qr_value() -> serde_json::Value {
        serde_json::json!({
            "pairing_token": "tok-8843",
            "pairing_code": "421 907",
            "pairing_nonce": "01NONCE000000000000000000A",
            "desktop_device_id": "01DESKTOP00000000000000000",
            "desktop_display_name": "Studio Desktop",
            "pairing_endpoint": "https://192.168.1.44:7448/pairing/confirm",
            "quic_endpoint": "192.168.1.44:7447",
            "expires_at_utc": "2030-01-01T00:00:00Z",
            "desktop_cert_fingerprint_sha256": "ab".repeat(32),
            "protocol_version": "1.1",
            "signature_b64": BASE64.encode([7u8; SIGNATURE_LEN]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::valid_qr_value;
    use super::*;

    fn parse_value(value: serde_json::Value) -> ScanResult<QrPayload> {
        QrPayload::parse(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn valid_payload_parses_and_normalizes() {
        let mut value = valid_qr_value();
        value["desktop_cert_fingerprint_sha256"] =
            serde_json::Value::String("AB".repeat(32));

        let qr = parse_value(value).unwrap();
        assert_eq!(qr.desktop_cert_fingerprint_sha256, "ab".repeat(32));
        assert_eq!(qr.quic_host(), "192.168.1.44");
        assert_eq!(qr.quic_port(), 7447);
        assert_eq!(qr.pairing_port(), 7448);
        assert_eq!(
            qr.confirm_url(),
            "https://192.168.1.44:7448/pairing/confirm"
        );
    }

    #[test]
    fn not_json_is_rejected() {
        assert!(matches!(
            QrPayload::parse(b"\xff\xfe definitely not json"),
            Err(ScanError::QrMalformed(QrReason::NotJson))
        ));
    }

    #[test]
    fn http_scheme_is_rejected() {
        let mut value = valid_qr_value();
        value["pairing_endpoint"] =
            serde_json::Value::String("http://192.168.1.44:7448/pairing/confirm".into());
        assert!(matches!(
            parse_value(value),
            Err(ScanError::QrMalformed(QrReason::SchemeNotHttps))
        ));
    }

    #[test]
    fn unparseable_endpoint_is_rejected() {
        let mut value = valid_qr_value();
        value["pairing_endpoint"] = serde_json::Value::String("::::".into());
        assert!(matches!(
            parse_value(value),
            Err(ScanError::QrMalformed(QrReason::BadEndpoint))
        ));
    }

    #[test]
    fn foreign_major_version_is_rejected() {
        for version in ["2.0", "0.9", "abc"] {
            let mut value = valid_qr_value();
            value["protocol_version"] = serde_json::Value::String(version.into());
            assert!(
                matches!(
                    parse_value(value),
                    Err(ScanError::QrMalformed(QrReason::UnsupportedVersion))
                ),
                "version {version} should be rejected"
            );
        }
    }

    #[test]
    fn past_expiry_is_rejected() {
        let mut value = valid_qr_value();
        value["expires_at_utc"] = serde_json::Value::String("2020-01-01T00:00:00Z".into());
        assert!(matches!(
            parse_value(value),
            Err(ScanError::QrMalformed(QrReason::Expired))
        ));
    }

    #[test]
    fn fractional_seconds_expiry_is_accepted() {
        let mut value = valid_qr_value();
        value["expires_at_utc"] =
            serde_json::Value::String("2030-01-01T00:00:00.250Z".into());
        assert!(parse_value(value).is_ok());
    }

    #[test]
    fn short_fingerprint_is_rejected() {
        let mut value = valid_qr_value();
        value["desktop_cert_fingerprint_sha256"] = serde_json::Value::String("ab".repeat(31));
        assert!(matches!(
            parse_value(value),
            Err(ScanError::QrMalformed(QrReason::FingerprintInvalid))
        ));
    }

    #[test]
    fn wrong_signature_length_is_rejected() {
        let mut value = valid_qr_value();
        value["signature_b64"] = serde_json::Value::String(BASE64.encode([1u8; 31]));
        assert!(matches!(
            parse_value(value),
            Err(ScanError::QrMalformed(QrReason::SignatureInvalid))
        ));
    }

    #[test]
    fn bad_quic_endpoint_is_rejected() {
        for endpoint in ["192.168.1.44", "192.168.1.44:0", ":7447", "h:notaport"] {
            let mut value = valid_qr_value();
            value["quic_endpoint"] = serde_json::Value::String(endpoint.into());
            assert!(
                matches!(
                    parse_value(value),
                    Err(ScanError::QrMalformed(QrReason::BadQuicEndpoint))
                ),
                "endpoint {endpoint} should be rejected"
            );
        }
    }

    #[test]
    fn confirm_path_is_appended_when_missing() {
        let mut value = valid_qr_value();
        value["pairing_endpoint"] = serde_json::Value::String("https://desk.local:7448".into());
        let qr = parse_value(value).unwrap();
        assert_eq!(qr.confirm_url(), "https://desk.local:7448/pairing/confirm");
    }
}
