//! Pairing confirm exchange.
//!
//! One HTTPS POST against the desktop's pairing endpoint, pinned to the
//! fingerprint the QR payload carried. The desktop answers with the
//! trust record to install and, optionally, a client mutual-TLS bundle
//! for the stream transport.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ScanError, ScanResult};
use crate::identity::IdentityStore;
use crate::pairing::qr::QrPayload;
use crate::transport::tls;
use crate::trust::{TrustRecord, TrustStore};

/// HTTP timeout for the confirm exchange.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(15);

/// Confirm request body.
#[derive(Debug, Serialize)]
struct ConfirmRequest {
    pairing_code: String,
    pairing_confirm: ConfirmFields,
}

#[derive(Debug, Serialize)]
struct ConfirmFields {
    pairing_nonce: String,
    scan_device_id: String,
    scan_display_name: String,
    scan_cert_fingerprint_sha256: String,
    desktop_cert_fingerprint_sha256: String,
    confirmed_at_utc: String,
}

/// Confirm response body.
#[derive(Debug, Deserialize)]
struct ConfirmResponse {
    trust_record: TrustRecord,
    #[serde(default)]
    scan_client_mtls: Option<ScanClientMtls>,
}

/// Client mutual-TLS material issued by the desktop.
#[derive(Debug, Deserialize)]
struct ScanClientMtls {
    bundle_b64: String,
    password: String,
    fingerprint_sha256: String,
}

/// Client for the pairing confirm exchange.
pub struct PairingClient {
    identity: Arc<IdentityStore>,
    trust: Arc<TrustStore>,
    scan_display_name: String,
}

impl PairingClient {
    /// Creates a pairing client for this device.
    #[must_use]
    pub fn new(
        identity: Arc<IdentityStore>,
        trust: Arc<TrustStore>,
        scan_display_name: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            trust,
            scan_display_name: scan_display_name.into(),
        }
    }

    /// Completes pairing against a validated QR payload.
    ///
    /// On success the returned trust record has been installed and any
    /// issued client-TLS bundle has been sealed into the identity
    /// store.
    ///
    /// # Errors
    ///
    /// Status mapping per the pairing protocol: 401 [`ScanError::InvalidCode`],
    /// 410 [`ScanError::Expired`], 429 [`ScanError::LockedOut`], any
    /// other non-200 [`ScanError::ServerRejected`]. Connection-level
    /// failures surface as [`ScanError::TransportClosed`].
    pub async fn confirm(&self, qr: &QrPayload) -> ScanResult<TrustRecord> {
        let material = self.identity.material().await?;

        // TLS verification is pinned to the QR fingerprint; an endpoint
        // without a pin never gets a connection.
        let tls_config = tls::pinned_client_config(&qr.desktop_cert_fingerprint_sha256, None)?;
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .timeout(CONFIRM_TIMEOUT)
            .build()
            .map_err(|e| ScanError::TransportClosed(format!("http client: {e}")))?;

        let request = ConfirmRequest {
            pairing_code: qr.pairing_code.clone(),
            pairing_confirm: ConfirmFields {
                pairing_nonce: qr.pairing_nonce.clone(),
                scan_device_id: material.device_id.clone(),
                scan_display_name: self.scan_display_name.clone(),
                scan_cert_fingerprint_sha256: material.cert_fingerprint_sha256.clone(),
                desktop_cert_fingerprint_sha256: qr.desktop_cert_fingerprint_sha256.clone(),
                confirmed_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        };

        let url = qr.confirm_url();
        info!(url = %url, desktop = %qr.desktop_device_id, "sending pairing confirm");
        let response = http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ScanError::TransportClosed(format!("confirm request: {e}")))?;

        let status = response.status().as_u16();
        if status != 200 {
            warn!(status, "pairing confirm rejected");
            return Err(map_confirm_status(status));
        }

        let body: ConfirmResponse = response
            .json()
            .await
            .map_err(|_| ScanError::ServerRejected { status })?;

        self.trust.upsert(body.trust_record.clone()).await?;

        if let Some(mtls) = body.scan_client_mtls {
            let bundle = BASE64
                .decode(&mtls.bundle_b64)
                .map_err(|e| ScanError::IdentityCorrupt(format!("issued bundle base64: {e}")))?;
            self.identity
                .persist_client_tls_identity(
                    &bundle,
                    &SecretString::from(mtls.password),
                    &mtls.fingerprint_sha256,
                )
                .await?;
        }

        info!(peer = %body.trust_record.peer_device_id, "pairing complete");
        Ok(body.trust_record)
    }
}

/// Maps a non-200 confirm status onto the pairing error taxonomy.
pub(crate) fn map_confirm_status(status: u16) -> ScanError {
    match status {
        401 => ScanError::InvalidCode,
        410 => ScanError::Expired,
        429 => ScanError::LockedOut,
        other => ScanError::ServerRejected { status: other },
    }
}
