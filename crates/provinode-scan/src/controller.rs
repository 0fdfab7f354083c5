//! Lifecycle controller.
//!
//! Glue between pairing, capture, and finalize:
//!
//! ```text
//! Idle -> Paired -> Capturing -> Finalized -> Idle
//! ```
//!
//! Entering capture needs a resolved endpoint and a matching trust
//! record; when the transport cannot connect, capture degrades to
//! local-only recording instead of failing. Stopping always finalizes
//! the recorder and always disconnects the transport.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use provinode_core::ident::ScanId;

use crate::capture::{CapturePipeline, FrameProvider, PipelineConfig};
use crate::config::BootstrapEnv;
use crate::error::{ScanError, ScanResult};
use crate::identity::IdentityStore;
use crate::pairing::{PairingClient, QrPayload};
use crate::recorder::SessionRecorder;
use crate::transport::{ScanTransport, TransportConfig};
use crate::trust::TrustStore;

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing paired, nothing running.
    Idle,
    /// A trust record exists for the target desktop.
    Paired,
    /// A capture session is running.
    Capturing,
    /// The last session has been finalized.
    Finalized,
}

/// Operator-visible status summarizing the latest transition or error.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// Nothing going on.
    Idle,
    /// A QR payload was imported.
    QrImported {
        /// Target host from the stream endpoint.
        host: String,
        /// Pairing endpoint port.
        pairing_port: u16,
        /// Stream endpoint port.
        quic_port: u16,
    },
    /// Pairing completed against the named peer.
    Paired {
        /// Peer device id.
        peer_device_id: String,
    },
    /// Capture running for the named session.
    Capturing {
        /// Active session id.
        session_id: String,
        /// Whether samples are streaming or recording locally only.
        streaming: bool,
    },
    /// Session finalized at the given path.
    Finalized {
        /// Finalized package directory.
        path: PathBuf,
    },
    /// Most recent operation failed.
    Failed {
        /// Human-readable summary.
        summary: String,
    },
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::QrImported {
                host,
                pairing_port,
                quic_port,
            } => write!(f, "QR imported: {host} (pairing {pairing_port}, stream {quic_port})"),
            Self::Paired { peer_device_id } => write!(f, "paired with {peer_device_id}"),
            Self::Capturing {
                session_id,
                streaming,
            } => {
                if *streaming {
                    write!(f, "capturing {session_id} (streaming)")
                } else {
                    write!(f, "capturing {session_id} (local only)")
                }
            }
            Self::Finalized { path } => write!(f, "finalized {}", path.display()),
            Self::Failed { summary } => write!(f, "failed: {summary}"),
        }
    }
}

struct ActiveCapture {
    session_id: String,
    pipeline: Arc<CapturePipeline>,
    transport: Option<Arc<ScanTransport>>,
    recorder: Arc<SessionRecorder>,
    run_task: JoinHandle<ScanResult<PathBuf>>,
}

struct Inner {
    state: ControllerState,
    status: Status,
    qr: Option<QrPayload>,
    active: Option<ActiveCapture>,
}

/// Top-level device controller.
pub struct ScanController {
    identity: Arc<IdentityStore>,
    trust: Arc<TrustStore>,
    sessions_root: PathBuf,
    display_name: String,
    env: BootstrapEnv,
    inner: Mutex<Inner>,
}

impl ScanController {
    /// Creates a controller over the given stores.
    #[must_use]
    pub fn new(
        identity: Arc<IdentityStore>,
        trust: Arc<TrustStore>,
        sessions_root: impl Into<PathBuf>,
        display_name: impl Into<String>,
        env: BootstrapEnv,
    ) -> Self {
        Self {
            identity,
            trust,
            sessions_root: sessions_root.into(),
            display_name: display_name.into(),
            env,
            inner: Mutex::new(Inner {
                state: ControllerState::Idle,
                status: Status::Idle,
                qr: None,
                active: None,
            }),
        }
    }

    /// Applies the bootstrap environment.
    ///
    /// Imports an injected QR payload and, when asked, runs pairing
    /// immediately. Returns the configured auto-capture duration so
    /// the shell layer can schedule the stop.
    ///
    /// # Errors
    ///
    /// QR validation and pairing errors from the respective paths.
    pub async fn bootstrap(&self) -> ScanResult<Option<std::time::Duration>> {
        if let Some(bytes) = self.env.qr_payload.clone() {
            self.import_qr(&bytes).await?;
            if self.env.autopair {
                self.pair().await?;
            }
        }
        Ok(self
            .env
            .auto_capture_secs
            .map(std::time::Duration::from_secs))
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ControllerState {
        self.inner.lock().await.state
    }

    /// Current operator-visible status.
    pub async fn status(&self) -> Status {
        self.inner.lock().await.status.clone()
    }

    /// Imports and validates a QR pairing payload.
    ///
    /// A valid payload updates the status with the resolved endpoints;
    /// an invalid one records the failure and leaves no side effects.
    ///
    /// # Errors
    ///
    /// [`ScanError::QrMalformed`] with the first failed check.
    pub async fn import_qr(&self, bytes: &[u8]) -> ScanResult<()> {
        let mut inner = self.inner.lock().await;
        match QrPayload::parse(bytes) {
            Ok(qr) => {
                inner.status = Status::QrImported {
                    host: qr.quic_host(),
                    pairing_port: qr.pairing_port(),
                    quic_port: qr.quic_port(),
                };
                info!(desktop = %qr.desktop_device_id, "QR payload imported");
                inner.qr = Some(qr);
                Ok(())
            }
            Err(err) => {
                inner.status = Status::Failed {
                    summary: err.to_string(),
                };
                Err(err)
            }
        }
    }

    /// Runs the confirm exchange for the imported QR payload.
    ///
    /// # Errors
    ///
    /// [`ScanError::UntrustedEndpoint`] when no QR payload has been
    /// imported; otherwise the pairing taxonomy of
    /// [`PairingClient::confirm`].
    pub async fn pair(&self) -> ScanResult<()> {
        let qr = {
            let inner = self.inner.lock().await;
            inner.qr.clone().ok_or(ScanError::UntrustedEndpoint)?
        };

        let client = PairingClient::new(
            Arc::clone(&self.identity),
            Arc::clone(&self.trust),
            self.display_name.clone(),
        );
        match client.confirm(&qr).await {
            Ok(record) => {
                let mut inner = self.inner.lock().await;
                inner.state = ControllerState::Paired;
                inner.status = Status::Paired {
                    peer_device_id: record.peer_device_id,
                };
                Ok(())
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                inner.status = Status::Failed {
                    summary: err.to_string(),
                };
                Err(err)
            }
        }
    }

    /// Starts a capture session, streaming when possible.
    ///
    /// The transport is attempted when the imported QR endpoint matches
    /// a trusted peer; connect failure degrades to local-only
    /// recording.
    ///
    /// # Errors
    ///
    /// [`ScanError::TransportClosed`] when a session is already
    /// running; recorder errors when the package cannot be created.
    pub async fn start_capture(
        &self,
        mut provider: Box<dyn FrameProvider + Send>,
    ) -> ScanResult<String> {
        {
            let inner = self.inner.lock().await;
            if inner.active.is_some() {
                return Err(ScanError::TransportClosed(
                    "capture already running".to_string(),
                ));
            }
        }

        let material = self.identity.material().await?;
        let session_id = self
            .env
            .session_id
            .clone()
            .unwrap_or_else(|| ScanId::generate().to_string());

        let recorder = Arc::new(
            SessionRecorder::create(&self.sessions_root, &session_id, &material.device_id)
                .await?,
        );

        let transport = self.connect_transport(&material, &session_id).await;
        let streaming = transport.is_some();

        let pipeline = CapturePipeline::new(PipelineConfig {
            session_id: session_id.clone(),
            source_device_id: material.device_id.clone(),
            recorder: Arc::clone(&recorder),
            transport: transport.clone(),
        });

        if let Some(transport) = &transport {
            let handler_pipeline = Arc::clone(&pipeline);
            transport
                .set_backpressure_handler(Box::new(move |hint| {
                    handler_pipeline.apply_backpressure(&hint);
                }))
                .await;
        }

        let run_pipeline = Arc::clone(&pipeline);
        let run_task =
            tokio::spawn(async move { run_pipeline.run(provider.as_mut()).await });

        let mut inner = self.inner.lock().await;
        inner.state = ControllerState::Capturing;
        inner.status = Status::Capturing {
            session_id: session_id.clone(),
            streaming,
        };
        inner.active = Some(ActiveCapture {
            session_id: session_id.clone(),
            pipeline,
            transport,
            recorder,
            run_task,
        });
        Ok(session_id)
    }

    /// Attempts the streamed path for this session.
    ///
    /// Requires an imported QR whose desktop has a trust record; the
    /// client-TLS bundle rides along when one is installed.
    async fn connect_transport(
        &self,
        material: &crate::identity::DeviceIdentity,
        session_id: &str,
    ) -> Option<Arc<ScanTransport>> {
        let qr = self.inner.lock().await.qr.clone()?;
        let record = self.trust.trusted_peer(&qr.desktop_device_id).await?;

        let client_identity = match self.identity.client_tls_identity().await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(error = %err, "client TLS bundle unusable, connecting without it");
                None
            }
        };

        let transport = Arc::new(ScanTransport::new(material.clone(), session_id));
        let config = TransportConfig {
            host: qr.quic_host(),
            port: qr.quic_port(),
            pinned_fingerprint_sha256: record.peer_cert_fingerprint_sha256.clone(),
            client_identity,
        };
        match transport.connect(config).await {
            Ok(()) => Some(transport),
            Err(err) => {
                warn!(
                    error = %err,
                    peer = %record.peer_device_id,
                    "transport connect failed, recording locally only"
                );
                None
            }
        }
    }

    /// Stops the running session.
    ///
    /// Finalize always runs; the transport is always disconnected. The
    /// package is exported next to the session root when the bootstrap
    /// environment asked for it.
    ///
    /// # Errors
    ///
    /// Recorder finalize errors; the partial directory stays on disk.
    pub async fn stop_capture(&self) -> ScanResult<PathBuf> {
        let active = {
            let mut inner = self.inner.lock().await;
            inner.active.take().ok_or_else(|| {
                ScanError::TransportClosed("no capture running".to_string())
            })?
        };

        active.pipeline.stop();
        let run_result = active
            .run_task
            .await
            .map_err(|e| ScanError::TransportClosed(format!("pipeline task: {e}")))?;

        if let Some(transport) = &active.transport {
            transport.disconnect().await;
        }

        let mut inner = self.inner.lock().await;
        match run_result {
            Ok(path) => {
                if self.env.auto_export {
                    if let Err(err) = active.recorder.export(&self.sessions_root).await {
                        warn!(error = %err, "auto export failed");
                    }
                }
                inner.state = ControllerState::Finalized;
                inner.status = Status::Finalized { path: path.clone() };
                info!(session_id = %active.session_id, "capture finalized");
                Ok(path)
            }
            Err(err) => {
                inner.state = ControllerState::Finalized;
                inner.status = Status::Failed {
                    summary: err.to_string(),
                };
                Err(err)
            }
        }
    }

    /// Returns to idle after a finalized session.
    pub async fn acknowledge_finalized(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ControllerState::Finalized {
            inner.state = ControllerState::Idle;
            inner.status = Status::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::capture::CaptureFrame;

    struct CountingProvider {
        remaining: u32,
    }

    #[async_trait]
    impl FrameProvider for CountingProvider {
        async fn next_frame(&mut self) -> Option<CaptureFrame> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(CaptureFrame {
                timestamp_sec: f64::from(self.remaining) * 0.03,
                ..CaptureFrame::default()
            })
        }

        fn pause(&mut self) {}
    }

    async fn controller(dir: &tempfile::TempDir) -> ScanController {
        let identity = Arc::new(
            IdentityStore::open(dir.path().join("identity.json"))
                .await
                .unwrap(),
        );
        let trust = Arc::new(TrustStore::open(dir.path().join("trust.json")).await.unwrap());
        ScanController::new(
            identity,
            trust,
            dir.path().join("sessions"),
            "Test Scanner",
            BootstrapEnv::default(),
        )
    }

    #[tokio::test]
    async fn starts_idle() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir).await;
        assert_eq!(controller.state().await, ControllerState::Idle);
        assert_eq!(controller.status().await, Status::Idle);
    }

    #[tokio::test]
    async fn qr_import_updates_status_with_resolved_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir).await;

        let qr = crate::pairing::qr::testkit::valid_qr_value();
        controller
            .import_qr(&serde_json::to_vec(&qr).unwrap())
            .await
            .unwrap();

        match controller.status().await {
            Status::QrImported {
                host,
                pairing_port,
                quic_port,
            } => {
                assert_eq!(host, "192.168.1.44");
                assert_eq!(pairing_port, 7448);
                assert_eq!(quic_port, 7447);
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_qr_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir).await;

        let mut qr = crate::pairing::qr::testkit::valid_qr_value();
        qr["pairing_endpoint"] =
            serde_json::Value::String("http://192.168.1.44:7448/pairing/confirm".into());
        let result = controller
            .import_qr(&serde_json::to_vec(&qr).unwrap())
            .await;
        assert!(result.is_err());

        assert_eq!(controller.state().await, ControllerState::Idle);
        match controller.status().await {
            Status::Failed { summary } => assert!(summary.contains("https")),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_without_peer_degrades_to_local_only_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir).await;

        let session_id = controller
            .start_capture(Box::new(CountingProvider { remaining: 3 }))
            .await
            .unwrap();
        assert_eq!(controller.state().await, ControllerState::Capturing);
        match controller.status().await {
            Status::Capturing { streaming, .. } => assert!(!streaming),
            other => panic!("unexpected status: {other:?}"),
        }

        let path = controller.stop_capture().await.unwrap();
        assert_eq!(controller.state().await, ControllerState::Finalized);
        assert!(path.ends_with(&session_id));
        assert!(path.join("integrity.json").exists());

        controller.acknowledge_finalized().await;
        assert_eq!(controller.state().await, ControllerState::Idle);
    }

    #[tokio::test]
    async fn double_start_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir).await;

        controller
            .start_capture(Box::new(CountingProvider { remaining: 1000 }))
            .await
            .unwrap();
        let second = controller
            .start_capture(Box::new(CountingProvider { remaining: 1 }))
            .await;
        assert!(second.is_err());

        controller.stop_capture().await.unwrap();
    }

    #[tokio::test]
    async fn bootstrap_imports_the_injected_qr() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(
            IdentityStore::open(dir.path().join("identity.json"))
                .await
                .unwrap(),
        );
        let trust = Arc::new(TrustStore::open(dir.path().join("trust.json")).await.unwrap());
        let qr = crate::pairing::qr::testkit::valid_qr_value();
        let env = BootstrapEnv {
            qr_payload: Some(serde_json::to_vec(&qr).unwrap()),
            auto_capture_secs: Some(30),
            ..BootstrapEnv::default()
        };
        let controller = ScanController::new(
            identity,
            trust,
            dir.path().join("sessions"),
            "Test Scanner",
            env,
        );

        let auto_capture = controller.bootstrap().await.unwrap();
        assert_eq!(auto_capture, Some(std::time::Duration::from_secs(30)));
        assert!(matches!(
            controller.status().await,
            Status::QrImported { .. }
        ));
    }

    #[tokio::test]
    async fn session_id_override_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(
            IdentityStore::open(dir.path().join("identity.json"))
                .await
                .unwrap(),
        );
        let trust = Arc::new(TrustStore::open(dir.path().join("trust.json")).await.unwrap());
        let env = BootstrapEnv {
            session_id: Some("01PINNEDSESSION00000000000".to_string()),
            ..BootstrapEnv::default()
        };
        let controller = ScanController::new(
            identity,
            trust,
            dir.path().join("sessions"),
            "Test Scanner",
            env,
        );

        let session_id = controller
            .start_capture(Box::new(CountingProvider { remaining: 1 }))
            .await
            .unwrap();
        assert_eq!(session_id, "01PINNEDSESSION00000000000");
        controller.stop_capture().await.unwrap();
    }

    #[test]
    fn status_display_reads_naturally() {
        let status = Status::Capturing {
            session_id: "01S".to_string(),
            streaming: false,
        };
        assert_eq!(status.to_string(), "capturing 01S (local only)");
        assert_eq!(Status::Idle.to_string(), "idle");
    }
}
