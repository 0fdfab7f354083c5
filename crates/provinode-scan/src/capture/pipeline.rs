//! Frame-driven capture pipeline.
//!
//! Every frame produces a pose and an intrinsics sample; keyframes,
//! depth frames, and mesh batches are rate-limited by tunables the
//! desktop adjusts at runtime through `BackpressureHint` messages. All
//! emissions flow through one path that hashes the payload, takes the
//! next sequence number, records locally, and forwards to the
//! transport when one is attached. A transport failure never loses the
//! local recording; it bumps the drop counter and the session goes on.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use provinode_core::sample::{BackpressureHint, SampleEnvelope, SampleKind};

use crate::capture::frames::{
    encode_heartbeat, encode_intrinsics, encode_mesh_batch, encode_pose, CaptureFrame,
    FrameProvider, MeshAnchor,
};
use crate::capture::sequencer::SampleSequencer;
use crate::error::ScanResult;
use crate::recorder::SessionRecorder;
use crate::transport::ScanTransport;

/// Heartbeat cadence in frames.
const HEARTBEAT_EVERY_FRAMES: u64 = 30;

/// Clock id stamped on every envelope.
const CLOCK_ID: &str = "device-monotonic";

/// Lower bound for interval tunables, in seconds.
const MIN_INTERVAL_SEC: f64 = 0.1;

/// Pipeline construction parameters.
pub struct PipelineConfig {
    /// Session the pipeline produces for.
    pub session_id: String,
    /// Device id stamped into sample metadata.
    pub source_device_id: String,
    /// Session package writer.
    pub recorder: Arc<SessionRecorder>,
    /// Stream transport; absent for local-only capture.
    pub transport: Option<Arc<ScanTransport>>,
}

/// Capture tunables derived from backpressure hints.
#[derive(Debug, Clone, PartialEq)]
struct Tunables {
    keyframe_interval_sec: f64,
    depth_stride: u32,
    mesh_interval_sec: f64,
    drop_non_keyframes: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            keyframe_interval_sec: 1.0,
            depth_stride: 1,
            mesh_interval_sec: 1.0,
            drop_non_keyframes: false,
        }
    }
}

impl Tunables {
    fn apply(&mut self, hint: &BackpressureHint) {
        self.keyframe_interval_sec = if hint.target_keyframe_fps <= 0.0 {
            1.0
        } else {
            (1.0 / hint.target_keyframe_fps).max(MIN_INTERVAL_SEC)
        };
        self.depth_stride = hint.depth_stride_hint.max(1);
        self.mesh_interval_sec =
            (hint.mesh_update_interval_ms as f64 / 1000.0).max(MIN_INTERVAL_SEC);
        self.drop_non_keyframes = hint.drop_non_keyframes;
    }
}

#[derive(Debug)]
struct PipelineState {
    sequencer: SampleSequencer,
    frame_counter: u64,
    samples_total: u64,
    samples_dropped: u64,
    last_keyframe_ts: f64,
    last_mesh_ts: f64,
    last_capture_time_ns: i64,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            sequencer: SampleSequencer::new(),
            frame_counter: 0,
            samples_total: 0,
            samples_dropped: 0,
            last_keyframe_ts: f64::NEG_INFINITY,
            last_mesh_ts: f64::NEG_INFINITY,
            last_capture_time_ns: 0,
        }
    }
}

/// Orchestrates sample production for one session.
pub struct CapturePipeline {
    session_id: String,
    source_device_id: String,
    recorder: Arc<SessionRecorder>,
    transport: Option<Arc<ScanTransport>>,
    state: Mutex<PipelineState>,
    // Std mutex: hints arrive through a synchronous handler installed
    // on the transport's receive task.
    tunables: std::sync::Mutex<Tunables>,
    cancel: CancellationToken,
}

impl CapturePipeline {
    /// Creates a pipeline; nothing runs until [`CapturePipeline::run`].
    #[must_use]
    pub fn new(config: PipelineConfig) -> Arc<Self> {
        Arc::new(Self {
            session_id: config.session_id,
            source_device_id: config.source_device_id,
            recorder: config.recorder,
            transport: config.transport,
            state: Mutex::new(PipelineState::default()),
            tunables: std::sync::Mutex::new(Tunables::default()),
            cancel: CancellationToken::new(),
        })
    }

    /// Applies a backpressure hint. Safe to call from any thread.
    pub fn apply_backpressure(&self, hint: &BackpressureHint) {
        let mut tunables = self.tunables.lock().expect("tunables lock poisoned");
        tunables.apply(hint);
        debug!(?tunables, "backpressure applied");
    }

    /// Requests a stop; the running [`CapturePipeline::run`] call
    /// finalizes and returns.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Drives the pipeline until the provider ends or a stop arrives,
    /// then pauses the source, emits the final heartbeat, and
    /// finalizes the recorder.
    ///
    /// Returns the finalized session directory.
    ///
    /// # Errors
    ///
    /// [`crate::error::ScanError::RecorderIoFailure`] when finalize
    /// cannot write the package.
    pub async fn run(
        self: &Arc<Self>,
        provider: &mut (dyn FrameProvider + Send),
    ) -> ScanResult<PathBuf> {
        info!(session_id = %self.session_id, "capture pipeline running");
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break,
                frame = provider.next_frame() => frame,
            };
            match frame {
                Some(frame) => self.process_frame(frame).await,
                None => break,
            }
        }

        provider.pause();

        // Final heartbeat and finalize run to completion even on a
        // user-initiated stop.
        let frame_counter = self.state.lock().await.frame_counter;
        self.emit(
            SampleKind::Heartbeat,
            self.current_time_ns().await,
            encode_heartbeat(frame_counter, true),
            BTreeMap::new(),
        )
        .await;

        let (samples_total, samples_dropped) = {
            let state = self.state.lock().await;
            (state.samples_total, state.samples_dropped)
        };
        let mut summary = BTreeMap::new();
        summary.insert("samples_total".to_string(), samples_total.to_string());
        summary.insert("samples_dropped".to_string(), samples_dropped.to_string());

        let dir = self.recorder.finalize(summary).await?;
        info!(
            session_id = %self.session_id,
            samples_total,
            samples_dropped,
            "capture pipeline stopped"
        );
        Ok(dir)
    }

    async fn current_time_ns(&self) -> i64 {
        self.state.lock().await.last_capture_time_ns
    }

    async fn process_frame(&self, frame: CaptureFrame) {
        let tunables = {
            self.tunables
                .lock()
                .expect("tunables lock poisoned")
                .clone()
        };

        let (frame_counter, capture_time_ns, emit_keyframe, emit_depth, emit_mesh) = {
            let mut state = self.state.lock().await;
            state.frame_counter += 1;

            // Envelope times never run backwards within a session.
            let raw_ns = (frame.timestamp_sec * 1e9) as i64;
            let capture_time_ns = raw_ns.max(state.last_capture_time_ns);
            state.last_capture_time_ns = capture_time_ns;

            let emit_keyframe = frame.image_jpeg.is_some()
                && frame.timestamp_sec - state.last_keyframe_ts >= tunables.keyframe_interval_sec;
            if emit_keyframe {
                state.last_keyframe_ts = frame.timestamp_sec;
            }

            let emit_depth = !tunables.drop_non_keyframes
                && frame.depth_map.is_some()
                && state.frame_counter % u64::from(tunables.depth_stride) == 0;

            let geometry = frame.mesh_anchors.iter().any(MeshAnchor::has_geometry);
            let emit_mesh = !tunables.drop_non_keyframes
                && geometry
                && frame.timestamp_sec - state.last_mesh_ts >= tunables.mesh_interval_sec;
            if emit_mesh {
                state.last_mesh_ts = frame.timestamp_sec;
            }

            (
                state.frame_counter,
                capture_time_ns,
                emit_keyframe,
                emit_depth,
                emit_mesh,
            )
        };

        // Pose and intrinsics go out for every frame.
        self.emit(
            SampleKind::CameraPose,
            capture_time_ns,
            encode_pose(&frame.pose),
            BTreeMap::new(),
        )
        .await;
        self.emit(
            SampleKind::Intrinsics,
            capture_time_ns,
            encode_intrinsics(&frame.intrinsics, frame.resolution),
            BTreeMap::new(),
        )
        .await;

        if emit_keyframe {
            let image = frame.image_jpeg.clone().unwrap_or_default();
            let mut metadata = BTreeMap::new();
            metadata.insert("encoding".to_string(), "jpeg".to_string());
            self.emit(SampleKind::KeyframeRgb, capture_time_ns, image, metadata)
                .await;
        }

        if emit_depth {
            let depth = frame.depth_map.clone().unwrap_or_default();
            self.emit(SampleKind::DepthFrame, capture_time_ns, depth, BTreeMap::new())
                .await;
        }

        if emit_mesh {
            let anchors: Vec<_> = frame
                .mesh_anchors
                .iter()
                .filter(|anchor| anchor.has_geometry())
                .cloned()
                .collect();
            let mut metadata = BTreeMap::new();
            metadata.insert("anchor_count".to_string(), anchors.len().to_string());
            self.emit(
                SampleKind::MeshAnchorBatch,
                capture_time_ns,
                encode_mesh_batch(&anchors),
                metadata,
            )
            .await;
        }

        if frame_counter % HEARTBEAT_EVERY_FRAMES == 0 {
            self.emit(
                SampleKind::Heartbeat,
                capture_time_ns,
                encode_heartbeat(frame_counter, false),
                BTreeMap::new(),
            )
            .await;
        }
    }

    /// The single emission path: hash, sequence, record, forward.
    ///
    /// Failures are isolated per sample; neither side's failure stops
    /// the session.
    async fn emit(
        &self,
        kind: SampleKind,
        capture_time_ns: i64,
        payload: Vec<u8>,
        mut metadata: BTreeMap<String, String>,
    ) {
        metadata.insert(
            "source_device_id".to_string(),
            self.source_device_id.clone(),
        );

        let envelope = {
            let mut state = self.state.lock().await;
            let seq = state.sequencer.next();
            SampleEnvelope::for_payload(
                &self.session_id,
                seq,
                capture_time_ns,
                CLOCK_ID,
                kind,
                &payload,
                metadata,
            )
        };

        match self.recorder.record(&envelope, &payload).await {
            Ok(()) => {
                self.state.lock().await.samples_total += 1;
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                state.samples_dropped += 1;
                warn!(
                    error = %err,
                    seq = envelope.sample_seq,
                    kind = %kind,
                    "recorder write failed, sample dropped"
                );
                return;
            }
        }

        if let Some(transport) = &self.transport {
            if let Err(err) = transport.send_sample(&envelope, &payload).await {
                let mut state = self.state.lock().await;
                state.samples_dropped += 1;
                warn!(
                    error = %err,
                    seq = envelope.sample_seq,
                    kind = %kind,
                    "transport send failed, sample recorded locally only"
                );
            }
        }
    }
}
