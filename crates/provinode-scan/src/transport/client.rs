//! Framed transport client.
//!
//! # Connection lifecycle
//!
//! 1. Dial TCP, then TLS with the pinned-leaf verifier ([`super::tls`]).
//! 2. Drive the secure handshake on wire channel `0x01`; nothing else
//!    may be sent before it completes.
//! 3. Send the initial `ResumeCheckpoint` carrying the locally tracked
//!    high-water mark (−1 for a new session).
//! 4. Spawn the receive task; route inbound control messages.
//!
//! Sample frames are buffered in the replay buffer as they are sent; a
//! peer checkpoint trims the buffer, and a peer resume request replays
//! everything past the acknowledged sequence.
//!
//! AEAD failures, replay-window violations at the wire level, and
//! counter exhaustion are fatal: the session state is cleared and the
//! connection is torn down.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use provinode_core::channel::codec::{PayloadChannel, SealedEnvelope, SecureSession};
use provinode_core::channel::handshake::{ClientHandshake, SecureChannelAck};
use provinode_core::sample::{
    BackpressureHint, ControlMessage, ResumeCheckpoint, SampleEnvelope,
    STREAM_ID_DESKTOP_RESUME, STREAM_ID_SCAN_DEVICE,
};
use provinode_core::wire::{WireChannel, WireFrame, WireFrameCodec};

use crate::error::{ScanError, ScanResult};
use crate::identity::{ClientTlsIdentity, DeviceIdentity};
use crate::transport::replay::ReplayBuffer;
use crate::transport::tls;

/// TCP dial timeout.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS handshake timeout.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Secure channel handshake timeout.
pub const CHANNEL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can carry the framed protocol.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Boxed stream the framed protocol runs over.
pub type BoxedStream = Box<dyn IoStream>;
type FrameSink = SplitSink<Framed<BoxedStream, WireFrameCodec>, WireFrame>;
type FrameStream = SplitStream<Framed<BoxedStream, WireFrameCodec>>;

/// Handler invoked for inbound backpressure hints.
pub type BackpressureHandler = Box<dyn Fn(BackpressureHint) + Send + Sync>;

/// Endpoint and identity configuration for a connection attempt.
pub struct TransportConfig {
    /// Peer host (address or name).
    pub host: String,
    /// Peer stream port.
    pub port: u16,
    /// Pinned peer leaf fingerprint, lowercase hex.
    pub pinned_fingerprint_sha256: String,
    /// Optional client mutual-TLS identity.
    pub client_identity: Option<ClientTlsIdentity>,
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("mutual_tls", &self.client_identity.is_some())
            .finish_non_exhaustive()
    }
}

/// Shared state between the public handle and the receive task.
struct Shared {
    session_id: String,
    sink: Mutex<Option<FrameSink>>,
    secure: Mutex<Option<SecureSession>>,
    replay: Mutex<ReplayBuffer>,
    last_acked: AtomicI64,
    backpressure: Mutex<Option<BackpressureHandler>>,
    cancel: Mutex<CancellationToken>,
}

/// Client for the framed scan stream.
///
/// One instance serves one capture session; it survives reconnects so
/// the replay buffer and high-water mark carry across.
pub struct ScanTransport {
    identity: DeviceIdentity,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ScanTransport {
    /// Creates a disconnected transport for `session_id`.
    #[must_use]
    pub fn new(identity: DeviceIdentity, session_id: &str) -> Self {
        Self {
            identity,
            shared: Arc::new(Shared {
                session_id: session_id.to_string(),
                sink: Mutex::new(None),
                secure: Mutex::new(None),
                replay: Mutex::new(ReplayBuffer::new()),
                last_acked: AtomicI64::new(-1),
                backpressure: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Installs the handler for inbound backpressure hints.
    pub async fn set_backpressure_handler(&self, handler: BackpressureHandler) {
        *self.shared.backpressure.lock().await = Some(handler);
    }

    /// Highest sample sequence the peer has acknowledged.
    #[must_use]
    pub fn last_acked_sample_seq(&self) -> i64 {
        self.shared.last_acked.load(Ordering::SeqCst)
    }

    /// Dials the peer over pinned TLS and establishes the channel.
    ///
    /// # Errors
    ///
    /// [`ScanError::UntrustedEndpoint`] without a usable pin;
    /// [`ScanError::TransportClosed`] for dial and stream failures;
    /// [`ScanError::HandshakeMismatch`] when the secure handshake is
    /// refused.
    pub async fn connect(&self, config: TransportConfig) -> ScanResult<()> {
        let tls_config = tls::pinned_client_config(
            &config.pinned_fingerprint_sha256,
            config.client_identity.as_ref(),
        )?;

        let addr = format!("{}:{}", config.host, config.port);
        let tcp = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ScanError::TransportClosed(format!("TCP connect timeout to {addr}")))?
            .map_err(|e| ScanError::TransportClosed(format!("TCP connect to {addr}: {e}")))?;

        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| ScanError::TransportClosed(format!("server name: {e}")))?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let stream = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ScanError::TransportClosed("TLS handshake timeout".to_string()))?
            .map_err(|e| ScanError::TransportClosed(format!("TLS handshake: {e}")))?;

        info!(host = %config.host, port = config.port, "pinned TLS stream established");
        self.attach_stream(Box::new(stream)).await
    }

    /// Establishes the secure channel over an already-connected stream.
    ///
    /// Drives the handshake, sends the initial resume checkpoint, and
    /// spawns the receive task. Used directly by tests over in-memory
    /// duplex streams.
    ///
    /// # Errors
    ///
    /// See [`ScanTransport::connect`].
    pub async fn attach_stream(&self, stream: BoxedStream) -> ScanResult<()> {
        self.disconnect().await;

        let mut framed = Framed::new(stream, WireFrameCodec::new());

        // Handshake must complete before any other traffic is sent.
        let handshake = ClientHandshake::initiate(
            &self.identity.signing_key,
            &self.identity.device_id,
            &self.identity.cert_fingerprint_sha256,
            &self.shared.session_id,
        );
        let hello_bytes = serde_json::to_vec(handshake.hello())
            .map_err(|e| ScanError::TransportClosed(format!("hello encode: {e}")))?;
        framed
            .send(WireFrame::new(WireChannel::Handshake, Bytes::from(hello_bytes)))
            .await
            .map_err(|e| ScanError::TransportClosed(format!("hello send: {e}")))?;

        let ack_frame = timeout(CHANNEL_HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| ScanError::TransportClosed("handshake timeout".to_string()))?
            .ok_or_else(|| ScanError::TransportClosed("stream closed during handshake".to_string()))?
            .map_err(|e| ScanError::TransportClosed(format!("handshake frame: {e}")))?;
        if ack_frame.channel != WireChannel::Handshake {
            return Err(ScanError::HandshakeMismatch(format!(
                "expected handshake frame, got {:?}",
                ack_frame.channel
            )));
        }
        let ack: SecureChannelAck = serde_json::from_slice(&ack_frame.payload)
            .map_err(|e| ScanError::HandshakeMismatch(format!("ack parse: {e}")))?;
        let keys = handshake.complete(&ack)?;

        *self.shared.secure.lock().await = Some(SecureSession::new(keys));
        let (sink, stream) = framed.split();
        *self.shared.sink.lock().await = Some(sink);

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock().await = cancel.clone();

        // Initial checkpoint: tell the peer where our world ends.
        let checkpoint = ControlMessage::ResumeCheckpoint(ResumeCheckpoint {
            session_id: self.shared.session_id.clone(),
            last_acked_sample_seq: self.shared.last_acked.load(Ordering::SeqCst),
            captured_at_utc: chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            stream_id: STREAM_ID_SCAN_DEVICE.to_string(),
        });
        send_sealed(&self.shared, PayloadChannel::Control, &encode_control(&checkpoint)?).await?;

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            receive_loop(shared, stream, cancel).await;
        });
        *self.reader.lock().await = Some(handle);

        info!(session_id = %self.shared.session_id, "secure channel established");
        Ok(())
    }

    /// Sends a control value on the secure control channel.
    ///
    /// # Errors
    ///
    /// [`ScanError::TransportClosed`] when disconnected; channel-layer
    /// failures map to their fatal kinds.
    pub async fn send_control(&self, message: &ControlMessage) -> ScanResult<()> {
        send_sealed(&self.shared, PayloadChannel::Control, &encode_control(message)?).await
    }

    /// Sends a sample frame and buffers it for resume replay.
    ///
    /// The inner plaintext layout is `[env_len u32 BE][env_json][payload]`.
    ///
    /// # Errors
    ///
    /// [`ScanError::TransportClosed`] when disconnected; counter
    /// exhaustion and AEAD failures tear the session down.
    pub async fn send_sample(&self, envelope: &SampleEnvelope, payload: &[u8]) -> ScanResult<()> {
        let frame = encode_sample_frame(envelope, payload)?;

        {
            let mut replay = self.shared.replay.lock().await;
            replay.record(&envelope.session_id, envelope.sample_seq, frame.clone());
        }

        send_sealed(&self.shared, PayloadChannel::Sample, &frame).await
    }

    /// Number of frames currently held for resume replay.
    pub async fn replay_buffer_len(&self) -> usize {
        self.shared.replay.lock().await.len()
    }

    /// Tears the connection down. Idempotent.
    ///
    /// Cancels the receive task, closes the stream, and discards the
    /// secure session and its counters. The replay buffer and the
    /// high-water mark survive for a later resume.
    pub async fn disconnect(&self) {
        self.shared.cancel.lock().await.cancel();
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        *self.shared.sink.lock().await = None;
        *self.shared.secure.lock().await = None;
        debug!(session_id = %self.shared.session_id, "transport disconnected");
    }
}

fn encode_control(message: &ControlMessage) -> ScanResult<Vec<u8>> {
    serde_json::to_vec(message)
        .map_err(|e| ScanError::TransportClosed(format!("control encode: {e}")))
}

/// Builds the inner plaintext for one sample frame.
fn encode_sample_frame(envelope: &SampleEnvelope, payload: &[u8]) -> ScanResult<Bytes> {
    let env_json = serde_json::to_vec(envelope)
        .map_err(|e| ScanError::TransportClosed(format!("envelope encode: {e}")))?;
    let mut frame = BytesMut::with_capacity(4 + env_json.len() + payload.len());
    frame.put_u32(env_json.len() as u32);
    frame.extend_from_slice(&env_json);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Seals `plaintext` and writes it as a wire frame.
///
/// Fatal channel errors (counter exhaustion) clear the secure session
/// before surfacing.
async fn send_sealed(
    shared: &Arc<Shared>,
    payload_channel: PayloadChannel,
    plaintext: &[u8],
) -> ScanResult<()> {
    let envelope = {
        let mut secure = shared.secure.lock().await;
        let session = secure
            .as_mut()
            .ok_or_else(|| ScanError::TransportClosed("no secure session".to_string()))?;
        match session.seal(payload_channel, plaintext) {
            Ok(envelope) => envelope,
            Err(err) => {
                *secure = None;
                return Err(err.into());
            }
        }
    };

    let bytes = serde_json::to_vec(&envelope)
        .map_err(|e| ScanError::TransportClosed(format!("sealed encode: {e}")))?;

    let mut sink = shared.sink.lock().await;
    let sink_ref = sink
        .as_mut()
        .ok_or_else(|| ScanError::TransportClosed("not connected".to_string()))?;
    sink_ref
        .send(WireFrame::new(WireChannel::Sealed, Bytes::from(bytes)))
        .await
        .map_err(|e| ScanError::TransportClosed(format!("frame send: {e}")))?;
    Ok(())
}

/// Receive task: reassemble, decrypt, route.
async fn receive_loop(shared: Arc<Shared>, mut stream: FrameStream, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            None => {
                debug!("peer closed the stream");
                break;
            }
            Some(Err(err)) => {
                warn!(error = %err, "wire decode failure, tearing down");
                break;
            }
            Some(Ok(frame)) => {
                if let Err(err) = handle_frame(&shared, frame).await {
                    warn!(error = %err, "fatal inbound frame, tearing down");
                    break;
                }
            }
        }
    }

    // Session keys never outlive the connection.
    *shared.secure.lock().await = None;
    *shared.sink.lock().await = None;
}

async fn handle_frame(shared: &Arc<Shared>, frame: WireFrame) -> ScanResult<()> {
    match frame.channel {
        WireChannel::Handshake => {
            debug!("ignoring handshake frame after establishment");
            Ok(())
        }
        WireChannel::RawSample => {
            // Unreachable in practice: the codec refuses 0x02 at decode.
            Err(ScanError::TransportClosed(
                "legacy raw-sample frame".to_string(),
            ))
        }
        WireChannel::Sealed => {
            let envelope: SealedEnvelope = serde_json::from_slice(&frame.payload)
                .map_err(|e| ScanError::TransportClosed(format!("sealed parse: {e}")))?;

            let opened = {
                let mut secure = shared.secure.lock().await;
                let session = secure
                    .as_mut()
                    .ok_or_else(|| ScanError::TransportClosed("no secure session".to_string()))?;
                match session.open(&envelope) {
                    Ok(opened) => opened,
                    Err(err) => {
                        *secure = None;
                        return Err(err.into());
                    }
                }
            };

            match opened {
                None => Ok(()), // replayed frame, silently dropped
                Some((PayloadChannel::Control, plaintext)) => {
                    let message: ControlMessage = serde_json::from_slice(&plaintext)
                        .map_err(|e| ScanError::TransportClosed(format!("control parse: {e}")))?;
                    handle_control(shared, message).await
                }
                Some((PayloadChannel::Sample, _)) => {
                    debug!("ignoring inbound sample frame on device side");
                    Ok(())
                }
            }
        }
    }
}

async fn handle_control(shared: &Arc<Shared>, message: ControlMessage) -> ScanResult<()> {
    match message {
        ControlMessage::ResumeCheckpoint(checkpoint) => {
            if checkpoint.session_id != shared.session_id {
                warn!(
                    theirs = %checkpoint.session_id,
                    ours = %shared.session_id,
                    "checkpoint for foreign session ignored"
                );
                return Ok(());
            }

            let ack = checkpoint.last_acked_sample_seq;
            shared.last_acked.fetch_max(ack, Ordering::SeqCst);

            let resume_frames = {
                let mut replay = shared.replay.lock().await;
                replay.trim_through(ack);
                if checkpoint.stream_id == STREAM_ID_DESKTOP_RESUME {
                    replay.frames_after(ack)
                } else {
                    Vec::new()
                }
            };

            if !resume_frames.is_empty() {
                info!(
                    ack,
                    count = resume_frames.len(),
                    "retransmitting buffered frames for resume"
                );
                for (seq, frame) in resume_frames {
                    debug!(seq, "retransmit");
                    send_sealed(shared, PayloadChannel::Sample, &frame).await?;
                }
            }
            Ok(())
        }
        ControlMessage::BackpressureHint(hint) => {
            if let Some(handler) = shared.backpressure.lock().await.as_ref() {
                handler(hint);
            } else {
                debug!("backpressure hint received with no handler installed");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_frame_layout_is_len_env_payload() {
        let envelope = SampleEnvelope::for_payload(
            "01SESSION",
            3,
            77,
            "mono",
            provinode_core::sample::SampleKind::Heartbeat,
            b"beat",
            Default::default(),
        );
        let frame = encode_sample_frame(&envelope, b"beat").unwrap();

        let env_len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        let env: SampleEnvelope = serde_json::from_slice(&frame[4..4 + env_len]).unwrap();
        assert_eq!(env, envelope);
        assert_eq!(&frame[4 + env_len..], b"beat");
    }
}
