//! End-to-end transport tests against an in-process desktop peer.
//!
//! The peer speaks the real protocol over an in-memory duplex stream:
//! outer wire frames, the responder side of the secure handshake, and
//! sealed envelopes in both directions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use provinode_core::channel::codec::{PayloadChannel, SealedEnvelope, SecureSession};
use provinode_core::channel::handshake::{ResponderHandshake, SecureChannelHello};
use provinode_core::sample::{
    BackpressureHint, ControlMessage, ResumeCheckpoint, SampleEnvelope, SampleKind,
    STREAM_ID_DESKTOP_RESUME,
};
use provinode_core::wire::{WireChannel, WireFrame, WireFrameCodec};
use provinode_scan::identity::IdentityStore;
use provinode_scan::transport::ScanTransport;

const SESSION: &str = "01SESSIONRESUME00000000000";

/// Minimal desktop-side peer for driving the client.
struct TestDesktop {
    framed: Framed<DuplexStream, WireFrameCodec>,
    session: SecureSession,
}

impl TestDesktop {
    /// Accepts the handshake and derives the session keys.
    async fn accept(stream: DuplexStream) -> Self {
        let mut framed = Framed::new(stream, WireFrameCodec::new());
        let hello_frame = framed
            .next()
            .await
            .expect("hello frame")
            .expect("hello decode");
        assert_eq!(hello_frame.channel, WireChannel::Handshake);

        let hello: SecureChannelHello =
            serde_json::from_slice(&hello_frame.payload).expect("hello parse");
        let (ack, keys) = ResponderHandshake::respond(&hello).expect("responder");
        framed
            .send(WireFrame::new(
                WireChannel::Handshake,
                Bytes::from(serde_json::to_vec(&ack).unwrap()),
            ))
            .await
            .expect("ack send");

        Self {
            framed,
            session: SecureSession::new(keys),
        }
    }

    /// Receives and opens the next sealed envelope.
    async fn recv(&mut self) -> (PayloadChannel, Vec<u8>) {
        loop {
            let frame = timeout(Duration::from_secs(5), self.framed.next())
                .await
                .expect("recv timeout")
                .expect("stream open")
                .expect("frame decode");
            assert_eq!(frame.channel, WireChannel::Sealed);
            let envelope: SealedEnvelope =
                serde_json::from_slice(&frame.payload).expect("sealed parse");
            if let Some(opened) = self.session.open(&envelope).expect("open") {
                return opened;
            }
        }
    }

    /// Receives the next sample frame, returning its envelope and payload.
    async fn recv_sample(&mut self) -> (SampleEnvelope, Vec<u8>) {
        let (channel, plaintext) = self.recv().await;
        assert_eq!(channel, PayloadChannel::Sample);
        let env_len = u32::from_be_bytes(plaintext[..4].try_into().unwrap()) as usize;
        let envelope: SampleEnvelope =
            serde_json::from_slice(&plaintext[4..4 + env_len]).expect("envelope parse");
        (envelope, plaintext[4 + env_len..].to_vec())
    }

    /// Receives the next control message.
    async fn recv_control(&mut self) -> ControlMessage {
        let (channel, plaintext) = self.recv().await;
        assert_eq!(channel, PayloadChannel::Control);
        serde_json::from_slice(&plaintext).expect("control parse")
    }

    /// Sends a control message to the device.
    async fn send_control(&mut self, message: &ControlMessage) {
        let plaintext = serde_json::to_vec(message).unwrap();
        let envelope = self
            .session
            .seal(PayloadChannel::Control, &plaintext)
            .expect("seal");
        self.framed
            .send(WireFrame::new(
                WireChannel::Sealed,
                Bytes::from(serde_json::to_vec(&envelope).unwrap()),
            ))
            .await
            .expect("control send");
    }
}

fn checkpoint(ack: i64, stream_id: &str) -> ControlMessage {
    ControlMessage::ResumeCheckpoint(ResumeCheckpoint {
        session_id: SESSION.to_string(),
        last_acked_sample_seq: ack,
        captured_at_utc: "2026-07-01T10:00:00Z".to_string(),
        stream_id: stream_id.to_string(),
    })
}

fn sample(seq: i64, payload: &[u8]) -> SampleEnvelope {
    SampleEnvelope::for_payload(
        SESSION,
        seq,
        seq * 1_000,
        "device-monotonic",
        SampleKind::Heartbeat,
        payload,
        BTreeMap::new(),
    )
}

async fn connected_pair(dir: &tempfile::TempDir) -> (Arc<ScanTransport>, TestDesktop) {
    let identity = IdentityStore::open(dir.path().join("identity.json"))
        .await
        .unwrap();
    let material = identity.material().await.unwrap();

    let (device_side, desktop_side) = tokio::io::duplex(256 * 1024);
    let transport = Arc::new(ScanTransport::new(material, SESSION));

    let (attach, mut desktop) = tokio::join!(
        transport.attach_stream(Box::new(device_side)),
        TestDesktop::accept(desktop_side),
    );
    attach.expect("attach");

    // The first message after the handshake is the device checkpoint.
    match desktop.recv_control().await {
        ControlMessage::ResumeCheckpoint(initial) => {
            assert_eq!(initial.session_id, SESSION);
            assert_eq!(initial.last_acked_sample_seq, -1);
            assert_eq!(initial.stream_id, "scan-device");
        }
        other => panic!("expected initial checkpoint, got {other:?}"),
    }

    (transport, desktop)
}

async fn wait_for_buffer_len(transport: &ScanTransport, expected: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            if transport.replay_buffer_len().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!("replay buffer never reached {expected} entries");
    });
}

#[tokio::test]
async fn samples_stream_through_the_sealed_channel() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, mut desktop) = connected_pair(&dir).await;

    let envelope = sample(0, b"payload");
    transport.send_sample(&envelope, b"payload").await.unwrap();

    let (received, payload) = desktop.recv_sample().await;
    assert_eq!(received, envelope);
    assert_eq!(payload, b"payload");

    transport.disconnect().await;
}

#[tokio::test]
async fn desktop_resume_retransmits_exactly_the_unacked_frames() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, mut desktop) = connected_pair(&dir).await;

    for seq in 0..3 {
        let payload = format!("sample-{seq}");
        transport
            .send_sample(&sample(seq, payload.as_bytes()), payload.as_bytes())
            .await
            .unwrap();
        desktop.recv_sample().await;
    }
    assert_eq!(transport.replay_buffer_len().await, 3);

    // Peer acks seq 0 and asks for a resume.
    desktop
        .send_control(&checkpoint(0, STREAM_ID_DESKTOP_RESUME))
        .await;

    // Exactly seq 1 and 2 come back, ascending.
    let (first, first_payload) = desktop.recv_sample().await;
    let (second, second_payload) = desktop.recv_sample().await;
    assert_eq!(first.sample_seq, 1);
    assert_eq!(second.sample_seq, 2);
    assert_eq!(first_payload, b"sample-1");
    assert_eq!(second_payload, b"sample-2");

    // Both retransmitted frames stay buffered until a later ack.
    wait_for_buffer_len(&transport, 2).await;
    assert_eq!(transport.last_acked_sample_seq(), 0);

    desktop.send_control(&checkpoint(2, "desktop")).await;
    wait_for_buffer_len(&transport, 0).await;
    assert_eq!(transport.last_acked_sample_seq(), 2);

    transport.disconnect().await;
}

#[tokio::test]
async fn plain_checkpoint_trims_without_retransmission() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, mut desktop) = connected_pair(&dir).await;

    for seq in 0..2 {
        transport
            .send_sample(&sample(seq, b"x"), b"x")
            .await
            .unwrap();
        desktop.recv_sample().await;
    }

    desktop.send_control(&checkpoint(1, "desktop")).await;
    wait_for_buffer_len(&transport, 0).await;

    // No retransmission: send one more sample and confirm it is the
    // very next thing the desktop sees.
    transport.send_sample(&sample(2, b"next"), b"next").await.unwrap();
    let (envelope, _) = desktop.recv_sample().await;
    assert_eq!(envelope.sample_seq, 2);

    transport.disconnect().await;
}

#[tokio::test]
async fn backpressure_hints_reach_the_installed_handler() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, mut desktop) = connected_pair(&dir).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .set_backpressure_handler(Box::new(move |hint| {
            let _ = tx.send(hint);
        }))
        .await;

    desktop
        .send_control(&ControlMessage::BackpressureHint(BackpressureHint {
            target_keyframe_fps: 0.5,
            depth_stride_hint: 4,
            mesh_update_interval_ms: 2_000,
            drop_non_keyframes: true,
        }))
        .await;

    let hint = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("hint timeout")
        .expect("hint delivered");
    assert_eq!(hint.depth_stride_hint, 4);
    assert!(hint.drop_non_keyframes);

    transport.disconnect().await;
}

#[tokio::test]
async fn disconnect_is_idempotent_and_sends_fail_afterwards() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, _desktop) = connected_pair(&dir).await;

    transport.disconnect().await;
    transport.disconnect().await;

    let result = transport.send_sample(&sample(0, b"late"), b"late").await;
    assert!(result.is_err());
}
