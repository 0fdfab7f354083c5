//! Protocol primitives for the provinode room-scan data plane.
//!
//! This crate holds everything both ends of the scan link agree on and
//! nothing that touches a device's disk or sensors:
//!
//! - [`ident`]: sortable 26-character identifiers and SHA-256 helpers
//! - [`sample`]: capture sample envelopes and typed control messages
//! - [`wire`]: the outer `[channel | len | payload]` frame codec
//! - [`channel`]: the secure channel (signed hello handshake, ECDH+HKDF
//!   key agreement, counter-addressed AEAD envelopes)
//! - [`discovery`]: the TXT-record fields the scan core consumes from
//!   LAN service discovery
//!
//! The device-side agent (identity and trust stores, pairing, the framed
//! transport client, the session recorder, and the capture pipeline)
//! lives in `provinode-scan`.

pub mod channel;
pub mod discovery;
pub mod ident;
pub mod sample;
pub mod wire;

pub use channel::codec::{PayloadChannel, SealedEnvelope, SecureSession, SecureSessionKeys};
pub use channel::handshake::{
    ClientHandshake, ResponderHandshake, SecureChannelAck, SecureChannelHello, PROTOCOL_ID,
};
pub use channel::ChannelError;
pub use discovery::AdvertisedPeer;
pub use ident::{normalize_fingerprint, sha256_hex, ScanId};
pub use sample::{BackpressureHint, ControlMessage, ResumeCheckpoint, SampleEnvelope, SampleKind};
pub use wire::{WireChannel, WireFrame, WireFrameCodec, MAX_WIRE_FRAME_SIZE};
