//! Framed transport client over a pinned TLS stream.
//!
//! The transport owns one byte stream to the desktop peer. Everything
//! on it is outer-framed ([`provinode_core::wire`]); after the secure
//! handshake completes, all traffic rides inside AEAD-sealed envelopes
//! on wire channel `0x03`. The client also owns the bounded replay
//! buffer that makes reconnect resume possible.

pub mod client;
pub mod replay;
pub mod tls;

pub use client::{ScanTransport, TransportConfig};
pub use replay::ReplayBuffer;
pub use tls::PinnedCertVerifier;
