//! Secure channel layered over the pinned stream transport.
//!
//! The channel provides two things on top of outer wire framing:
//!
//! 1. An authenticated handshake ([`handshake`]): the scanner signs a
//!    canonical hello payload with its long-lived device key, the peers
//!    exchange ephemeral P-256 public keys, and both derive the same
//!    AES-256 key and nonce prefix via HKDF-SHA256.
//! 2. Per-direction authenticated encryption ([`codec`]): every message
//!    is sealed into a counter-addressed AES-GCM envelope; receivers
//!    enforce strictly increasing counters, so a replayed frame is
//!    inert.
//!
//! Session keys live only as long as the connection; disconnecting
//! discards them.

pub mod codec;
pub mod error;
pub mod handshake;

pub use error::ChannelError;
