//! Out-of-band pairing against a desktop peer.
//!
//! Pairing starts with a short-lived QR payload shown on the desktop
//! ([`qr`]), and completes with a confirm exchange over a TLS
//! connection pinned to the fingerprint the QR carried ([`client`]).
//! Success installs a trust record and, when the desktop issues one, a
//! client mutual-TLS bundle for the stream transport.

pub mod client;
pub mod qr;

pub use client::PairingClient;
pub use qr::QrPayload;
