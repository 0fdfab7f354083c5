//! On-device agent for the provinode room-scan data plane.
//!
//! This crate is the scanner side of the mobile-to-desktop link. It
//! records sensor samples into a content-addressed session package and
//! streams them over a mutually-authenticated, encrypted channel to a
//! paired desktop peer.
//!
//! # Subsystems
//!
//! - [`identity`]: the device's persistent signing keypair and the
//!   encrypted client-TLS bundle installed during pairing
//! - [`trust`]: the encrypted set of trusted desktop peers
//! - [`pairing`]: QR payload validation and the pinned confirm exchange
//! - [`transport`]: the framed, AEAD-sealed stream client with the
//!   resume replay buffer
//! - [`recorder`]: the append-only session package writer
//! - [`capture`]: the sample sequencer and the frame-driven pipeline
//! - [`controller`]: lifecycle glue from pairing through finalize
//!
//! Protocol types shared with the desktop peer live in
//! [`provinode_core`].

pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
mod fsutil;
pub mod identity;
pub mod pairing;
pub mod recorder;
pub mod telemetry;
pub mod transport;
pub mod trust;

pub use controller::{ControllerState, ScanController, Status};
pub use error::{QrReason, ScanError, ScanResult};
