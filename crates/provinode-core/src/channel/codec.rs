//! Counter-addressed AEAD envelopes.
//!
//! Once the handshake has produced [`SecureSessionKeys`], every message
//! in either direction is sealed into a [`SealedEnvelope`]: AES-256-GCM
//! under a nonce built from the session's 8-byte prefix and a 4-byte
//! big-endian counter. Senders burn one counter value per envelope;
//! receivers accept only counters strictly above the last accepted one
//! and silently drop the rest, which makes replayed frames inert.
//!
//! A direction can carry at most 2^32 envelopes; the codec refuses to
//! seal past that point rather than reuse a nonce.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ChannelError;
use super::handshake::PROTOCOL_ID;

/// AES-256 key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Nonce prefix length in bytes; the remaining 4 nonce bytes are the
/// big-endian counter.
pub const SESSION_NONCE_PREFIX_LEN: usize = 8;

/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Inner routing channel carried by a sealed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PayloadChannel {
    /// Control messages (checkpoints, hints).
    Control,
    /// Length-prefixed sample frames.
    Sample,
}

impl From<PayloadChannel> for u8 {
    fn from(channel: PayloadChannel) -> Self {
        match channel {
            PayloadChannel::Control => 0x01,
            PayloadChannel::Sample => 0x02,
        }
    }
}

impl TryFrom<u8> for PayloadChannel {
    type Error = String;

    fn try_from(byte: u8) -> Result<Self, String> {
        match byte {
            0x01 => Ok(Self::Control),
            0x02 => Ok(Self::Sample),
            other => Err(format!("unknown payload channel: {other:#04x}")),
        }
    }
}

/// Symmetric material derived by the handshake.
///
/// Discarded (dropped) on disconnect; never persisted.
#[derive(Clone)]
pub struct SecureSessionKeys {
    /// AES-256-GCM key shared by both directions.
    pub encryption_key: [u8; SESSION_KEY_LEN],
    /// Per-session nonce prefix.
    pub nonce_prefix: [u8; SESSION_NONCE_PREFIX_LEN],
}

impl std::fmt::Debug for SecureSessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("SecureSessionKeys").finish_non_exhaustive()
    }
}

/// The JSON envelope carried on the sealed wire channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SealedEnvelope {
    /// Always [`PROTOCOL_ID`].
    pub protocol: String,
    /// Inner routing channel.
    pub payload_channel: PayloadChannel,
    /// Sender's counter for this direction.
    pub counter: u32,
    /// Base64 of the full 12-byte nonce.
    pub nonce_b64: String,
    /// Base64 ciphertext (tag excluded).
    pub ciphertext_b64: String,
    /// Base64 of the 16-byte GCM tag.
    pub tag_b64: String,
}

/// Per-connection secure session state.
///
/// One instance per direction-pair lives inside the transport; all
/// access is serialized by the transport's lock.
pub struct SecureSession {
    keys: SecureSessionKeys,
    /// Next outbound counter. Held as u64 so the value one past
    /// `u32::MAX` is representable and refusable.
    outbound: u64,
    /// Highest accepted inbound counter; −1 means none accepted yet.
    inbound_counter: i64,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("outbound", &self.outbound)
            .field("inbound_counter", &self.inbound_counter)
            .finish_non_exhaustive()
    }
}

impl SecureSession {
    /// Creates a fresh session; counters start at 0 / −1.
    #[must_use]
    pub const fn new(keys: SecureSessionKeys) -> Self {
        Self {
            keys,
            outbound: 0,
            inbound_counter: -1,
        }
    }

    /// Highest inbound counter accepted so far (−1 before the first).
    #[must_use]
    pub const fn inbound_counter(&self) -> i64 {
        self.inbound_counter
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.keys.encryption_key))
    }

    fn nonce_for(&self, counter: u32) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..SESSION_NONCE_PREFIX_LEN].copy_from_slice(&self.keys.nonce_prefix);
        nonce[SESSION_NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Seals `plaintext` into the next outbound envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::CounterExhausted`] once the direction has
    /// emitted 2^32 envelopes, and [`ChannelError::Crypto`] if
    /// encryption itself fails.
    pub fn seal(
        &mut self,
        payload_channel: PayloadChannel,
        plaintext: &[u8],
    ) -> Result<SealedEnvelope, ChannelError> {
        if self.outbound > u64::from(u32::MAX) {
            return Err(ChannelError::CounterExhausted);
        }
        let counter = self.outbound as u32;
        let nonce = self.nonce_for(counter);

        let sealed = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| ChannelError::Crypto("AES-GCM encryption failed".to_string()))?;

        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        self.outbound += 1;

        Ok(SealedEnvelope {
            protocol: PROTOCOL_ID.to_string(),
            payload_channel,
            counter,
            nonce_b64: BASE64.encode(nonce),
            ciphertext_b64: BASE64.encode(ciphertext),
            tag_b64: BASE64.encode(tag),
        })
    }

    /// Opens an inbound envelope.
    ///
    /// Returns `Ok(None)` for replayed or out-of-order envelopes
    /// (counter at or below the last accepted one); these are dropped
    /// without affecting session state.
    ///
    /// # Errors
    ///
    /// [`ChannelError::MalformedEnvelope`] for shape problems and
    /// [`ChannelError::AeadFailure`] when authentication fails; the
    /// latter is fatal to the session.
    pub fn open(
        &mut self,
        envelope: &SealedEnvelope,
    ) -> Result<Option<(PayloadChannel, Vec<u8>)>, ChannelError> {
        if envelope.protocol != PROTOCOL_ID {
            return Err(ChannelError::MalformedEnvelope(format!(
                "foreign protocol: {}",
                envelope.protocol
            )));
        }

        let counter = i64::from(envelope.counter);
        if counter <= self.inbound_counter {
            debug!(
                counter = envelope.counter,
                inbound = self.inbound_counter,
                "dropping replayed envelope"
            );
            return Ok(None);
        }

        let expected_nonce = self.nonce_for(envelope.counter);
        let nonce = BASE64
            .decode(&envelope.nonce_b64)
            .map_err(|e| ChannelError::MalformedEnvelope(format!("nonce base64: {e}")))?;
        if nonce != expected_nonce {
            return Err(ChannelError::MalformedEnvelope(
                "nonce does not match counter".to_string(),
            ));
        }

        let mut sealed = BASE64
            .decode(&envelope.ciphertext_b64)
            .map_err(|e| ChannelError::MalformedEnvelope(format!("ciphertext base64: {e}")))?;
        let tag = BASE64
            .decode(&envelope.tag_b64)
            .map_err(|e| ChannelError::MalformedEnvelope(format!("tag base64: {e}")))?;
        if tag.len() != TAG_LEN {
            return Err(ChannelError::MalformedEnvelope(format!(
                "tag length {} != {TAG_LEN}",
                tag.len()
            )));
        }
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher()
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &[],
                },
            )
            .map_err(|_| ChannelError::AeadFailure)?;

        self.inbound_counter = counter;
        Ok(Some((envelope.payload_channel, plaintext)))
    }

    #[cfg(test)]
    pub(crate) fn force_outbound(&mut self, value: u64) {
        self.outbound = value;
    }
}
