//! Signed hello handshake and session key agreement.
//!
//! # Sequence
//!
//! ```text
//! Scanner                                      Desktop
//!   |                                             |
//!   |-- SecureChannelHello (signed, eph pub) ---->|
//!   |                                             |
//!   |<-- SecureChannelAck (eph pub, salt) --------|
//!   |                                             |
//!   |   both: ECDH -> HKDF-SHA256 -> key + prefix |
//! ```
//!
//! The hello carries the scanner's ephemeral public key, its long-lived
//! signing public key, and a raw 64-byte ECDSA P-256 signature over a
//! canonical newline-joined payload. The ack carries the responder's
//! ephemeral public key and the HKDF salt. 40 bytes of output keying
//! material split into the 32-byte AES key and the 8-byte nonce prefix.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::codec::{SecureSessionKeys, SESSION_KEY_LEN, SESSION_NONCE_PREFIX_LEN};
use super::error::ChannelError;
use crate::ident::ScanId;

/// Protocol identifier bound into the handshake and every envelope.
pub const PROTOCOL_ID: &str = "provinode.scan.channel.v1";

/// Fixed HKDF info string for session key derivation.
pub const HKDF_INFO: &str = "provinode.scan.channel.hkdf.v1";

/// Byte length of the HKDF salt the responder mints per session.
pub const ACK_SALT_LEN: usize = 16;

/// Client hello sent on the handshake wire channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecureChannelHello {
    /// Always [`PROTOCOL_ID`].
    pub protocol: String,
    /// Session this channel will carry.
    pub session_id: String,
    /// Scanner device identifier.
    pub scan_device_id: String,
    /// Scanner certificate fingerprint, lowercase hex.
    pub scan_cert_fingerprint_sha256: String,
    /// Fresh 26-character nonce for this handshake.
    pub hello_nonce: String,
    /// Base64 of the scanner's ephemeral public key (X9.63 uncompressed).
    pub client_ephemeral_public_key_b64: String,
    /// RFC-3339 creation timestamp.
    pub created_at_utc: String,
    /// Base64 of the scanner's signing public key (X9.63 uncompressed).
    pub scan_signing_public_key_b64: String,
    /// Base64 of the raw 64-byte ECDSA signature over the canonical
    /// payload.
    pub hello_signature_b64: String,
}

/// Responder acknowledgement completing key agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecureChannelAck {
    /// Always [`PROTOCOL_ID`].
    pub protocol: String,
    /// Must echo the hello's session id.
    pub session_id: String,
    /// Base64 of the responder's ephemeral public key (X9.63
    /// uncompressed).
    pub server_ephemeral_public_key_b64: String,
    /// Base64 HKDF salt for this session.
    pub ack_salt_b64: String,
}

/// Builds the canonical UTF-8 payload the hello signature covers.
///
/// Field order is part of the protocol; both sides must produce the
/// identical byte string.
#[must_use]
pub fn canonical_hello_payload(
    session_id: &str,
    scan_device_id: &str,
    fingerprint_lower: &str,
    hello_nonce: &str,
    client_ephemeral_public_key_b64: &str,
    scan_signing_public_key_b64: &str,
) -> String {
    format!(
        "{PROTOCOL_ID}\n{session_id}\n{scan_device_id}\n{fingerprint_lower}\n{hello_nonce}\n{client_ephemeral_public_key_b64}\n{scan_signing_public_key_b64}"
    )
}

/// Verifies a hello's signature against its embedded signing key.
///
/// Trust in the signing key itself (does it belong to a paired device?)
/// is the caller's job; this only proves the hello was not tampered
/// with in flight.
///
/// # Errors
///
/// Returns [`ChannelError::Crypto`] when key or signature bytes cannot
/// be parsed, and [`ChannelError::SignatureInvalid`] when verification
/// fails.
pub fn verify_hello(hello: &SecureChannelHello) -> Result<(), ChannelError> {
    let signing_pub = BASE64
        .decode(&hello.scan_signing_public_key_b64)
        .map_err(|e| ChannelError::Crypto(format!("signing key base64: {e}")))?;
    let verifying = VerifyingKey::from_sec1_bytes(&signing_pub)
        .map_err(|e| ChannelError::Crypto(format!("signing key parse: {e}")))?;

    let sig_bytes = BASE64
        .decode(&hello.hello_signature_b64)
        .map_err(|e| ChannelError::Crypto(format!("signature base64: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| ChannelError::Crypto(format!("signature parse: {e}")))?;

    let payload = canonical_hello_payload(
        &hello.session_id,
        &hello.scan_device_id,
        &hello.scan_cert_fingerprint_sha256,
        &hello.hello_nonce,
        &hello.client_ephemeral_public_key_b64,
        &hello.scan_signing_public_key_b64,
    );

    verifying
        .verify(payload.as_bytes(), &signature)
        .map_err(|_| ChannelError::SignatureInvalid)
}

/// Derives the session keys from an ECDH shared secret and salt.
///
/// # Errors
///
/// Returns [`ChannelError::Crypto`] if HKDF expansion fails.
pub fn derive_session_keys(ikm: &[u8], salt: &[u8]) -> Result<SecureSessionKeys, ChannelError> {
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; SESSION_KEY_LEN + SESSION_NONCE_PREFIX_LEN];
    hk.expand(HKDF_INFO.as_bytes(), &mut okm)
        .map_err(|e| ChannelError::Crypto(format!("hkdf expand: {e}")))?;

    let mut encryption_key = [0u8; SESSION_KEY_LEN];
    encryption_key.copy_from_slice(&okm[..SESSION_KEY_LEN]);
    let mut nonce_prefix = [0u8; SESSION_NONCE_PREFIX_LEN];
    nonce_prefix.copy_from_slice(&okm[SESSION_KEY_LEN..]);

    Ok(SecureSessionKeys {
        encryption_key,
        nonce_prefix,
    })
}

fn encode_public(key: &PublicKey) -> String {
    BASE64.encode(key.to_encoded_point(false).as_bytes())
}

fn decode_public(b64: &str, field: &str) -> Result<PublicKey, ChannelError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| ChannelError::Crypto(format!("{field} base64: {e}")))?;
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|e| ChannelError::Crypto(format!("{field} parse: {e}")))
}

/// Scanner-side handshake driver.
///
/// Holds the ephemeral secret between [`ClientHandshake::initiate`] and
/// [`ClientHandshake::complete`]; dropping the driver discards it.
pub struct ClientHandshake {
    session_id: String,
    hello: SecureChannelHello,
    ephemeral: EphemeralSecret,
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("session_id", &self.session_id)
            .field("hello_nonce", &self.hello.hello_nonce)
            .finish_non_exhaustive()
    }
}

impl ClientHandshake {
    /// Generates an ephemeral key and a signed hello for `session_id`.
    #[must_use]
    pub fn initiate(
        signing_key: &SigningKey,
        scan_device_id: &str,
        scan_cert_fingerprint_sha256: &str,
        session_id: &str,
    ) -> Self {
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let client_eph_b64 = encode_public(&ephemeral.public_key());
        let signing_pub_b64 =
            BASE64.encode(signing_key.verifying_key().to_encoded_point(false).as_bytes());
        let hello_nonce = ScanId::generate().to_string();
        let fingerprint_lower = scan_cert_fingerprint_sha256.to_ascii_lowercase();

        let payload = canonical_hello_payload(
            session_id,
            scan_device_id,
            &fingerprint_lower,
            &hello_nonce,
            &client_eph_b64,
            &signing_pub_b64,
        );
        let signature: Signature = signing_key.sign(payload.as_bytes());

        let hello = SecureChannelHello {
            protocol: PROTOCOL_ID.to_string(),
            session_id: session_id.to_string(),
            scan_device_id: scan_device_id.to_string(),
            scan_cert_fingerprint_sha256: fingerprint_lower,
            hello_nonce,
            client_ephemeral_public_key_b64: client_eph_b64,
            created_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            scan_signing_public_key_b64: signing_pub_b64,
            hello_signature_b64: BASE64.encode(signature.to_bytes()),
        };

        Self {
            session_id: session_id.to_string(),
            hello,
            ephemeral,
        }
    }

    /// The hello message to send on the handshake channel.
    #[must_use]
    pub const fn hello(&self) -> &SecureChannelHello {
        &self.hello
    }

    /// Consumes the ack and derives the shared session keys.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::HandshakeMismatch`] when the ack's
    /// protocol or session binding differs from the hello, and
    /// [`ChannelError::Crypto`] for unparseable key material.
    pub fn complete(self, ack: &SecureChannelAck) -> Result<SecureSessionKeys, ChannelError> {
        if ack.protocol != PROTOCOL_ID {
            return Err(ChannelError::HandshakeMismatch {
                field: "protocol",
                expected: PROTOCOL_ID.to_string(),
                actual: ack.protocol.clone(),
            });
        }
        if ack.session_id != self.session_id {
            return Err(ChannelError::HandshakeMismatch {
                field: "session_id",
                expected: self.session_id.clone(),
                actual: ack.session_id.clone(),
            });
        }

        let server_pub = decode_public(&ack.server_ephemeral_public_key_b64, "server ephemeral")?;
        let salt = BASE64
            .decode(&ack.ack_salt_b64)
            .map_err(|e| ChannelError::Crypto(format!("ack salt base64: {e}")))?;

        let shared = self.ephemeral.diffie_hellman(&server_pub);
        derive_session_keys(shared.raw_secret_bytes().as_slice(), &salt)
    }
}

/// Responder-side handshake driver.
///
/// The desktop peer owns the production responder; this implementation
/// exists so both derivation directions can be exercised in-process.
#[derive(Debug)]
pub struct ResponderHandshake;

impl ResponderHandshake {
    /// Validates a hello and produces the ack plus the derived keys.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::HandshakeMismatch`] on a foreign
    /// protocol id, [`ChannelError::SignatureInvalid`] when the hello
    /// signature does not verify, and [`ChannelError::Crypto`] for
    /// unparseable key material.
    pub fn respond(
        hello: &SecureChannelHello,
    ) -> Result<(SecureChannelAck, SecureSessionKeys), ChannelError> {
        if hello.protocol != PROTOCOL_ID {
            return Err(ChannelError::HandshakeMismatch {
                field: "protocol",
                expected: PROTOCOL_ID.to_string(),
                actual: hello.protocol.clone(),
            });
        }
        verify_hello(hello)?;

        let client_pub = decode_public(&hello.client_ephemeral_public_key_b64, "client ephemeral")?;
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let mut salt = [0u8; ACK_SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let shared = ephemeral.diffie_hellman(&client_pub);
        let keys = derive_session_keys(shared.raw_secret_bytes().as_slice(), &salt)?;

        let ack = SecureChannelAck {
            protocol: PROTOCOL_ID.to_string(),
            session_id: hello.session_id.clone(),
            server_ephemeral_public_key_b64: encode_public(&ephemeral.public_key()),
            ack_salt_b64: BASE64.encode(salt),
        };
        Ok((ack, keys))
    }
}
