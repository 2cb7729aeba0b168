//! Message body encryption.
//!
//! AES-256-GCM with a random 96-bit IV per message. Wire format:
//!   base64(iv) ":" base64(ciphertext ‖ tag)
//! using the standard base64 alphabet with padding.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{DECRYPT_PLACEHOLDER, ENVELOPE_DELIMITER, IV_SIZE};
use crate::error::CryptoError;
use crate::kdf::SharedKey;

/// Stored form of one encrypted message body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(String);

impl Envelope {
    /// Wrap a string read from storage. Validity is only checked on decrypt.
    pub fn from_wire(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

pub fn encrypt(key: &SharedKey, plaintext: &str) -> Result<Envelope, CryptoError> {
    encrypt_with_iv(key, &generate_iv(), plaintext)
}

fn encrypt_with_iv(
    key: &SharedKey,
    iv: &[u8; IV_SIZE],
    plaintext: &str,
) -> Result<Envelope, CryptoError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(iv), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Envelope(format!(
        "{}{}{}",
        STANDARD.encode(iv),
        ENVELOPE_DELIMITER,
        STANDARD.encode(ciphertext)
    )))
}

pub fn decrypt(key: &SharedKey, envelope: &Envelope) -> Result<String, CryptoError> {
    let (iv_b64, ct_b64) = envelope
        .as_str()
        .split_once(ENVELOPE_DELIMITER)
        .ok_or(CryptoError::MalformedEnvelope)?;

    let iv = STANDARD.decode(iv_b64)?;
    if iv.len() != IV_SIZE {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }
    let ciphertext = STANDARD.decode(ct_b64)?;

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
}

/// Decrypt for display. Any failure yields [`DECRYPT_PLACEHOLDER`] and
/// `false`.
pub fn decrypt_or_placeholder(key: &SharedKey, envelope: &Envelope) -> (String, bool) {
    match decrypt(key, envelope) {
        Ok(plaintext) => (plaintext, true),
        Err(e) => {
            tracing::debug!(error = %e, "envelope did not decrypt");
            (DECRYPT_PLACEHOLDER.to_string(), false)
        }
    }
}
