//! # AES-256-GCM Payload Encryption
//!
//! Every note travels as a [`Payload`]: base64 text of
//!
//! ```text
//! nonce (12 bytes) || ciphertext || GCM tag (16 bytes)
//! ```
//!
//! To anyone without the channel key that is uniformly random bytes inside an
//! OP_RETURN. There is no version byte, no magic prefix and no length field,
//! since any of those would make Dropline traffic easy to pick out of the
//! ledger.
//!
//! ## Nonce management
//!
//! One key serves the whole channel, so every encryption draws a fresh random
//! 96-bit nonce from the OS CSPRNG. The birthday bound for 96-bit nonces is
//! around 2^48 messages per key, which no channel paying a transaction fee per
//! note will ever approach.
//!
//! ## Fail-closed decryption
//!
//! [`decrypt`] returns `Option`. The scanner feeds it every OP_RETURN on
//! every mailbox, and most of those were never meant for us. Wrong key, bad
//! base64, truncated bytes, forged tag, invalid UTF-8: all of them are just
//! `None`. Nothing here panics on attacker-controlled input.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{AES_NONCE_LENGTH, AES_TAG_LENGTH, MAX_ANNOTATION_BYTES};
use crate::derivation::EncryptionKey;
use crate::error::ValidationError;

/// Largest plaintext AES-GCM will accept under one nonce (NIST SP 800-38D).
const GCM_MAX_PLAINTEXT: u64 = (1 << 36) - 32;

/// An encrypted note in transport form (base64 text).
///
/// This is the exact byte string that goes into the annotation field, so
/// [`Payload::len`] is what the transaction builder measures against the
/// 80-byte ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(String);

impl Payload {
    /// Wraps annotation text pulled off the ledger. No validation happens
    /// here; [`decrypt`] decides whether it means anything.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Size in bytes as it will sit in the annotation field.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn cipher(key: &EncryptionKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

/// Encrypts a note under the channel key.
///
/// Surrounding whitespace is trimmed first, and a note that is empty after
/// trimming is rejected. The length is not checked against the annotation
/// ceiling here; that is the transaction builder's call. Use
/// [`max_plaintext_len`] to warn a user before they type too much.
///
/// # Example
///
/// ```
/// use dropline_protocol::crypto::encryption::{decrypt, encrypt};
/// use dropline_protocol::derivation::EncryptionKey;
///
/// let key = EncryptionKey::from_bytes([0x42u8; 32]);
/// let payload = encrypt(&key, "  hello  ").unwrap();
/// assert_eq!(decrypt(&key, &payload).as_deref(), Some("hello"));
/// ```
pub fn encrypt(key: &EncryptionKey, plaintext: &str) -> Result<Payload, ValidationError> {
    let message = plaintext.trim();
    if message.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }

    let cipher = cipher(key);

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // The only failure mode of the AEAD is exceeding the GCM length limit.
    let ciphertext =
        cipher
            .encrypt(nonce, message.as_bytes())
            .map_err(|_| ValidationError::PayloadTooLarge {
                size: message.len(),
                max: GCM_MAX_PLAINTEXT as usize,
            })?;

    let mut sealed = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(Payload(STANDARD.encode(sealed)))
}

/// Tries to open a payload with the channel key. `None` for anything that is
/// not a well-formed note sealed under this exact key.
pub fn decrypt(key: &EncryptionKey, payload: &Payload) -> Option<String> {
    let sealed = STANDARD.decode(payload.as_bytes()).ok()?;
    if sealed.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return None;
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);
    let cipher = cipher(key);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .ok()?;

    String::from_utf8(plaintext).ok()
}

/// Longest plaintext (in UTF-8 bytes) whose payload still fits the
/// annotation field: 32 bytes for the 80-byte ceiling.
pub const fn max_plaintext_len() -> usize {
    // base64 packs 3 raw bytes into 4 characters.
    let raw_capacity = MAX_ANNOTATION_BYTES / 4 * 3;
    raw_capacity - AES_NONCE_LENGTH - AES_TAG_LENGTH
}

/// Size of the payload a plaintext of `plaintext_len` bytes would produce.
pub const fn payload_len(plaintext_len: usize) -> usize {
    let raw = AES_NONCE_LENGTH + plaintext_len + AES_TAG_LENGTH;
    raw.div_ceil(3) * 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AES_KEY_LENGTH;

    fn test_key() -> EncryptionKey {
        let mut key = [0u8; AES_KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        EncryptionKey::from_bytes(key)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let payload = encrypt(&key, "hello").unwrap();
        assert_eq!(decrypt(&key, &payload).as_deref(), Some("hello"));
    }

    #[test]
    fn test_encrypt_trims_whitespace() {
        let key = test_key();
        let payload = encrypt(&key, "\n  meet at noon \t").unwrap();
        assert_eq!(decrypt(&key, &payload).as_deref(), Some("meet at noon"));
    }

    #[test]
    fn test_empty_message_rejected() {
        let key = test_key();
        assert_eq!(encrypt(&key, "").unwrap_err(), ValidationError::EmptyMessage);
        assert_eq!(
            encrypt(&key, "   \n ").unwrap_err(),
            ValidationError::EmptyMessage
        );
    }

    #[test]
    fn test_wrong_key_yields_none() {
        let key = test_key();
        let payload = encrypt(&key, "secret").unwrap();
        let wrong = EncryptionKey::from_bytes([0xFF; AES_KEY_LENGTH]);
        assert_eq!(decrypt(&wrong, &payload), None);
    }

    #[test]
    fn test_tampered_payload_yields_none() {
        let key = test_key();
        let payload = encrypt(&key, "secret").unwrap();
        let mut raw = STANDARD.decode(payload.as_bytes()).unwrap();
        raw[AES_NONCE_LENGTH] ^= 0x01;
        let tampered = Payload::from_text(STANDARD.encode(raw));
        assert_eq!(decrypt(&key, &tampered), None);
    }

    #[test]
    fn test_garbage_yields_none() {
        let key = test_key();
        for text in ["", "not base64 !!!", "aGVsbG8=", "AAAA", "\u{1F600}"] {
            assert_eq!(decrypt(&key, &Payload::from_text(text)), None, "{text:?}");
        }
        // Exactly nonce + tag of zeros: right length, wrong tag.
        let zeros = STANDARD.encode([0u8; AES_NONCE_LENGTH + AES_TAG_LENGTH]);
        assert_eq!(decrypt(&key, &Payload::from_text(zeros)), None);
    }

    #[test]
    fn test_non_utf8_plaintext_yields_none() {
        let key = test_key();
        let cipher = cipher(&key);
        let nonce = [7u8; AES_NONCE_LENGTH];
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), &[0xFFu8, 0xFE, 0xFD][..])
            .unwrap();
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ct);
        assert_eq!(decrypt(&key, &Payload::from_text(STANDARD.encode(sealed))), None);
    }

    #[test]
    fn test_unique_nonces() {
        let key = test_key();
        let a = encrypt(&key, "message").unwrap();
        let b = encrypt(&key, "message").unwrap();
        assert_ne!(a, b);
        let raw_a = STANDARD.decode(a.as_bytes()).unwrap();
        let raw_b = STANDARD.decode(b.as_bytes()).unwrap();
        assert_ne!(&raw_a[..AES_NONCE_LENGTH], &raw_b[..AES_NONCE_LENGTH]);
    }

    #[test]
    fn test_payload_length_model() {
        let key = test_key();
        for text in ["a", "hello", "exactly 26 bytes of input!"] {
            let payload = encrypt(&key, text).unwrap();
            assert_eq!(payload.len(), payload_len(text.len()));
        }
    }

    #[test]
    fn test_max_plaintext_fits_annotation() {
        assert_eq!(max_plaintext_len(), 32);
        let key = test_key();

        let fits = "x".repeat(max_plaintext_len());
        assert!(encrypt(&key, &fits).unwrap().len() <= MAX_ANNOTATION_BYTES);

        let overflows = "x".repeat(max_plaintext_len() + 1);
        assert!(encrypt(&key, &overflows).unwrap().len() > MAX_ANNOTATION_BYTES);
    }

    #[test]
    fn test_unicode_roundtrip() {
        let key = test_key();
        let payload = encrypt(&key, "olá, café ☕").unwrap();
        assert_eq!(decrypt(&key, &payload).as_deref(), Some("olá, café ☕"));
    }
}
