//! # Key Derivation
//!
//! Turns a [`Secret`] into everything the channel needs, with no randomness
//! and no external state:
//!
//! ```text
//! phrase ──BIP39──▶ seed ──BIP32 m/84'/1'/0'/0/i──▶ pubkey_i ──P2WPKH──▶ mailbox_i
//!   │
//!   └──PBKDF2-HMAC-SHA256(salt, 100k)──▶ channel key (256 bits)
//! ```
//!
//! Both parties run exactly this and end up with the same mailbox list and
//! the same key. The mailbox keys are ordinary wallet keys, so either party
//! could also sweep the dust that lands on them with any BIP84 wallet.
//!
//! ## One key per channel
//!
//! The channel key depends on the phrase alone, not on the mailbox index or
//! the message. Anyone who learns the phrase can read the entire history.
//! That is the price of needing nothing but the phrase to rejoin a channel.

use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, CompressedPublicKey, ScriptBuf};
use hmac::Hmac;
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::{
    AES_KEY_LENGTH, CHANNEL_KEY_ITERATIONS, CHANNEL_KEY_SALT, MAILBOX_DERIVATION_PATH,
    MAX_MAILBOXES, NETWORK, SEED_PASSPHRASE,
};
use crate::error::DerivationError;
use crate::secret::Secret;

// ---------------------------------------------------------------------------
// MailboxAddress
// ---------------------------------------------------------------------------

/// One derived receiving address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MailboxAddress {
    /// 0-based position in the derived list.
    pub index: u32,
    /// Bech32 test network address (`tb1q...`).
    pub address: String,
    #[serde(skip)]
    script_pubkey: ScriptBuf,
}

impl MailboxAddress {
    /// The locking script that pays this mailbox. Scanning matches outputs
    /// against this, not against address strings.
    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.script_pubkey
    }
}

impl fmt::Display for MailboxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.index, self.address)
    }
}

// ---------------------------------------------------------------------------
// EncryptionKey
// ---------------------------------------------------------------------------

/// The 256-bit channel key. Wiped on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; AES_KEY_LENGTH]);

impl EncryptionKey {
    /// Wraps raw key bytes. Only tests and benches should need this; real
    /// keys come from [`derive_encryption_key`].
    pub fn from_bytes(bytes: [u8; AES_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derives the first `count` mailbox addresses for `secret`.
///
/// Index `i` always maps to `m/84'/1'/0'/0/i`, so asking for 4 and then for
/// 8 yields the same first four addresses.
///
/// # Errors
///
/// - [`DerivationError::InvalidCount`] if `count` is 0 or above
///   [`MAX_MAILBOXES`].
/// - [`DerivationError::DegenerateMaster`] / [`DerivationError::DegenerateKey`]
///   if BIP32 rejects a step (invalid scalar). Astronomically unlikely, but
///   the session must stop rather than continue with different keys.
pub fn derive_addresses(
    secret: &Secret,
    count: u32,
) -> Result<Vec<MailboxAddress>, DerivationError> {
    if count == 0 || count > MAX_MAILBOXES {
        return Err(DerivationError::InvalidCount {
            got: count,
            max: MAX_MAILBOXES,
        });
    }

    let mnemonic = secret
        .mnemonic()
        .map_err(|e| DerivationError::Kdf(format!("mnemonic re-parse failed: {e}")))?;
    let seed = Zeroizing::new(mnemonic.to_seed_normalized(SEED_PASSPHRASE));

    let secp = Secp256k1::new();
    let master =
        Xpriv::new_master(NETWORK, &seed[..]).map_err(|_| DerivationError::DegenerateMaster)?;

    let chain_path: DerivationPath = MAILBOX_DERIVATION_PATH
        .parse()
        .map_err(|e| DerivationError::Kdf(format!("bad derivation path: {e}")))?;
    let chain = master
        .derive_priv(&secp, &chain_path)
        .map_err(|_| DerivationError::DegenerateMaster)?;

    let mut mailboxes = Vec::with_capacity(count as usize);
    for index in 0..count {
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|_| DerivationError::DegenerateKey { index })?;
        let child_key = chain
            .derive_priv(&secp, &[child])
            .map_err(|_| DerivationError::DegenerateKey { index })?;

        let xpub = Xpub::from_priv(&secp, &child_key);
        let address = Address::p2wpkh(&CompressedPublicKey(xpub.public_key), NETWORK);

        mailboxes.push(MailboxAddress {
            index,
            script_pubkey: address.script_pubkey(),
            address: address.to_string(),
        });
    }

    debug!(count, "derived mailbox addresses");
    Ok(mailboxes)
}

/// Derives the channel key: PBKDF2-HMAC-SHA256 over the normalized phrase
/// with the protocol salt and iteration count.
///
/// Deliberately slow (100k iterations). Call once per session.
pub fn derive_encryption_key(secret: &Secret) -> Result<EncryptionKey, DerivationError> {
    let mut key = [0u8; AES_KEY_LENGTH];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        secret.as_bytes(),
        CHANNEL_KEY_SALT,
        CHANNEL_KEY_ITERATIONS,
        &mut key,
    )
    .map_err(|e| DerivationError::Kdf(format!("PBKDF2-HMAC-SHA256 failed: {e}")))?;

    let derived = EncryptionKey(key);
    key.zeroize();
    Ok(derived)
}

/// Everything derived from one secret, computed together at session start.
#[derive(Debug, Clone)]
pub struct ChannelKeys {
    pub mailboxes: Vec<MailboxAddress>,
    pub key: EncryptionKey,
}

/// Convenience: [`derive_addresses`] + [`derive_encryption_key`].
pub fn derive_channel(secret: &Secret, count: u32) -> Result<ChannelKeys, DerivationError> {
    Ok(ChannelKeys {
        mailboxes: derive_addresses(secret, count)?,
        key: derive_encryption_key(secret)?,
    })
}
