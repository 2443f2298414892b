//! # Secret Phrase Normalization
//!
//! The shared phrase is the only thing two parties exchange out of band, and
//! it gets typed on phones, pasted from notes apps, and read aloud over the
//! phone. So before anything is derived from it, it is canonicalized:
//!
//! 1. Trim and collapse runs of whitespace (spaces, tabs, newlines).
//! 2. Lowercase.
//! 3. Require exactly [`SECRET_WORD_COUNT`] words.
//! 4. Require every word to be in the BIP39 English list and the BIP39
//!    checksum to pass.
//!
//! The canonical form is what every later derivation hashes, which is why
//! `"  Abandon  ABANDON ..."` and `"abandon abandon ..."` produce the same
//! mailboxes and key on every device.

use std::fmt;

use bip39::{Language, Mnemonic};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::SECRET_WORD_COUNT;
use crate::error::ValidationError;

/// A validated, normalized channel secret.
///
/// Lives in memory for the session only: no `Serialize`, no `Display`, and a
/// redacting `Debug`. The phrase is wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    phrase: String,
}

impl Secret {
    /// The normalized phrase: lowercase words joined by single spaces.
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// The normalized phrase as bytes, the input to the channel-key KDF.
    pub fn as_bytes(&self) -> &[u8] {
        self.phrase.as_bytes()
    }

    /// Number of words. Always [`SECRET_WORD_COUNT`] for a constructed value.
    pub fn word_count(&self) -> usize {
        self.phrase.split(' ').count()
    }

    /// Re-parses the phrase as a BIP39 mnemonic for seed expansion.
    pub(crate) fn mnemonic(&self) -> Result<Mnemonic, bip39::Error> {
        Mnemonic::parse_in_normalized(Language::English, &self.phrase)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {} words])", self.word_count())
    }
}

/// Canonicalizes and validates a raw secret phrase.
///
/// # Errors
///
/// - [`ValidationError::WordCountMismatch`] unless exactly 12 words remain
///   after whitespace normalization.
/// - [`ValidationError::UnknownWord`] if a word is outside the BIP39 list.
/// - [`ValidationError::ChecksumInvalid`] if the BIP39 checksum fails.
pub fn normalize(raw: &str) -> Result<Secret, ValidationError> {
    let mut phrase = raw
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");

    let got = phrase.split_whitespace().count();
    if got != SECRET_WORD_COUNT {
        phrase.zeroize();
        return Err(ValidationError::WordCountMismatch {
            expected: SECRET_WORD_COUNT,
            got,
        });
    }

    if let Err(e) = Mnemonic::parse_in_normalized(Language::English, &phrase) {
        phrase.zeroize();
        return Err(match e {
            bip39::Error::UnknownWord(index) => ValidationError::UnknownWord {
                position: index + 1,
            },
            _ => ValidationError::ChecksumInvalid,
        });
    }

    Ok(Secret { phrase })
}
