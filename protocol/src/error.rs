//! # Error Taxonomy
//!
//! Dropline sorts failures by who can fix them:
//!
//! - [`ValidationError`]: the caller handed us something malformed (bad
//!   phrase, empty message, oversized payload). Local, immediate, never
//!   worth retrying with the same input.
//! - [`DerivationError`]: key material could not be produced. Fatal for the
//!   session; we never quietly swap in a different key.
//! - [`BuildError`]: one send attempt could not be funded or assembled.
//!   Retryable once the caller fixes funding or input data.
//! - [`IndexerError`] / [`SignerError`]: the outside world misbehaved.
//!   Retryable.
//!
//! Failing to decrypt a payload is deliberately *not* in this list. A payload
//! that does not open under our key is simply not addressed to us, and the
//! crypto layer reports that as `None`.
//!
//! Error messages never include phrase words, key bytes, or plaintext.

use thiserror::Error;

pub use crate::network::indexer::IndexerError;
pub use crate::network::signer::SignerError;
pub use crate::transaction::builder::BuildError;

/// Malformed input. Surfaced to the caller immediately.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("secret phrase must be exactly {expected} words, got {got}")]
    WordCountMismatch { expected: usize, got: usize },

    /// Word position is 1-based. The word itself is withheld on purpose.
    #[error("word #{position} of the secret phrase is not in the BIP39 English wordlist")]
    UnknownWord { position: usize },

    #[error("secret phrase checksum is invalid")]
    ChecksumInvalid,

    #[error("message is empty")]
    EmptyMessage,

    #[error("payload is {size} bytes, annotation field holds at most {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("fee rate must be a finite, non-negative number, got {0}")]
    InvalidFeeRate(f64),
}

/// Key material could not be derived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationError {
    #[error("mailbox count must be between 1 and {max}, got {got}")]
    InvalidCount { got: u32, max: u32 },

    #[error("degenerate master key material")]
    DegenerateMaster,

    #[error("degenerate key material at mailbox index {index}")]
    DegenerateKey { index: u32 },

    #[error("channel key derivation failed: {0}")]
    Kdf(String),
}

/// Everything a [`crate::session::ChannelSession`] operation can fail with.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Another send was committed between prepare and commit.
    #[error("send prepared at sequence {prepared} is stale, outbox is at {current}")]
    StaleSequence { prepared: u64, current: u64 },

    #[error("no sender address configured for this session")]
    MissingSender,
}

impl ChannelError {
    /// Whether the same operation may succeed if simply tried again (possibly
    /// after the caller tops up funds or waits out a flaky indexer).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Derivation(_) | Self::MissingSender => false,
            Self::Build(e) => e.is_retryable(),
            Self::Indexer(e) => e.is_retryable(),
            Self::Signer(e) => e.is_retryable(),
            Self::Timeout { .. } | Self::StaleSequence { .. } => true,
        }
    }
}
