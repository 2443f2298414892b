//! # Signer Seam
//!
//! Dropline never holds spending keys. Signing and broadcasting go through
//! a [`TransactionSigner`] the embedding application supplies: a wallet
//! extension bridge, a hardware wallet, or a PSBT round-trip through the
//! CLI. The session picks exactly the signer it is given. There is no
//! discovery and no fallback to some other wallet.

use async_trait::async_trait;
use thiserror::Error;

use crate::transaction::{SignedTransaction, UnsignedTransaction};

/// Failures reported by a signer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    /// The user or wallet declined to sign.
    #[error("signing rejected: {0}")]
    Rejected(String),

    /// The wallet could not be reached.
    #[error("signer unavailable: {0}")]
    Unavailable(String),

    /// The network refused the signed transaction.
    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),
}

impl SignerError {
    pub fn is_retryable(&self) -> bool {
        // A rejection is a deliberate answer; asking again is the caller's call,
        // not an automatic retry.
        !matches!(self, Self::Rejected(_))
    }
}

/// Signs and broadcasts note transactions on the sender's behalf.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Adds witnesses to every input of `unsigned`.
    async fn sign_transaction(
        &self,
        unsigned: &UnsignedTransaction,
    ) -> Result<SignedTransaction, SignerError>;

    /// Pushes `signed` to the network and returns its txid.
    async fn broadcast_transaction(&self, signed: &SignedTransaction)
        -> Result<String, SignerError>;
}
