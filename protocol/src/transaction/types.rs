//! Value types shared by the builder, the signer seam and the indexer.
//!
//! Amounts are `u64` satoshis everywhere. The only floating point near money
//! is the fee *rate*, and it is floored to whole satoshis before it touches
//! an amount.

use std::fmt;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{ScriptBuf, Transaction};
use serde::{Deserialize, Serialize};

use crate::crypto::Payload;

// ---------------------------------------------------------------------------
// OutputRef
// ---------------------------------------------------------------------------

/// `txid:vout`, the identity of a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub txid: String,
    pub vout: u32,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

// ---------------------------------------------------------------------------
// SpendableOutput
// ---------------------------------------------------------------------------

/// An unspent output the sender controls, as reported by an indexer.
///
/// `script_pubkey` is `None` when the indexer could not tell us the locking
/// script. Such an output may sit in the list, but the builder refuses to
/// select it, because a signer cannot produce a witness without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableOutput {
    pub txid: String,
    pub vout: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Whether the funding transaction is in a block. Only confirmed outputs
    /// are ever spent.
    pub confirmed: bool,
    #[serde(default)]
    pub script_pubkey: Option<ScriptBuf>,
}

impl SpendableOutput {
    pub fn outpoint(&self) -> OutputRef {
        OutputRef {
            txid: self.txid.clone(),
            vout: self.vout,
        }
    }
}

// ---------------------------------------------------------------------------
// UnsignedTransaction
// ---------------------------------------------------------------------------

/// A fully funded, unsigned note transaction, ready for a signer.
///
/// Output order is fixed: `[0]` dust to the mailbox, `[1]` the zero-value
/// OP_RETURN annotation, `[2]` change back to the sender (only present when
/// the change clears the dust threshold).
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    /// Selected outputs, in input order. Signers need their values and
    /// scripts to compute segwit sighashes.
    pub inputs: Vec<SpendableOutput>,
    /// Destination mailbox address.
    pub mailbox: String,
    /// The annotation carried in output `[1]`.
    pub payload: Payload,
    /// Fee actually paid: inputs minus outputs. Includes any sub-dust change
    /// that was folded into the fee.
    pub fee: u64,
    /// Value of the change output, or 0 if there is none.
    pub change: u64,
}

impl UnsignedTransaction {
    /// Txid of the unsigned transaction. For segwit spends this is also the
    /// txid after signing, since witnesses are excluded from the txid.
    pub fn txid(&self) -> String {
        self.tx.compute_txid().to_string()
    }

    /// Consensus-encoded hex, the form handed to external signers.
    pub fn to_hex(&self) -> String {
        serialize_hex(&self.tx)
    }

    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn has_change(&self) -> bool {
        self.change > 0
    }
}

// ---------------------------------------------------------------------------
// SignedTransaction
// ---------------------------------------------------------------------------

/// A signed transaction as produced by a [`crate::network::TransactionSigner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Consensus-encoded hex, ready to broadcast.
    pub hex: String,
}
