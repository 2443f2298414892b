//! Note transaction construction.
//!
//! [`build_transaction`] turns `(sender, mailbox, payload, utxos, fee_rate)`
//! into an [`UnsignedTransaction`]:
//!
//! ```text
//! inputs:  confirmed sender UTXOs, greedy, in the order supplied
//! outputs: [0] 546 sats → mailbox
//!          [1]   0 sats → OP_RETURN <payload>
//!          [2]  change  → sender        (only if change ≥ 546)
//! ```
//!
//! The builder does not sign and does not broadcast. That happens behind
//! [`crate::network::TransactionSigner`]. This separation keeps construction
//! testable without key material or a network.

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use thiserror::Error;
use tracing::debug;

use super::fee::{estimate_fee, selection_target};
use super::types::{OutputRef, SpendableOutput, UnsignedTransaction};
use crate::config::{DUST_THRESHOLD_SATS, MAX_ANNOTATION_BYTES, NETWORK};
use crate::crypto::Payload;
use crate::derivation::MailboxAddress;
use crate::error::ValidationError;

/// Why a note transaction could not be assembled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("insufficient funds: need {needed} sats, {available} sats available in confirmed outputs")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("selected output {outpoint} has no locking script")]
    MissingScript { outpoint: OutputRef },

    #[error("output {outpoint} has a malformed txid")]
    InvalidOutpoint { outpoint: OutputRef },
}

impl BuildError {
    /// Funding problems clear up once the wallet is topped up or the indexer
    /// returns complete data. Malformed input does not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. } | Self::MissingScript { .. }
        )
    }
}

/// Parses an address and pins it to the Dropline network.
pub fn parse_address(address: &str) -> Result<Address, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    Address::from_str(address.trim())
        .map_err(|e| invalid(e.to_string()))?
        .require_network(NETWORK)
        .map_err(|e| invalid(e.to_string()))
}

fn validate_fee_rate(fee_rate: f64) -> Result<(), ValidationError> {
    if fee_rate.is_finite() && fee_rate >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidFeeRate(fee_rate))
    }
}

/// Builds the unsigned note transaction.
///
/// Selection walks `utxos` in the order given, skips unconfirmed entries and
/// stops as soon as the running total reaches the one-input target (mailbox
/// dust plus the single-input fee). The final fee is then recomputed for the
/// real input count.
///
/// # Errors
///
/// - `Validation(PayloadTooLarge)` if the payload exceeds 80 bytes.
/// - `Validation(InvalidAddress | InvalidFeeRate)` for malformed inputs.
/// - `InsufficientFunds` if confirmed outputs cannot reach the target, or
///   the recomputed fee leaves negative change.
/// - `MissingScript` if a selected output has no locking script.
pub fn build_transaction(
    sender: &str,
    mailbox: &MailboxAddress,
    payload: &Payload,
    utxos: &[SpendableOutput],
    fee_rate: f64,
) -> Result<UnsignedTransaction, BuildError> {
    if payload.len() > MAX_ANNOTATION_BYTES {
        return Err(ValidationError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_ANNOTATION_BYTES,
        }
        .into());
    }
    validate_fee_rate(fee_rate)?;
    let change_script = parse_address(sender)?.script_pubkey();

    // Greedy accumulation toward the one-input target.
    let target = selection_target(fee_rate);
    let mut selected: Vec<SpendableOutput> = Vec::new();
    let mut accumulated: u64 = 0;
    for utxo in utxos.iter().filter(|u| u.confirmed) {
        if utxo.script_pubkey.is_none() {
            return Err(BuildError::MissingScript {
                outpoint: utxo.outpoint(),
            });
        }
        accumulated = accumulated.saturating_add(utxo.value);
        selected.push(utxo.clone());
        if accumulated >= target {
            break;
        }
    }

    if accumulated < target {
        return Err(BuildError::InsufficientFunds {
            needed: target,
            available: accumulated,
        });
    }

    let fee = estimate_fee(fee_rate, selected.len());
    let needed = DUST_THRESHOLD_SATS.saturating_add(fee);
    let change = accumulated
        .checked_sub(needed)
        .ok_or(BuildError::InsufficientFunds {
            needed,
            available: accumulated,
        })?;

    let input = selected
        .iter()
        .map(|utxo| {
            let txid = Txid::from_str(&utxo.txid).map_err(|_| BuildError::InvalidOutpoint {
                outpoint: utxo.outpoint(),
            })?;
            Ok(TxIn {
                previous_output: OutPoint::new(txid, utxo.vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
        })
        .collect::<Result<Vec<_>, BuildError>>()?;

    let annotation = PushBytesBuf::try_from(payload.as_bytes().to_vec()).map_err(|_| {
        ValidationError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_ANNOTATION_BYTES,
        }
    })?;

    let mut output = vec![
        TxOut {
            value: Amount::from_sat(DUST_THRESHOLD_SATS),
            script_pubkey: mailbox.script_pubkey().clone(),
        },
        TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(annotation),
        },
    ];

    let change_out = if change >= DUST_THRESHOLD_SATS {
        output.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: change_script,
        });
        change
    } else {
        0
    };

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    };

    let unsigned = UnsignedTransaction {
        tx,
        inputs: selected,
        mailbox: mailbox.address.clone(),
        payload: payload.clone(),
        fee: accumulated - DUST_THRESHOLD_SATS - change_out,
        change: change_out,
    };

    debug!(
        mailbox = %mailbox.address,
        inputs = unsigned.inputs.len(),
        fee = unsigned.fee,
        change = unsigned.change,
        "built note transaction"
    );
    Ok(unsigned)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
