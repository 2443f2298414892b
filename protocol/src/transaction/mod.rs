//! # Transaction Module
//!
//! Building note transactions and reading them back off the ledger.
//!
//! ## Architecture
//!
//! ```text
//! types.rs     : SpendableOutput, UnsignedTransaction, SignedTransaction
//! fee.rs       : Fixed vbyte fee model with a 200-sat floor
//! builder.rs   : Greedy coin selection and output layout
//! annotation.rs: Consensus decoding and OP_RETURN extraction for scans
//! ```
//!
//! ## Transaction Lifecycle
//!
//! 1. **Build**: [`build_transaction`] funds and lays out the outputs.
//! 2. **Sign**: an external [`crate::network::TransactionSigner`] adds witnesses.
//! 3. **Broadcast**: the same signer pushes it to the network.
//! 4. **Scan**: the receiving side finds it through an indexer and pulls the
//!    payload out with [`annotation::annotation_text`].
//!
//! ## Design Decisions
//!
//! - All amounts are `u64` satoshis.
//! - Transactions are version 2 with RBF-signalling inputs, so a stuck note
//!   can be fee-bumped by the wallet.
//! - The mailbox always gets exactly the dust threshold: enough to be a
//!   standard output, and the same for every note.

pub mod annotation;
pub mod builder;
pub mod fee;
pub mod types;

pub use builder::{build_transaction, parse_address, BuildError};
pub use fee::estimate_fee;
pub use types::{OutputRef, SignedTransaction, SpendableOutput, UnsignedTransaction};
