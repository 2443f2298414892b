//! # Network Module
//!
//! The two places Dropline touches the outside world.
//!
//! ## Architecture
//!
//! ```text
//! indexer.rs: LedgerIndexer trait + EsploraClient (reqwest)
//! signer.rs : TransactionSigner trait, supplied by the embedding wallet
//! ```
//!
//! ## Design Decisions
//!
//! - Both seams are `async_trait` objects so sessions, scanners and the node
//!   can hold `Arc<dyn LedgerIndexer>` and tests can swap in in-memory fakes.
//! - Timeouts are applied twice: per HTTP request inside [`EsploraClient`],
//!   and per operation by the session via `tokio::time::timeout`, which
//!   also covers signers we did not write.

pub mod indexer;
pub mod signer;

pub use indexer::{EsploraClient, IndexedTransaction, IndexerError, LedgerIndexer};
pub use signer::{SignerError, TransactionSigner};
