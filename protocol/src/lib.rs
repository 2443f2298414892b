// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Dropline Protocol: Core Library
//!
//! Two people share a 12-word phrase. From it alone, both devices derive the
//! same list of Bitcoin test network addresses ("mailboxes") and the same
//! AES-256-GCM key. A note is encrypted, stuffed into the OP_RETURN of a tiny
//! transaction that pays dust to the next mailbox, and read back by whoever
//! scans those mailboxes with the same key. No accounts, no server, no
//! handshake, and nothing on-chain that says "Dropline".
//!
//! ## Architecture
//!
//! Leaf to root:
//!
//! - **secret**: Phrase normalization and BIP39 validation.
//! - **derivation**: Mailboxes (BIP84 test network) and the channel key (PBKDF2).
//! - **crypto**: Payload sealing and fail-closed opening.
//! - **transaction**: Fee model, coin selection, OP_RETURN layout, decoding.
//! - **network**: Indexer and signer seams; an Esplora client.
//! - **scanner**: Ledger scanning, dedup, timestamps, local delivery fallback.
//! - **session**: Ties it together: rotation, send, inbox refresh.
//! - **config**: Protocol constants and per-session tunables.
//! - **error**: The error taxonomy.
//!
//! ## Known limitations
//!
//! 1. One key per channel, no forward secrecy. Leak the phrase, leak the history.
//! 2. One indexer is trusted. It can hide notes; it cannot forge them.
//! 3. A note must fit in 80 bytes of annotation, which is about 32 bytes of text.

pub mod config;
pub mod crypto;
pub mod derivation;
pub mod error;
pub mod network;
pub mod scanner;
pub mod secret;
pub mod session;
pub mod transaction;

pub use config::ChannelConfig;
pub use crypto::Payload;
pub use derivation::{EncryptionKey, MailboxAddress};
pub use error::{ChannelError, DerivationError, ValidationError};
pub use scanner::{ChannelScanner, InboxEntry, ScanReport};
pub use secret::Secret;
pub use session::{ChannelSession, DecryptedMessage, Direction, SendArtifact};
