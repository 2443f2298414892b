//! # Protocol Configuration & Constants
//!
//! Every magic number in Dropline lives here. Two devices that disagree on a
//! single value in this file will derive different mailboxes or different
//! keys and will never see each other's notes. There is no negotiation and no
//! version handshake, so treat every constant below as frozen wire format.
//!
//! Per-session tunables (how many mailboxes, what fee rate, which indexer)
//! live in [`ChannelConfig`] instead.

use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Version of the channel format. Bumping
/// it means old and new devices can no longer read each other.
pub const PROTOCOL_VERSION: u32 = 1;

/// The ledger Dropline runs on. Test network only: notes are cheap, coins
/// are worthless, and nobody loses money when a fee estimate is off.
pub const NETWORK: Network = Network::Testnet;

/// Human-readable name of [`NETWORK`], mainly for logging and `/status`.
pub const NETWORK_NAME: &str = "testnet";

/// Default Esplora-compatible indexer base URL.
pub const DEFAULT_INDEXER_URL: &str = "https://blockstream.info/testnet/api";

// ---------------------------------------------------------------------------
// Secret Phrase
// ---------------------------------------------------------------------------

/// Number of words in a channel secret. Twelve BIP39 words = 128 bits of
/// entropy plus a 4-bit checksum.
pub const SECRET_WORD_COUNT: usize = 12;

// ---------------------------------------------------------------------------
// Key Derivation
// ---------------------------------------------------------------------------

/// BIP32 path prefix for mailbox keys. The mailbox index is appended as a
/// final non-hardened step: `m/84'/1'/0'/0/{i}` (BIP84, test network coin
/// type, first account, external chain).
pub const MAILBOX_DERIVATION_PATH: &str = "m/84'/1'/0'/0";

/// BIP39 passphrase used when expanding the phrase into a seed. Empty on
/// purpose: the phrase is the whole secret.
pub const SEED_PASSPHRASE: &str = "";

/// Upper bound on the number of mailboxes a session may derive. Each one is
/// an indexer query per scan, so this also bounds scan fan-out.
pub const MAX_MAILBOXES: u32 = 256;

/// Default mailbox count for a new session.
pub const DEFAULT_MAILBOX_COUNT: u32 = 8;

/// Fixed, protocol-wide salt for the channel key KDF. Not secret.
pub const CHANNEL_KEY_SALT: &[u8] = b"dropline/channel-key/v1";

/// PBKDF2-HMAC-SHA256 iteration count for the channel key.
pub const CHANNEL_KEY_ITERATIONS: u32 = 100_000;

// ---------------------------------------------------------------------------
// Symmetric Encryption
// ---------------------------------------------------------------------------

/// AES-256-GCM for payloads. 256-bit keys, 96-bit nonces, 128-bit tags.
pub const SYMMETRIC_ALGORITHM: &str = "AES-256-GCM";

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve. Not 16. Not 8.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Transaction Shape
// ---------------------------------------------------------------------------

/// Maximum OP_RETURN payload size in bytes (standard relay policy).
pub const MAX_ANNOTATION_BYTES: usize = 80;

/// Value of the mailbox output and the smallest change output we create.
/// 546 sats clears the dust limit for every standard output type, so the
/// change output is relayable whatever the sender's address type is.
pub const DUST_THRESHOLD_SATS: u64 = 546;

/// Virtual size of everything except inputs, sized for the worst case:
/// ~11 vB of framing, a 31 vB P2WPKH mailbox output, a 92 vB OP_RETURN
/// output carrying a full 80-byte annotation, and a 31 vB change output.
pub const BASE_TX_VBYTES: u64 = 165;

/// Virtual size of one P2WPKH input (outpoint, sequence, discounted witness).
pub const INPUT_VBYTES: u64 = 68;

/// Fee floor in sats, applied after the fee-rate calculation.
pub const MIN_FEE_SATS: u64 = 200;

/// Default fee rate in sat/vB.
pub const DEFAULT_FEE_RATE: f64 = 2.0;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Per-request timeout for indexer and signer calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between background inbox scans in the node daemon.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Session Configuration
// ---------------------------------------------------------------------------

/// Tunables for one channel session.
///
/// Everything here is local policy. Two parties may use different values
/// and still talk, with one exception: both must derive at least as many
/// mailboxes as the other side rotates through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// How many mailbox addresses to derive and rotate through.
    pub mailbox_count: u32,
    /// Fee rate in sat/vB used when building transactions.
    pub fee_rate: f64,
    /// Esplora-compatible indexer base URL.
    pub indexer_url: String,
    /// Timeout applied to each indexer/signer call, in milliseconds.
    pub request_timeout_ms: u64,
    /// Our own funding address. Used as the change destination and to tell
    /// our outbound notes apart from inbound ones during scans.
    pub sender_address: Option<String>,
}

impl ChannelConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mailbox_count: DEFAULT_MAILBOX_COUNT,
            fee_rate: DEFAULT_FEE_RATE,
            indexer_url: DEFAULT_INDEXER_URL.to_string(),
            request_timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
            sender_address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_parameter_sizes() {
        assert_eq!(AES_KEY_LENGTH, 32);
        assert_eq!(AES_NONCE_LENGTH, 12);
        assert_eq!(AES_TAG_LENGTH, 16);
    }

    #[test]
    fn test_annotation_fits_some_plaintext() {
        // base64 overhead plus nonce and tag must still leave room for text.
        let raw_capacity = MAX_ANNOTATION_BYTES / 4 * 3;
        assert!(raw_capacity > AES_NONCE_LENGTH + AES_TAG_LENGTH);
    }

    #[test]
    fn test_fee_constants_sanity() {
        assert!(MIN_FEE_SATS > 0);
        assert!(INPUT_VBYTES > 0);
        assert!(BASE_TX_VBYTES > MAX_ANNOTATION_BYTES as u64);
        assert!(DEFAULT_FEE_RATE > 0.0);
    }

    #[test]
    fn test_default_config_matches_constants() {
        let config = ChannelConfig::default();
        assert_eq!(config.mailbox_count, DEFAULT_MAILBOX_COUNT);
        assert_eq!(config.request_timeout(), REQUEST_TIMEOUT);
        assert!(config.sender_address.is_none());
        assert!(config.mailbox_count <= MAX_MAILBOXES);
    }

    #[test]
    fn test_derivation_path_is_testnet_bip84() {
        assert!(MAILBOX_DERIVATION_PATH.starts_with("m/84'/1'"));
        assert_eq!(NETWORK, Network::Testnet);
    }
}
