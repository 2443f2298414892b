//! # Channel Session
//!
//! One open channel: the derived mailboxes and key, the scanner, the
//! decrypted timeline and the outbox. This is the type applications hold.
//!
//! ## Sending
//!
//! Note `n` (0-based, counting every note this side has sent) goes to
//! mailbox `n mod m`. The count is the larger of what this session recorded
//! and what scans observed coming from our own sender address, so a session
//! restored on a new device picks up the rotation where the old one left it.
//!
//! Two ways to send:
//!
//! - [`ChannelSession::send`] does build, sign, broadcast and record while
//!   holding the outbox lock. Concurrent sends queue up and get consecutive
//!   mailboxes.
//! - [`ChannelSession::prepare_send`] / [`ChannelSession::commit_send`] split
//!   that for external signers (CLI, HTTP API). The artifact carries the
//!   sequence it was prepared at, and commit refuses it if another send got
//!   there first.
//!
//! Nothing is recorded unless every step succeeded.
//!
//! ## Receiving
//!
//! [`ChannelSession::refresh_inbox`] runs a scan and decrypts the new
//! entries. Payloads that do not open under the channel key are counted and
//! dropped.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::crypto::{decrypt, encrypt, Payload};
use crate::derivation::{derive_channel, EncryptionKey, MailboxAddress};
use crate::error::ChannelError;
use crate::network::{LedgerIndexer, TransactionSigner};
use crate::scanner::{ChannelScanner, EntrySource, InboxEntry, ScanCursor, TimestampSource};
use crate::secret::normalize;
use crate::transaction::{build_transaction, SpendableOutput, UnsignedTransaction};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A note that opened under the channel key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    pub txid: String,
    pub mailbox: String,
    pub plaintext: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub counterpart: Option<String>,
    pub direction: Direction,
}

/// Everything an external signer needs, plus the sequence it was prepared at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendArtifact {
    pub sequence: u64,
    pub mailbox_index: u32,
    pub mailbox: String,
    pub payload: Payload,
    pub unsigned_tx_hex: String,
    /// Txid of the unsigned transaction (unchanged by segwit signing).
    pub txid: String,
    pub fee: u64,
    pub change: u64,
}

/// A send that made it onto the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub sequence: u64,
    pub txid: String,
    pub mailbox_index: u32,
    pub mailbox: String,
    pub sent_at: DateTime<Utc>,
}

/// Result of one [`ChannelSession::refresh_inbox`].
#[derive(Debug, Clone, Default)]
pub struct InboxRefresh {
    /// Newly decrypted messages, ascending.
    pub messages: Vec<DecryptedMessage>,
    /// New entries that did not decrypt.
    pub undecryptable: usize,
    pub degraded: bool,
    pub used_fallback: bool,
}

/// Point-in-time view for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub mailbox_count: usize,
    pub next_mailbox_index: u32,
    pub outbound_sequence: u64,
    pub messages: usize,
    pub undecryptable_total: u64,
    pub cursor: ScanCursor,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Outbox {
    /// Sends committed by this session.
    recorded: u64,
    /// Outbound notes seen on the ledger.
    observed: u64,
    records: Vec<OutboundRecord>,
}

impl Outbox {
    fn sequence(&self) -> u64 {
        self.recorded.max(self.observed)
    }

    fn record(&mut self, artifact: &SendArtifact, txid: &str) -> OutboundRecord {
        let record = OutboundRecord {
            sequence: artifact.sequence,
            txid: txid.to_string(),
            mailbox_index: artifact.mailbox_index,
            mailbox: artifact.mailbox.clone(),
            sent_at: Utc::now(),
        };
        self.recorded = self.recorded.max(artifact.sequence + 1);
        self.records.push(record.clone());
        record
    }
}

// ---------------------------------------------------------------------------
// ChannelSession
// ---------------------------------------------------------------------------

pub struct ChannelSession {
    config: ChannelConfig,
    mailboxes: Vec<MailboxAddress>,
    key: EncryptionKey,
    scanner: Mutex<ChannelScanner>,
    outbox: Mutex<Outbox>,
    messages: RwLock<Vec<DecryptedMessage>>,
    /// Addresses notes have been sent from; their notes read as outbound.
    own_senders: RwLock<HashSet<String>>,
    undecryptable: AtomicU64,
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("mailboxes", &self.mailboxes.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChannelSession {
    /// Normalizes the phrase and derives mailboxes and key. The phrase itself
    /// is not kept.
    pub fn open(phrase: &str, config: ChannelConfig) -> Result<Self, ChannelError> {
        let secret = normalize(phrase)?;
        let keys = derive_channel(&secret, config.mailbox_count)?;
        info!(
            mailboxes = keys.mailboxes.len(),
            fee_rate = config.fee_rate,
            "channel session opened"
        );
        let own_senders = config.sender_address.iter().cloned().collect();
        Ok(Self {
            config,
            mailboxes: keys.mailboxes,
            key: keys.key,
            scanner: Mutex::new(ChannelScanner::new()),
            outbox: Mutex::new(Outbox::default()),
            messages: RwLock::new(Vec::new()),
            own_senders: RwLock::new(own_senders),
            undecryptable: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn mailboxes(&self) -> &[MailboxAddress] {
        &self.mailboxes
    }

    /// The configured sender address, or [`ChannelError::MissingSender`].
    pub fn sender_address(&self) -> Result<&str, ChannelError> {
        self.config
            .sender_address
            .as_deref()
            .ok_or(ChannelError::MissingSender)
    }

    fn mailbox_for(&self, sequence: u64) -> &MailboxAddress {
        let index = (sequence % self.mailboxes.len() as u64) as usize;
        &self.mailboxes[index]
    }

    /// Mailbox the next note will go to.
    pub async fn next_mailbox(&self) -> MailboxAddress {
        let sequence = self.outbox.lock().await.sequence();
        self.mailbox_for(sequence).clone()
    }

    /// Notes sent so far (recorded or observed).
    pub async fn outbound_sequence(&self) -> u64 {
        self.outbox.lock().await.sequence()
    }

    pub async fn outbound_records(&self) -> Vec<OutboundRecord> {
        self.outbox.lock().await.records.clone()
    }

    /// Every decrypted message so far, ascending.
    pub fn timeline(&self) -> Vec<DecryptedMessage> {
        self.messages.read().clone()
    }

    pub fn undecryptable_total(&self) -> u64 {
        self.undecryptable.load(Ordering::Relaxed)
    }

    /// Txids the scanner will not report again.
    pub async fn seen_txids(&self) -> HashSet<String> {
        self.scanner.lock().await.seen().clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let cursor = self.scanner.lock().await.cursor().clone();
        let outbound_sequence = self.outbound_sequence().await;
        SessionSnapshot {
            mailbox_count: self.mailboxes.len(),
            next_mailbox_index: self.mailbox_for(outbound_sequence).index,
            outbound_sequence,
            messages: self.messages.read().len(),
            undecryptable_total: self.undecryptable_total(),
            cursor,
        }
    }

    async fn with_timeout<T, E>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, ChannelError>
    where
        E: Into<ChannelError>,
    {
        let limit: Duration = self.config.request_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ChannelError::Timeout {
                operation,
                timeout_ms: self.config.request_timeout_ms,
            }),
        }
    }

    fn build_at(
        &self,
        sequence: u64,
        plaintext: &str,
        sender: &str,
        utxos: &[SpendableOutput],
    ) -> Result<(SendArtifact, UnsignedTransaction), ChannelError> {
        let payload = encrypt(&self.key, plaintext)?;
        let mailbox = self.mailbox_for(sequence);
        let unsigned = build_transaction(sender, mailbox, &payload, utxos, self.config.fee_rate)?;
        let artifact = SendArtifact {
            sequence,
            mailbox_index: mailbox.index,
            mailbox: mailbox.address.clone(),
            payload,
            unsigned_tx_hex: unsigned.to_hex(),
            txid: unsigned.txid(),
            fee: unsigned.fee,
            change: unsigned.change,
        };
        if !self.own_senders.read().contains(sender) {
            self.own_senders.write().insert(sender.to_string());
        }
        Ok((artifact, unsigned))
    }

    /// Builds the next note without recording anything.
    pub async fn prepare_send(
        &self,
        plaintext: &str,
        sender: &str,
        utxos: &[SpendableOutput],
    ) -> Result<SendArtifact, ChannelError> {
        let sequence = self.outbox.lock().await.sequence();
        let (artifact, _) = self.build_at(sequence, plaintext, sender, utxos)?;
        debug!(sequence, mailbox = %artifact.mailbox, "prepared send");
        Ok(artifact)
    }

    /// Records a prepared send once its transaction is on the network.
    ///
    /// Fails with [`ChannelError::StaleSequence`] if the outbox moved since
    /// the artifact was prepared. Rebuild and sign again in that case: the
    /// note would otherwise land in the wrong mailbox.
    ///
    /// A scan may already have observed this very note between broadcast and
    /// commit. That move is our own, so the commit is accepted and the
    /// rotation is left where the scan put it. Committing the same txid twice
    /// returns the first record.
    pub async fn commit_send(
        &self,
        artifact: &SendArtifact,
        txid: &str,
    ) -> Result<OutboundRecord, ChannelError> {
        let mut outbox = self.outbox.lock().await;
        if let Some(existing) = outbox.records.iter().find(|r| r.txid == txid) {
            return Ok(existing.clone());
        }
        let current = outbox.sequence();
        if artifact.sequence != current {
            let already_observed = artifact.sequence < current
                && self
                    .messages
                    .read()
                    .iter()
                    .any(|m| m.txid == txid && m.direction == Direction::Outbound);
            if !already_observed {
                return Err(ChannelError::StaleSequence {
                    prepared: artifact.sequence,
                    current,
                });
            }
            debug!(sequence = artifact.sequence, %txid, "note observed before commit");
        }
        let record = outbox.record(artifact, txid);
        info!(sequence = record.sequence, txid = %record.txid, mailbox = %record.mailbox, "send committed");
        Ok(record)
    }

    /// Sends a note end to end: fetch UTXOs, build, sign, broadcast, record.
    ///
    /// The outbox lock is held throughout, so rotation stays consistent
    /// under concurrent sends. On any error nothing is recorded.
    pub async fn send(
        &self,
        plaintext: &str,
        sender: &str,
        indexer: &dyn LedgerIndexer,
        signer: &dyn TransactionSigner,
    ) -> Result<OutboundRecord, ChannelError> {
        let mut outbox = self.outbox.lock().await;
        let sequence = outbox.sequence();

        let utxos = self
            .with_timeout("spendable_outputs", indexer.spendable_outputs(sender))
            .await?;
        let (artifact, unsigned) = self.build_at(sequence, plaintext, sender, &utxos)?;
        let signed = self
            .with_timeout("sign_transaction", signer.sign_transaction(&unsigned))
            .await?;
        let txid = self
            .with_timeout("broadcast_transaction", signer.broadcast_transaction(&signed))
            .await?;

        let record = outbox.record(&artifact, &txid);
        info!(sequence, txid = %record.txid, mailbox = %record.mailbox, "note sent");
        Ok(record)
    }

    fn open_entry(&self, entry: InboxEntry) -> Option<DecryptedMessage> {
        let plaintext = decrypt(&self.key, &entry.payload)?;
        let direction = match &entry.counterpart {
            Some(from) if self.own_senders.read().contains(from) => Direction::Outbound,
            _ => Direction::Inbound,
        };
        Some(DecryptedMessage {
            txid: entry.txid,
            mailbox: entry.mailbox,
            plaintext,
            timestamp: entry.timestamp,
            timestamp_source: entry.timestamp_source,
            counterpart: entry.counterpart,
            direction,
        })
    }

    /// Scans `sources` and merges newly decrypted notes into the timeline.
    pub async fn refresh_inbox(&self, sources: &[Arc<dyn EntrySource>]) -> InboxRefresh {
        let mut scanner = self.scanner.lock().await;
        let report = scanner.scan(sources, &self.mailboxes).await;

        let mut refresh = InboxRefresh {
            degraded: report.degraded,
            used_fallback: report.used_fallback,
            ..InboxRefresh::default()
        };
        for entry in report.new_entries {
            let txid = entry.txid.clone();
            match self.open_entry(entry) {
                Some(message) => refresh.messages.push(message),
                None => {
                    debug!(%txid, "payload did not decrypt under channel key");
                    refresh.undecryptable += 1;
                }
            }
        }
        self.undecryptable
            .fetch_add(refresh.undecryptable as u64, Ordering::Relaxed);

        let outbound_seen = {
            let mut messages = self.messages.write();
            messages.extend(refresh.messages.iter().cloned());
            messages.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.txid.cmp(&b.txid))
            });
            messages
                .iter()
                .filter(|m| m.direction == Direction::Outbound)
                .count() as u64
        };
        drop(scanner);

        if outbound_seen > 0 {
            let mut outbox = self.outbox.lock().await;
            if outbound_seen > outbox.observed {
                outbox.observed = outbound_seen;
            }
        }

        if refresh.degraded {
            warn!(new = refresh.messages.len(), "inbox refresh degraded");
        }
        refresh
    }
}
