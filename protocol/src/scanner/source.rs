//! Where candidate notes come from.
//!
//! An [`EntrySource`] turns a mailbox list into candidate entries: txid,
//! mailbox, raw payload text and whatever timing the source knows. It does
//! not decrypt and does not dedup against history beyond skipping the txids
//! it is told are already known.
//!
//! - [`IndexerSource`] reads the ledger through a [`LedgerIndexer`].
//! - [`LocalDeliveryQueue`] holds notes handed over out of band (a sender on
//!   the same machine, a QR code) before the ledger catches up. It is a
//!   fallback: the scanner only asks it when the ledger gave nothing.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::Payload;
use crate::derivation::MailboxAddress;
use crate::network::{IndexerError, LedgerIndexer};
use crate::transaction::annotation::{annotation_text, decode_transaction_hex, pays_to};

// ---------------------------------------------------------------------------
// CandidateEntry / SourceBatch
// ---------------------------------------------------------------------------

/// A transaction that carries an annotation and pays one of our mailboxes.
/// Whether the annotation is a note for us is decided later, by decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub txid: String,
    /// Mailbox address the transaction pays.
    pub mailbox: String,
    pub payload: Payload,
    /// Unix seconds.
    pub block_time: Option<i64>,
    /// Unix seconds.
    pub first_seen: Option<i64>,
    /// Funding address of the first input, if known.
    pub counterpart: Option<String>,
}

/// What one source produced in one scan.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub entries: Vec<CandidateEntry>,
    /// Txids that were fetched and inspected but carry no note for any of
    /// our mailboxes. The scanner remembers them so they are not fetched
    /// again.
    pub inspected: Vec<String>,
    /// Mailboxes or transactions that could not be read this time.
    pub failures: usize,
}

// ---------------------------------------------------------------------------
// EntrySource
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EntrySource: Send + Sync {
    /// Candidates for `mailboxes`, excluding txids in `known`.
    ///
    /// `Err` means the source could not be read at all. Partial failures
    /// are reported through [`SourceBatch::failures`].
    async fn candidates(
        &self,
        mailboxes: &[MailboxAddress],
        known: &HashSet<String>,
    ) -> Result<SourceBatch, IndexerError>;

    /// Fallback sources are only consulted when every primary source
    /// failed or came back empty.
    fn is_fallback(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// IndexerSource
// ---------------------------------------------------------------------------

/// Ledger-backed source. Queries all mailboxes concurrently.
#[derive(Clone)]
pub struct IndexerSource {
    indexer: Arc<dyn LedgerIndexer>,
}

/// Result of reading one mailbox.
enum MailboxScan {
    /// `unfetched` lists txids whose bodies could not be fetched.
    Read {
        batch: SourceBatch,
        unfetched: Vec<String>,
    },
    Failed(IndexerError),
}

impl IndexerSource {
    pub fn new(indexer: Arc<dyn LedgerIndexer>) -> Self {
        Self { indexer }
    }

    async fn scan_mailbox(&self, mailbox: &MailboxAddress, known: &HashSet<String>) -> MailboxScan {
        let history = match self.indexer.address_transactions(&mailbox.address).await {
            Ok(history) => history,
            Err(e) => {
                warn!(mailbox = %mailbox.address, error = %e, "mailbox history unavailable");
                return MailboxScan::Failed(e);
            }
        };

        let mut batch = SourceBatch::default();
        let mut unfetched = Vec::new();
        let mut visited = HashSet::new();
        for indexed in history {
            if known.contains(&indexed.txid) || !visited.insert(indexed.txid.clone()) {
                continue;
            }

            let raw = match self.indexer.transaction_hex(&indexed.txid).await {
                Ok(raw) => raw,
                Err(e) => {
                    // Left out of `inspected`, so the next scan tries again.
                    warn!(txid = %indexed.txid, error = %e, "transaction fetch failed");
                    batch.failures += 1;
                    unfetched.push(indexed.txid);
                    continue;
                }
            };

            let note = decode_transaction_hex(&raw)
                .filter(|tx| pays_to(tx, mailbox.script_pubkey()))
                .and_then(|tx| annotation_text(&tx));

            match note {
                Some(text) => batch.entries.push(CandidateEntry {
                    txid: indexed.txid,
                    mailbox: mailbox.address.clone(),
                    payload: Payload::from_text(text),
                    block_time: indexed.block_time,
                    first_seen: indexed.first_seen,
                    counterpart: indexed.counterpart,
                }),
                None => batch.inspected.push(indexed.txid),
            }
        }

        debug!(
            mailbox = %mailbox.address,
            candidates = batch.entries.len(),
            inspected = batch.inspected.len(),
            "mailbox scanned"
        );
        MailboxScan::Read { batch, unfetched }
    }
}

#[async_trait]
impl EntrySource for IndexerSource {
    async fn candidates(
        &self,
        mailboxes: &[MailboxAddress],
        known: &HashSet<String>,
    ) -> Result<SourceBatch, IndexerError> {
        let scans = join_all(mailboxes.iter().map(|m| self.scan_mailbox(m, known))).await;

        let mut merged = SourceBatch::default();
        let mut last_error = None;
        let mut read = 0usize;
        let mut unfetched = HashSet::new();
        for scan in scans {
            match scan {
                MailboxScan::Read {
                    batch,
                    unfetched: missing,
                } => {
                    read += 1;
                    merged.entries.extend(batch.entries);
                    merged.inspected.extend(batch.inspected);
                    merged.failures += batch.failures;
                    unfetched.extend(missing);
                }
                MailboxScan::Failed(e) => {
                    merged.failures += 1;
                    last_error = Some(e);
                }
            }
        }

        // A txid that carries no note for one mailbox may still carry one
        // for a mailbox that was not fully read. Only settle it when every
        // mailbox got a look at it.
        if last_error.is_some() {
            merged.inspected.clear();
        } else {
            merged.inspected.retain(|txid| !unfetched.contains(txid));
        }
        merged.inspected.sort();
        merged.inspected.dedup();

        match last_error {
            Some(e) if read == 0 => Err(e),
            _ => Ok(merged),
        }
    }

    fn name(&self) -> &str {
        self.indexer.name()
    }
}

// ---------------------------------------------------------------------------
// LocalDeliveryQueue
// ---------------------------------------------------------------------------

/// Notes delivered locally, ahead of the ledger.
///
/// Entries stay queued after being returned. The scanner's seen-set keeps
/// them from surfacing twice, and the ledger copy (same txid) is deduped
/// against them.
#[derive(Debug, Default)]
pub struct LocalDeliveryQueue {
    entries: Mutex<Vec<CandidateEntry>>,
}

impl LocalDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a note. A second delivery of the same txid is ignored.
    /// Returns whether the entry was queued.
    pub fn deliver(&self, entry: CandidateEntry) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.txid == entry.txid) {
            return false;
        }
        debug!(txid = %entry.txid, mailbox = %entry.mailbox, "queued local delivery");
        entries.push(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops queued entries whose txids are in `seen`.
    pub fn prune(&self, seen: &HashSet<String>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !seen.contains(&e.txid));
        before - entries.len()
    }
}

#[async_trait]
impl EntrySource for LocalDeliveryQueue {
    async fn candidates(
        &self,
        mailboxes: &[MailboxAddress],
        known: &HashSet<String>,
    ) -> Result<SourceBatch, IndexerError> {
        let ours: HashSet<&str> = mailboxes.iter().map(|m| m.address.as_str()).collect();
        let entries = self
            .entries
            .lock()
            .iter()
            .filter(|e| ours.contains(e.mailbox.as_str()) && !known.contains(&e.txid))
            .cloned()
            .collect();
        Ok(SourceBatch {
            entries,
            ..SourceBatch::default()
        })
    }

    fn is_fallback(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::derivation::derive_addresses;
    use crate::network::IndexedTransaction;
    use crate::secret::normalize;
    use crate::transaction::{build_transaction, SpendableOutput};

    const PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn entry(txid: &str, mailbox: &str) -> CandidateEntry {
        CandidateEntry {
            txid: txid.to_string(),
            mailbox: mailbox.to_string(),
            payload: Payload::from_text("cGF5bG9hZA=="),
            block_time: None,
            first_seen: None,
            counterpart: None,
        }
    }

    #[tokio::test]
    async fn local_queue_filters_by_mailbox_and_known() {
        let mailboxes = derive_addresses(&normalize(PHRASE).unwrap(), 2).unwrap();
        let queue = LocalDeliveryQueue::new();
        assert!(queue.deliver(entry("t1", &mailboxes[0].address)));
        assert!(queue.deliver(entry("t2", &mailboxes[1].address)));
        assert!(queue.deliver(entry("t3", "tb1qsomeoneelse")));
        assert!(!queue.deliver(entry("t1", &mailboxes[0].address)));
        assert_eq!(queue.len(), 3);

        let known: HashSet<String> = ["t2".to_string()].into_iter().collect();
        let batch = queue.candidates(&mailboxes, &known).await.unwrap();
        let txids: Vec<_> = batch.entries.iter().map(|e| e.txid.as_str()).collect();
        assert_eq!(txids, vec!["t1"]);
        assert!(queue.is_fallback());
    }

    /// In-memory ledger. Histories map mailbox address to txids; a missing
    /// history is an unreadable mailbox. `failing_fetches` lists call
    /// numbers of `transaction_hex` that fail.
    struct ScriptedLedger {
        histories: HashMap<String, Vec<String>>,
        bodies: HashMap<String, String>,
        failing_fetches: Vec<usize>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl LedgerIndexer for ScriptedLedger {
        async fn address_transactions(
            &self,
            address: &str,
        ) -> Result<Vec<IndexedTransaction>, IndexerError> {
            let txids = self.histories.get(address).ok_or_else(|| IndexerError::Status {
                endpoint: format!("/address/{address}/txs"),
                status: 503,
            })?;
            Ok(txids
                .iter()
                .map(|txid| IndexedTransaction {
                    txid: txid.clone(),
                    block_time: Some(100),
                    first_seen: None,
                    counterpart: None,
                })
                .collect())
        }

        async fn transaction_hex(&self, txid: &str) -> Result<String, IndexerError> {
            let call = self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing_fetches.contains(&call) {
                return Err(IndexerError::Timeout {
                    endpoint: format!("/tx/{txid}/hex"),
                });
            }
            self.bodies
                .get(txid)
                .cloned()
                .ok_or_else(|| IndexerError::NotFound { txid: txid.into() })
        }

        async fn spendable_outputs(
            &self,
            _address: &str,
        ) -> Result<Vec<SpendableOutput>, IndexerError> {
            Ok(Vec::new())
        }
    }

    /// A note transaction paying `mailboxes[1]`, shared by the histories of
    /// both mailboxes. For mailbox 0 it carries nothing.
    fn shared_note(mailboxes: &[MailboxAddress]) -> (String, String) {
        let funder = &mailboxes[2];
        let utxos = vec![SpendableOutput {
            txid: "22".repeat(32),
            vout: 0,
            value: 50_000,
            confirmed: true,
            script_pubkey: Some(funder.script_pubkey().clone()),
        }];
        let payload = Payload::from_text("bm90ZSBmb3IgbWFpbGJveCAx");
        let tx = build_transaction(&funder.address, &mailboxes[1], &payload, &utxos, 1.0).unwrap();
        (tx.txid(), tx.to_hex())
    }

    fn ledger(
        mailboxes: &[MailboxAddress],
        txid: &str,
        hex: &str,
        readable: &[usize],
        failing_fetches: Vec<usize>,
    ) -> ScriptedLedger {
        ScriptedLedger {
            histories: readable
                .iter()
                .map(|&i| (mailboxes[i].address.clone(), vec![txid.to_string()]))
                .collect(),
            bodies: [(txid.to_string(), hex.to_string())].into_iter().collect(),
            failing_fetches,
            fetches: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn inspected_excludes_txids_whose_fetch_failed_elsewhere() {
        let mailboxes = derive_addresses(&normalize(PHRASE).unwrap(), 3).unwrap();
        let (txid, hex) = shared_note(&mailboxes);

        // Mailbox 0 fetches it and finds nothing; mailbox 1's fetch fails.
        let source = IndexerSource::new(Arc::new(ledger(&mailboxes, &txid, &hex, &[0, 1], vec![1])));
        let batch = source
            .candidates(&mailboxes[..2], &HashSet::new())
            .await
            .unwrap();
        assert!(batch.entries.is_empty());
        assert!(batch.inspected.is_empty());
        assert_eq!(batch.failures, 1);

        // With both fetches succeeding the note surfaces under mailbox 1.
        let source = IndexerSource::new(Arc::new(ledger(&mailboxes, &txid, &hex, &[0, 1], vec![])));
        let batch = source
            .candidates(&mailboxes[..2], &HashSet::new())
            .await
            .unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].mailbox, mailboxes[1].address);
        assert_eq!(batch.inspected, vec![txid]);
    }

    #[tokio::test]
    async fn inspected_is_dropped_when_a_mailbox_history_fails() {
        let mailboxes = derive_addresses(&normalize(PHRASE).unwrap(), 3).unwrap();
        let (txid, hex) = shared_note(&mailboxes);

        // Only mailbox 0 is readable; mailbox 1 may still hold the note.
        let source = IndexerSource::new(Arc::new(ledger(&mailboxes, &txid, &hex, &[0], vec![])));
        let batch = source
            .candidates(&mailboxes[..2], &HashSet::new())
            .await
            .unwrap();
        assert!(batch.entries.is_empty());
        assert!(batch.inspected.is_empty());
        assert_eq!(batch.failures, 1);
    }

    #[test]
    fn prune_removes_seen_entries() {
        let queue = LocalDeliveryQueue::new();
        queue.deliver(entry("t1", "a"));
        queue.deliver(entry("t2", "a"));
        let seen: HashSet<String> = ["t1".to_string()].into_iter().collect();
        assert_eq!(queue.prune(&seen), 1);
        assert_eq!(queue.len(), 1);
    }
}
