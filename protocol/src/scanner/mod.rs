//! # Channel Scanner
//!
//! Rebuilds the channel timeline from the ledger.
//!
//! ```text
//!   sources ──candidates──▶ dedup vs seen-set ──▶ timestamp ──▶ sort ──▶ commit
//!  (indexer,                 (and within batch)    fallback
//!   local queue)
//! ```
//!
//! [`ChannelScanner`] is an explicit object: it owns the seen-set, the
//! committed timeline and a small cursor. `scan` takes `&mut self`, so one
//! scanner has exactly one writer; the session wraps it in a mutex.
//!
//! ## Atomic commits
//!
//! A scan collects everything first and only then touches the seen-set and
//! timeline. A scan that fails half way leaves no trace, and the next scan
//! sees the same transactions again.
//!
//! ## Degraded scans
//!
//! Indexer trouble never surfaces as an error. The scan returns whatever it
//! could read (possibly nothing) with [`ScanReport::degraded`] set.

pub mod source;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::Payload;
use crate::derivation::MailboxAddress;

pub use source::{CandidateEntry, EntrySource, IndexerSource, LocalDeliveryQueue, SourceBatch};

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Where an entry's timestamp came from, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// Time of the block that confirmed the transaction.
    Block,
    /// When the indexer first saw the transaction.
    FirstSeen,
    /// Local clock at scan time.
    Local,
}

/// One committed candidate in the timeline. Still encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub txid: String,
    pub mailbox: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub counterpart: Option<String>,
    /// Name of the source that produced it.
    pub source: String,
}

/// Picks the best available timestamp: block time, then first-seen, then
/// `now`. Out-of-range values fall through to the next option.
pub fn resolve_timestamp(
    block_time: Option<i64>,
    first_seen: Option<i64>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, TimestampSource) {
    let from_secs = |secs: i64| DateTime::<Utc>::from_timestamp(secs, 0);
    if let Some(ts) = block_time.and_then(from_secs) {
        return (ts, TimestampSource::Block);
    }
    if let Some(ts) = first_seen.and_then(from_secs) {
        return (ts, TimestampSource::FirstSeen);
    }
    (now, TimestampSource::Local)
}

fn timeline_order(a: &InboxEntry, b: &InboxEntry) -> std::cmp::Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.txid.cmp(&b.txid))
}

// ---------------------------------------------------------------------------
// Cursor / Report
// ---------------------------------------------------------------------------

/// Progress bookkeeping across scans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Completed scans, degraded or not.
    pub scans: u64,
    pub last_scan: Option<DateTime<Utc>>,
    /// New entries committed by the most recent scan.
    pub last_new: usize,
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Newly committed entries, ascending by timestamp then txid.
    pub new_entries: Vec<InboxEntry>,
    /// Some source or mailbox could not be read.
    pub degraded: bool,
    /// The fallback sources were consulted.
    pub used_fallback: bool,
}

// ---------------------------------------------------------------------------
// ChannelScanner
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ChannelScanner {
    seen: HashSet<String>,
    timeline: Vec<InboxEntry>,
    cursor: ScanCursor,
}

impl ChannelScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed entry, ascending.
    pub fn timeline(&self) -> &[InboxEntry] {
        &self.timeline
    }

    pub fn cursor(&self) -> &ScanCursor {
        &self.cursor
    }

    pub fn is_seen(&self, txid: &str) -> bool {
        self.seen.contains(txid)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn seen(&self) -> &HashSet<String> {
        &self.seen
    }

    /// Runs one scan over `mailboxes`.
    ///
    /// Primary sources are read concurrently. Fallback sources are read only
    /// if the primaries produced no candidates (failed or empty).
    pub async fn scan(
        &mut self,
        sources: &[Arc<dyn EntrySource>],
        mailboxes: &[MailboxAddress],
    ) -> ScanReport {
        let now = Utc::now();
        let (fallbacks, primaries): (Vec<_>, Vec<_>) =
            sources.iter().partition(|s| s.is_fallback());

        let mut degraded = false;
        let mut batches = Vec::new();
        for (source, result) in self.read_sources(&primaries, mailboxes).await {
            match result {
                Some(batch) => {
                    degraded |= batch.failures > 0;
                    batches.push((source, batch));
                }
                None => degraded = true,
            }
        }

        let primaries_empty = batches.iter().all(|(_, b)| b.entries.is_empty());
        let used_fallback = primaries_empty && !fallbacks.is_empty();
        if used_fallback {
            for (source, result) in self.read_sources(&fallbacks, mailboxes).await {
                match result {
                    Some(batch) => batches.push((source, batch)),
                    None => degraded = true,
                }
            }
        }

        // Build the whole batch before committing anything.
        let mut fresh: HashSet<String> = HashSet::new();
        let mut inspected: Vec<String> = Vec::new();
        let mut new_entries: Vec<InboxEntry> = Vec::new();
        for (source, batch) in batches {
            inspected.extend(batch.inspected);
            for candidate in batch.entries {
                if self.seen.contains(&candidate.txid) || !fresh.insert(candidate.txid.clone()) {
                    continue;
                }
                let (timestamp, timestamp_source) =
                    resolve_timestamp(candidate.block_time, candidate.first_seen, now);
                new_entries.push(InboxEntry {
                    txid: candidate.txid,
                    mailbox: candidate.mailbox,
                    payload: candidate.payload,
                    timestamp,
                    timestamp_source,
                    counterpart: candidate.counterpart,
                    source: source.clone(),
                });
            }
        }
        new_entries.sort_by(timeline_order);

        // Commit.
        self.seen.extend(fresh);
        self.seen.extend(inspected);
        self.timeline.extend(new_entries.iter().cloned());
        self.timeline.sort_by(timeline_order);
        self.cursor.scans += 1;
        self.cursor.last_scan = Some(now);
        self.cursor.last_new = new_entries.len();

        if new_entries.is_empty() {
            debug!(degraded, used_fallback, "scan found nothing new");
        } else {
            info!(count = new_entries.len(), degraded, used_fallback, "scan committed new entries");
        }

        ScanReport {
            new_entries,
            degraded,
            used_fallback,
        }
    }

    /// Reads `sources` concurrently. `None` for a source that failed outright.
    async fn read_sources(
        &self,
        sources: &[&Arc<dyn EntrySource>],
        mailboxes: &[MailboxAddress],
    ) -> Vec<(String, Option<SourceBatch>)> {
        let known = &self.seen;
        let results = join_all(sources.iter().map(|s| s.candidates(mailboxes, known))).await;
        sources
            .iter()
            .zip(results)
            .map(|(source, result)| {
                let name = source.name().to_string();
                let batch = match result {
                    Ok(batch) => Some(batch),
                    Err(e) => {
                        warn!(source = %name, error = %e, "entry source unavailable");
                        None
                    }
                };
                (name, batch)
            })
            .collect()
    }
}
