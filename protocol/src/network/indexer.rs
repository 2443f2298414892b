//! # Ledger Indexer
//!
//! Everything Dropline knows about the ledger comes through
//! [`LedgerIndexer`]: which transactions touched an address, their raw bytes,
//! and which outputs an address can spend. [`EsploraClient`] implements it
//! over the Esplora REST API (`blockstream.info`, `mempool.space`, or a
//! self-hosted `electrs`).
//!
//! | Operation | Esplora endpoint |
//! |---|---|
//! | `address_transactions` | `GET /address/{a}/txs`, then `/txs/chain/{last}` pages |
//! | `transaction_hex` | `GET /tx/{txid}/hex` |
//! | `spendable_outputs` | `GET /address/{a}/utxo` + `/tx/{txid}/hex` for scripts |
//! | `broadcast` (extra) | `POST /tx` |
//!
//! One indexer is trusted as-is. There is no cross-checking between indexers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::ScriptBuf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::transaction::annotation::decode_transaction_hex;
use crate::transaction::SpendableOutput;

/// Esplora returns confirmed history in pages of this many transactions.
const CHAIN_PAGE_SIZE: usize = 25;

/// Upper bound on history pages fetched per address per scan.
const MAX_HISTORY_PAGES: usize = 40;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures talking to an indexer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexerError {
    #[error("indexer request {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("indexer request {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("indexer returned HTTP {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("indexer response for {endpoint} is malformed: {reason}")]
    Malformed { endpoint: String, reason: String },

    #[error("transaction {txid} not found")]
    NotFound { txid: String },
}

impl IndexerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Malformed { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// IndexedTransaction
// ---------------------------------------------------------------------------

/// A transaction that touched an address, as summarized by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTransaction {
    pub txid: String,
    /// Unix seconds of the including block. `None` while unconfirmed.
    pub block_time: Option<i64>,
    /// Unix seconds when the indexer first saw it, if the indexer says.
    pub first_seen: Option<i64>,
    /// Address that funded the first input, when the indexer reports
    /// prevouts. Used to tell our own notes from the other party's.
    pub counterpart: Option<String>,
}

// ---------------------------------------------------------------------------
// LedgerIndexer
// ---------------------------------------------------------------------------

/// Read access to the ledger.
#[async_trait]
pub trait LedgerIndexer: Send + Sync {
    /// Transactions that touched `address`, newest first.
    async fn address_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<IndexedTransaction>, IndexerError>;

    /// Consensus-encoded hex of one transaction.
    async fn transaction_hex(&self, txid: &str) -> Result<String, IndexerError>;

    /// Unspent outputs locked to `address`, confirmed or not. Locking
    /// scripts are filled in where the indexer can resolve them.
    async fn spendable_outputs(&self, address: &str)
        -> Result<Vec<SpendableOutput>, IndexerError>;

    /// Short label for logs and metrics.
    fn name(&self) -> &str {
        "indexer"
    }
}

// ---------------------------------------------------------------------------
// Esplora wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct EsploraStatus {
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EsploraPrevout {
    #[serde(default)]
    scriptpubkey_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    #[serde(default)]
    prevout: Option<EsploraPrevout>,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    #[serde(default)]
    status: EsploraStatus,
    #[serde(default)]
    vin: Vec<EsploraVin>,
    // Not part of upstream Esplora; some forks and proxies add it.
    #[serde(default, alias = "received", alias = "firstSeen")]
    first_seen: Option<i64>,
}

impl From<EsploraTx> for IndexedTransaction {
    fn from(tx: EsploraTx) -> Self {
        let counterpart = tx
            .vin
            .into_iter()
            .next()
            .and_then(|vin| vin.prevout)
            .and_then(|prevout| prevout.scriptpubkey_address);
        Self {
            txid: tx.txid,
            block_time: tx.status.block_time.filter(|_| tx.status.confirmed),
            first_seen: tx.first_seen,
            counterpart,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    #[serde(default)]
    status: EsploraStatus,
}

/// Locking script of output `vout` in a raw transaction, if both parse.
fn output_script(raw_hex: &str, vout: u32) -> Option<ScriptBuf> {
    let tx = decode_transaction_hex(raw_hex)?;
    tx.output
        .get(vout as usize)
        .map(|out| out.script_pubkey.clone())
}

// ---------------------------------------------------------------------------
// EsploraClient
// ---------------------------------------------------------------------------

/// [`LedgerIndexer`] over an Esplora REST endpoint.
#[derive(Debug, Clone)]
pub struct EsploraClient {
    base_url: String,
    http: reqwest::Client,
}

impl EsploraClient {
    /// Creates a client. `timeout` bounds every individual request.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dropline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IndexerError::Transport {
                endpoint: base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self, IndexerError> {
        Self::new(&config.indexer_url, config.request_timeout())
    }

    /// Default endpoint with the default timeout.
    pub fn testnet() -> Result<Self, IndexerError> {
        Self::from_config(&ChannelConfig::default())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transport_error(endpoint: &str, err: reqwest::Error) -> IndexerError {
        if err.is_timeout() {
            IndexerError::Timeout {
                endpoint: endpoint.to_string(),
            }
        } else {
            IndexerError::Transport {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }

    async fn get_response(&self, path: &str) -> Result<reqwest::Response, IndexerError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(path, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexerError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_text(&self, path: &str) -> Result<String, IndexerError> {
        self.get_response(path)
            .await?
            .text()
            .await
            .map_err(|e| Self::transport_error(path, e))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, IndexerError> {
        let body = self.get_text(path).await?;
        serde_json::from_str(&body).map_err(|e| IndexerError::Malformed {
            endpoint: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Pushes a signed transaction. Returns the txid the indexer reports.
    pub async fn broadcast(&self, raw_hex: &str) -> Result<String, IndexerError> {
        let endpoint = "/tx";
        let response = self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .body(raw_hex.trim().to_string())
            .send()
            .await
            .map_err(|e| Self::transport_error(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexerError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        let txid = response
            .text()
            .await
            .map_err(|e| Self::transport_error(endpoint, e))?;
        Ok(txid.trim().to_string())
    }
}

#[async_trait]
impl LedgerIndexer for EsploraClient {
    async fn address_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<IndexedTransaction>, IndexerError> {
        // First page: mempool transactions plus the newest confirmed page.
        let first: Vec<EsploraTx> = self.get_json(&format!("/address/{address}/txs")).await?;
        let mut confirmed_in_page = first.iter().filter(|t| t.status.confirmed).count();
        let mut last_confirmed = first
            .iter()
            .rev()
            .find(|t| t.status.confirmed)
            .map(|t| t.txid.clone());
        let mut history: Vec<IndexedTransaction> = first.into_iter().map(Into::into).collect();

        let mut pages = 1;
        while confirmed_in_page >= CHAIN_PAGE_SIZE && pages < MAX_HISTORY_PAGES {
            let Some(after) = last_confirmed.take() else {
                break;
            };
            let page: Vec<EsploraTx> = self
                .get_json(&format!("/address/{address}/txs/chain/{after}"))
                .await?;
            confirmed_in_page = page.len();
            last_confirmed = page.last().map(|t| t.txid.clone());
            history.extend(page.into_iter().map(IndexedTransaction::from));
            pages += 1;
        }

        if pages == MAX_HISTORY_PAGES {
            warn!(address, pages, "address history truncated");
        }
        debug!(address, count = history.len(), "fetched address history");
        Ok(history)
    }

    async fn transaction_hex(&self, txid: &str) -> Result<String, IndexerError> {
        match self.get_text(&format!("/tx/{txid}/hex")).await {
            Err(IndexerError::Status { status: 404, .. }) => Err(IndexerError::NotFound {
                txid: txid.to_string(),
            }),
            other => other.map(|hex| hex.trim().to_string()),
        }
    }

    async fn spendable_outputs(
        &self,
        address: &str,
    ) -> Result<Vec<SpendableOutput>, IndexerError> {
        let utxos: Vec<EsploraUtxo> = self.get_json(&format!("/address/{address}/utxo")).await?;

        // Esplora does not return locking scripts for UTXOs, so read them off
        // the funding transactions. One fetch per distinct funding txid.
        let mut scripts: HashMap<String, Option<String>> = HashMap::new();
        let mut outputs = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            if !scripts.contains_key(&utxo.txid) {
                let raw = match self.transaction_hex(&utxo.txid).await {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        warn!(txid = %utxo.txid, error = %e, "could not resolve funding transaction");
                        None
                    }
                };
                scripts.insert(utxo.txid.clone(), raw);
            }
            let script_pubkey = scripts
                .get(&utxo.txid)
                .and_then(|raw| raw.as_deref())
                .and_then(|raw| output_script(raw, utxo.vout));

            outputs.push(SpendableOutput {
                txid: utxo.txid,
                vout: utxo.vout,
                value: utxo.value,
                confirmed: utxo.status.confirmed,
                script_pubkey,
            });
        }

        debug!(address, count = outputs.len(), "fetched spendable outputs");
        Ok(outputs)
    }

    fn name(&self) -> &str {
        "esplora"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_esplora_history_entry() {
        let json = r#"[{
            "txid": "aa",
            "version": 2,
            "vin": [{"txid": "bb", "vout": 0, "prevout": {"scriptpubkey_address": "tb1qsender", "value": 10000}}],
            "vout": [],
            "status": {"confirmed": true, "block_height": 100, "block_time": 1700000000}
        }]"#;
        let parsed: Vec<EsploraTx> = serde_json::from_str(json).unwrap();
        let tx: IndexedTransaction = parsed.into_iter().next().unwrap().into();
        assert_eq!(tx.txid, "aa");
        assert_eq!(tx.block_time, Some(1_700_000_000));
        assert_eq!(tx.first_seen, None);
        assert_eq!(tx.counterpart.as_deref(), Some("tb1qsender"));
    }

    #[test]
    fn unconfirmed_entry_has_no_block_time() {
        let json = r#"{"txid": "cc", "status": {"confirmed": false}, "received": 1700000123}"#;
        let tx: IndexedTransaction = serde_json::from_str::<EsploraTx>(json).unwrap().into();
        assert_eq!(tx.block_time, None);
        assert_eq!(tx.first_seen, Some(1_700_000_123));
        assert_eq!(tx.counterpart, None);
    }

    #[test]
    fn first_seen_aliases() {
        for field in ["first_seen", "firstSeen", "received"] {
            let json = format!(r#"{{"txid": "dd", "{field}": 42}}"#);
            let tx: EsploraTx = serde_json::from_str(&json).unwrap();
            assert_eq!(tx.first_seen, Some(42), "{field}");
        }
    }

    #[test]
    fn parses_utxo_listing() {
        let json = r#"[{"txid": "ee", "vout": 1, "value": 5000, "status": {"confirmed": true, "block_time": 1}}]"#;
        let utxos: Vec<EsploraUtxo> = serde_json::from_str(json).unwrap();
        assert_eq!(utxos[0].vout, 1);
        assert_eq!(utxos[0].value, 5000);
        assert!(utxos[0].status.confirmed);
    }

    #[test]
    fn output_script_handles_garbage_and_range() {
        assert!(output_script("not hex", 0).is_none());
    }

    #[test]
    fn retryability() {
        let endpoint = "/x".to_string();
        assert!(IndexerError::Timeout {
            endpoint: endpoint.clone()
        }
        .is_retryable());
        assert!(IndexerError::Status {
            endpoint: endpoint.clone(),
            status: 503
        }
        .is_retryable());
        assert!(!IndexerError::Status {
            endpoint,
            status: 400
        }
        .is_retryable());
        assert!(!IndexerError::NotFound { txid: "ff".into() }.is_retryable());
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = EsploraClient::new("http://localhost:3002/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:3002/api");
    }
}
