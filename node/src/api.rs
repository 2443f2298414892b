//! # Local HTTP API
//!
//! The axum router a local UI talks to. It never holds the signing wallet:
//! `/outbox/prepare` hands out an unsigned transaction, the caller signs and
//! broadcasts it elsewhere, then reports the txid to `/outbox/commit`.
//!
//! ## Endpoints
//!
//! | Method | Path              | Description                              |
//! |--------|-------------------|------------------------------------------|
//! | GET    | `/health`         | Liveness check                           |
//! | GET    | `/status`         | Session summary                          |
//! | GET    | `/mailboxes`      | Derived mailbox addresses                |
//! | GET    | `/inbox`          | Decrypted timeline                       |
//! | POST   | `/inbox/scan`     | Scan now, return what was new            |
//! | POST   | `/outbox/prepare` | Build the next note for signing          |
//! | POST   | `/outbox/commit`  | Record a broadcast note                  |
//! | POST   | `/deliver`        | Queue a note handed over out of band     |

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use dropline_protocol::error::{BuildError, ChannelError};
use dropline_protocol::network::LedgerIndexer;
use dropline_protocol::scanner::{CandidateEntry, EntrySource, IndexerSource, LocalDeliveryQueue};
use dropline_protocol::session::{
    ChannelSession, DecryptedMessage, InboxRefresh, OutboundRecord, SendArtifact,
};
use dropline_protocol::MailboxAddress;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub network: String,
    /// Identifies this daemon run in logs and `/status`.
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub session: Arc<ChannelSession>,
    pub indexer: Arc<dyn LedgerIndexer>,
    pub local: Arc<LocalDeliveryQueue>,
    pub metrics: SharedMetrics,
}

impl AppState {
    /// Ledger first, local deliveries as the fallback.
    pub fn sources(&self) -> Vec<Arc<dyn EntrySource>> {
        vec![
            Arc::new(IndexerSource::new(Arc::clone(&self.indexer))) as Arc<dyn EntrySource>,
            Arc::clone(&self.local) as Arc<dyn EntrySource>,
        ]
    }

    /// Runs one scan and records it in the metrics. Shared by the background
    /// loop and `POST /inbox/scan`.
    pub async fn scan(&self) -> InboxRefresh {
        let started = Instant::now();
        let refresh = self.session.refresh_inbox(&self.sources()).await;
        self.metrics.observe_scan(&refresh, started.elapsed());

        let seen = self.session.seen_txids().await;
        let pruned = self.local.prune(&seen);
        tracing::debug!(
            session = %self.session_id,
            new = refresh.messages.len(),
            undecryptable = refresh.undecryptable,
            degraded = refresh.degraded,
            pruned,
            "scan finished"
        );
        refresh
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/mailboxes", get(mailboxes_handler))
        .route("/inbox", get(inbox_handler))
        .route("/inbox/scan", post(scan_handler))
        .route("/outbox/prepare", post(prepare_handler))
        .route("/outbox/commit", post(commit_handler))
        .route("/deliver", post(deliver_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub network: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub mailbox_count: usize,
    pub next_mailbox_index: u32,
    pub outbound_sequence: u64,
    pub messages: usize,
    pub undecryptable_total: u64,
    pub scans: u64,
    pub last_scan: Option<DateTime<Utc>>,
    /// Local deliveries not yet confirmed by a scan.
    pub pending_local: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub new_messages: Vec<DecryptedMessage>,
    pub undecryptable: usize,
    pub degraded: bool,
    pub used_fallback: bool,
}

impl From<InboxRefresh> for ScanResponse {
    fn from(refresh: InboxRefresh) -> Self {
        Self {
            new_messages: refresh.messages,
            undecryptable: refresh.undecryptable,
            degraded: refresh.degraded,
            used_fallback: refresh.used_fallback,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PrepareRequest {
    pub message: String,
    /// Overrides the configured sender address for this note.
    #[serde(default)]
    pub sender: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub artifact: SendArtifact,
    pub txid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeliverResponse {
    /// False when the txid was already queued.
    pub queued: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

/// A [`ChannelError`] on its way out as an HTTP response.
pub struct ApiError(ChannelError);

impl From<ChannelError> for ApiError {
    fn from(e: ChannelError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ChannelError::Validation(_)
            | ChannelError::Derivation(_)
            | ChannelError::MissingSender
            | ChannelError::Build(BuildError::Validation(_))
            | ChannelError::Build(BuildError::InvalidOutpoint { .. }) => StatusCode::BAD_REQUEST,
            ChannelError::Build(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChannelError::StaleSequence { .. } => StatusCode::CONFLICT,
            ChannelError::Indexer(_) | ChannelError::Signer(_) => StatusCode::BAD_GATEWAY,
            ChannelError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed upstream");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    let body = ErrorResponse {
        error: message.into(),
        retryable: false,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.session.snapshot().await;
    Json(StatusResponse {
        version: state.version.clone(),
        network: state.network.clone(),
        session_id: state.session_id,
        started_at: state.started_at,
        mailbox_count: snapshot.mailbox_count,
        next_mailbox_index: snapshot.next_mailbox_index,
        outbound_sequence: snapshot.outbound_sequence,
        messages: snapshot.messages,
        undecryptable_total: snapshot.undecryptable_total,
        scans: snapshot.cursor.scans,
        last_scan: snapshot.cursor.last_scan,
        pending_local: state.local.len(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// `GET /mailboxes`
async fn mailboxes_handler(State(state): State<AppState>) -> Json<Vec<MailboxAddress>> {
    Json(state.session.mailboxes().to_vec())
}

/// `GET /inbox`
async fn inbox_handler(State(state): State<AppState>) -> Json<Vec<DecryptedMessage>> {
    Json(state.session.timeline())
}

/// `POST /inbox/scan`
async fn scan_handler(State(state): State<AppState>) -> Json<ScanResponse> {
    Json(state.scan().await.into())
}

/// `POST /outbox/prepare`: fetches spendable outputs for the sender and
/// builds the next note. Nothing is recorded until `/outbox/commit`.
async fn prepare_handler(
    State(state): State<AppState>,
    Json(req): Json<PrepareRequest>,
) -> Result<Json<SendArtifact>, ApiError> {
    let sender = match req.sender.as_deref() {
        Some(sender) => sender,
        None => state.session.sender_address()?,
    };

    let config = state.session.config();
    let utxos = tokio::time::timeout(
        config.request_timeout(),
        state.indexer.spendable_outputs(sender),
    )
    .await
    .map_err(|_| ChannelError::Timeout {
        operation: "spendable_outputs",
        timeout_ms: config.request_timeout_ms,
    })?
    .map_err(ChannelError::from)?;

    let artifact = state
        .session
        .prepare_send(&req.message, sender, &utxos)
        .await?;
    state.metrics.sends_prepared_total.inc();
    Ok(Json(artifact))
}

/// `POST /outbox/commit`: 409 if another note was committed since the
/// artifact was prepared.
async fn commit_handler(
    State(state): State<AppState>,
    Json(req): Json<CommitRequest>,
) -> Response {
    if req.txid.trim().is_empty() {
        return bad_request("txid must not be empty");
    }
    match state.session.commit_send(&req.artifact, req.txid.trim()).await {
        Ok(record) => {
            state.metrics.sends_committed_total.inc();
            (StatusCode::OK, Json::<OutboundRecord>(record)).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// `POST /deliver`: queues a note for the next scan. The entry must target
/// one of this channel's mailboxes.
async fn deliver_handler(
    State(state): State<AppState>,
    Json(entry): Json<CandidateEntry>,
) -> Response {
    if entry.txid.trim().is_empty() {
        return bad_request("txid must not be empty");
    }
    if !state
        .session
        .mailboxes()
        .iter()
        .any(|m| m.address == entry.mailbox)
    {
        return bad_request(format!("{} is not a mailbox of this channel", entry.mailbox));
    }
    let queued = state.local.deliver(entry);
    (StatusCode::ACCEPTED, Json(DeliverResponse { queued })).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use dropline_protocol::config::ChannelConfig;
    use dropline_protocol::crypto::encrypt;
    use dropline_protocol::derivation::{derive_addresses, derive_encryption_key};
    use dropline_protocol::network::{IndexedTransaction, IndexerError};
    use dropline_protocol::secret::normalize;
    use dropline_protocol::session::Direction;
    use dropline_protocol::transaction::SpendableOutput;

    const PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const WALLET: &str = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong";

    /// Empty history everywhere, one confirmed coin for the wallet.
    struct QuietIndexer {
        wallet: MailboxAddress,
    }

    #[async_trait]
    impl LedgerIndexer for QuietIndexer {
        async fn address_transactions(
            &self,
            _address: &str,
        ) -> Result<Vec<IndexedTransaction>, IndexerError> {
            Ok(Vec::new())
        }

        async fn transaction_hex(&self, txid: &str) -> Result<String, IndexerError> {
            Err(IndexerError::NotFound {
                txid: txid.to_string(),
            })
        }

        async fn spendable_outputs(
            &self,
            address: &str,
        ) -> Result<Vec<SpendableOutput>, IndexerError> {
            if address != self.wallet.address {
                return Ok(Vec::new());
            }
            Ok(vec![SpendableOutput {
                txid: "ab".repeat(32),
                vout: 0,
                value: 25_000,
                confirmed: true,
                script_pubkey: Some(self.wallet.script_pubkey().clone()),
            }])
        }

        fn name(&self) -> &str {
            "quiet"
        }
    }

    fn wallet() -> MailboxAddress {
        derive_addresses(&normalize(WALLET).unwrap(), 1)
            .unwrap()
            .remove(0)
    }

    fn test_app_state(sender: Option<String>) -> AppState {
        let config = ChannelConfig {
            sender_address: sender,
            ..ChannelConfig::default()
        };
        AppState {
            version: "0.1.0-test".into(),
            network: "testnet".into(),
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            session: Arc::new(ChannelSession::open(PHRASE, config).unwrap()),
            indexer: Arc::new(QuietIndexer { wallet: wallet() }),
            local: Arc::new(LocalDeliveryQueue::new()),
            metrics: Arc::new(crate::metrics::ChannelMetrics::new().unwrap()),
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn post_json(
        router: &Router,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let router = create_router(test_app_state(None));
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_fresh_session() {
        let state = test_app_state(None);
        let id = state.session_id;
        let router = create_router(state);

        let (status, body) = get(&router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.session_id, id);
        assert_eq!(resp.network, "testnet");
        assert_eq!(resp.mailbox_count, 8);
        assert_eq!(resp.next_mailbox_index, 0);
        assert_eq!(resp.scans, 0);
        assert!(resp.last_scan.is_none());
    }

    #[tokio::test]
    async fn mailboxes_are_listed_in_order() {
        let router = create_router(test_app_state(None));
        let (status, body) = get(&router, "/mailboxes").await;
        assert_eq!(status, StatusCode::OK);
        let list: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.len(), 8);
        for (i, entry) in list.iter().enumerate() {
            assert_eq!(entry["index"], i as u64);
            assert!(entry["address"].as_str().unwrap().starts_with("tb1q"));
        }
    }

    #[tokio::test]
    async fn prepare_without_sender_is_rejected() {
        let router = create_router(test_app_state(None));
        let (status, body) =
            post_json(&router, "/outbox/prepare", serde_json::json!({ "message": "hi" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn prepare_commit_and_stale_commit() {
        let state = test_app_state(Some(wallet().address));
        let metrics = state.metrics.clone();
        let router = create_router(state);

        let (status, body) =
            post_json(&router, "/outbox/prepare", serde_json::json!({ "message": "hello" })).await;
        assert_eq!(status, StatusCode::OK);
        let artifact: SendArtifact = serde_json::from_slice(&body).unwrap();
        assert_eq!(artifact.sequence, 0);
        assert_eq!(artifact.mailbox_index, 0);

        let commit = serde_json::json!({ "artifact": artifact, "txid": artifact.txid });
        let (status, _) = post_json(&router, "/outbox/commit", commit.clone()).await;
        assert_eq!(status, StatusCode::OK);

        // Same artifact again: the sequence has moved on.
        let (status, body) = post_json(&router, "/outbox/commit", commit).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.retryable);

        let (_, body) = get(&router, "/status").await;
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.next_mailbox_index, 1);
        assert_eq!(metrics.sends_prepared_total.get(), 1);
        assert_eq!(metrics.sends_committed_total.get(), 1);
    }

    #[tokio::test]
    async fn oversized_note_is_a_bad_request() {
        let router = create_router(test_app_state(Some(wallet().address)));
        let long = "x".repeat(200);
        let (status, _) =
            post_json(&router, "/outbox/prepare", serde_json::json!({ "message": long })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delivered_note_shows_up_after_scan() {
        let state = test_app_state(None);
        let mailbox = state.session.mailboxes()[3].address.clone();
        let key = derive_encryption_key(&normalize(PHRASE).unwrap()).unwrap();
        let payload = encrypt(&key, "by hand").unwrap();
        let router = create_router(state.clone());

        let entry = serde_json::json!({
            "txid": "cd".repeat(32),
            "mailbox": mailbox,
            "payload": payload,
            "block_time": null,
            "first_seen": null,
            "counterpart": null,
        });
        let (status, body) = post_json(&router, "/deliver", entry).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let resp: DeliverResponse = serde_json::from_slice(&body).unwrap();
        assert!(resp.queued);

        let (status, body) = post_json(&router, "/inbox/scan", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let scan: ScanResponse = serde_json::from_slice(&body).unwrap();
        assert!(scan.used_fallback);
        assert_eq!(scan.new_messages.len(), 1);
        assert_eq!(scan.new_messages[0].plaintext, "by hand");
        assert_eq!(scan.new_messages[0].direction, Direction::Inbound);
        assert_eq!(state.local.len(), 0);

        let (_, body) = get(&router, "/inbox").await;
        let timeline: Vec<DecryptedMessage> = serde_json::from_slice(&body).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(state.metrics.messages_received_total.get(), 1);
    }

    #[tokio::test]
    async fn deliver_to_foreign_mailbox_is_rejected() {
        let router = create_router(test_app_state(None));
        let entry = serde_json::json!({
            "txid": "ef".repeat(32),
            "mailbox": "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
            "payload": "AAAA",
            "block_time": null,
            "first_seen": null,
            "counterpart": null,
        });
        let (status, _) = post_json(&router, "/deliver", entry).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
