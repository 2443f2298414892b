// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Dropline Node
//!
//! Entry point for the `dropline-node` binary.
//!
//! - `mailboxes`: print the derived mailbox addresses
//! - `inbox`: scan once and print the decrypted timeline
//! - `send`: print an unsigned note transaction for an external signer
//! - `broadcast`: push a signed transaction through the indexer
//! - `serve`: background scans, local HTTP API and metrics
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use dropline_protocol::config::{NETWORK_NAME, PROTOCOL_VERSION};
use dropline_protocol::network::{EsploraClient, LedgerIndexer};
use dropline_protocol::scanner::{EntrySource, IndexerSource, LocalDeliveryQueue};
use dropline_protocol::session::{ChannelSession, Direction};

use cli::{ChannelArgs, Commands, DroplineCli};
use metrics::ChannelMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DroplineCli::parse();
    logging::init_logging(logging::DEFAULT_FILTER, cli.log_format);

    match cli.command {
        Commands::Mailboxes(args) => list_mailboxes(args),
        Commands::Inbox(args) => show_inbox(args).await,
        Commands::Send(args) => prepare_send(args).await,
        Commands::Broadcast(args) => broadcast(args).await,
        Commands::Serve(args) => serve(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Opens the channel and its indexer client from the shared arguments.
fn open_channel(args: &ChannelArgs) -> Result<(Arc<ChannelSession>, Arc<EsploraClient>)> {
    let config = args.to_config();
    let client = EsploraClient::from_config(&config)
        .with_context(|| format!("failed to create indexer client for {}", config.indexer_url))?;
    let session = ChannelSession::open(&args.secret, config).context("failed to open channel")?;
    Ok((Arc::new(session), Arc::new(client)))
}

fn list_mailboxes(args: ChannelArgs) -> Result<()> {
    let session =
        ChannelSession::open(&args.secret, args.to_config()).context("failed to open channel")?;
    for mailbox in session.mailboxes() {
        println!("{:>3}  {}", mailbox.index, mailbox.address);
    }
    Ok(())
}

async fn show_inbox(args: cli::InboxArgs) -> Result<()> {
    let (session, client) = open_channel(&args.channel)?;
    let sources = vec![Arc::new(IndexerSource::new(client)) as Arc<dyn EntrySource>];

    let refresh = session.refresh_inbox(&sources).await;
    if refresh.degraded {
        tracing::warn!("some mailboxes could not be read; the timeline may be incomplete");
    }

    let timeline = session.timeline();
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&timeline).context("failed to encode timeline")?
        );
        return Ok(());
    }

    if timeline.is_empty() {
        println!("No notes.");
    }
    for message in &timeline {
        let arrow = match message.direction {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        };
        println!(
            "{}  {}  {}  ({})",
            message.timestamp.format("%Y-%m-%d %H:%M:%S"),
            arrow,
            message.plaintext,
            message.txid
        );
    }
    if refresh.undecryptable > 0 {
        println!("{} annotation(s) did not decrypt.", refresh.undecryptable);
    }
    Ok(())
}

/// Scans first so the rotation accounts for notes already on the ledger,
/// then prints the artifact for the signer.
async fn prepare_send(args: cli::SendArgs) -> Result<()> {
    let (session, client) = open_channel(&args.channel)?;
    let sender = session
        .sender_address()
        .context("--sender (or DROPLINE_SENDER) is required to send")?
        .to_string();

    let sources = vec![Arc::new(IndexerSource::new(client.clone())) as Arc<dyn EntrySource>];
    let refresh = session.refresh_inbox(&sources).await;
    if refresh.degraded {
        tracing::warn!("scan was degraded; the chosen mailbox may repeat a recent one");
    }

    let utxos = client
        .spendable_outputs(&sender)
        .await
        .with_context(|| format!("failed to fetch spendable outputs for {sender}"))?;
    let artifact = session
        .prepare_send(&args.message, &sender, &utxos)
        .await
        .context("failed to build note transaction")?;

    tracing::info!(
        mailbox = %artifact.mailbox,
        index = artifact.mailbox_index,
        fee = artifact.fee,
        "note prepared"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&artifact).context("failed to encode artifact")?
    );
    Ok(())
}

async fn broadcast(args: cli::BroadcastArgs) -> Result<()> {
    let client = EsploraClient::new(&args.indexer_url, dropline_protocol::config::REQUEST_TIMEOUT)
        .with_context(|| format!("failed to create indexer client for {}", args.indexer_url))?;
    let txid = client
        .broadcast(&args.hex)
        .await
        .context("indexer rejected the transaction")?;
    println!("{txid}");
    Ok(())
}

/// Runs the daemon: API server, metrics endpoint and background scans.
async fn serve(args: cli::ServeArgs) -> Result<()> {
    let (session, client) = open_channel(&args.channel)?;
    let node_metrics = Arc::new(ChannelMetrics::new().context("failed to register metrics")?);

    let state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            PROTOCOL_VERSION
        ),
        network: NETWORK_NAME.to_string(),
        session_id: uuid::Uuid::new_v4(),
        started_at: chrono::Utc::now(),
        session,
        indexer: client as Arc<dyn LedgerIndexer>,
        local: Arc::new(LocalDeliveryQueue::new()),
        metrics: Arc::clone(&node_metrics),
    };

    tracing::info!(
        session = %state.session_id,
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        mailboxes = state.session.mailboxes().len(),
        "starting dropline-node"
    );

    // --- API server ---
    let api_router = api::create_router(state.clone());
    let api_addr = format!("{}:{}", args.bind, args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("{}:{}", args.bind, args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Background scans ---
    let scan_loop = (args.scan_interval > 0).then(|| {
        let state = state.clone();
        let period = Duration::from_secs(args.scan_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let refresh = state.scan().await;
                if !refresh.messages.is_empty() {
                    tracing::info!(count = refresh.messages.len(), "new notes");
                }
            }
        })
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(handle) = scan_loop {
        handle.abort();
    }
    tracing::info!("dropline-node stopped");
    Ok(())
}

fn print_version() {
    println!("dropline-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol      {}", PROTOCOL_VERSION);
    println!("network       {}", NETWORK_NAME);
}

/// Waits for SIGINT or SIGTERM. If a handler cannot be installed, that
/// branch never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
