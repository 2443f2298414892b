//! # CLI Interface
//!
//! Command-line structure for `dropline-node`, built with `clap` derive.
//! Every channel setting can come from the environment, so the phrase never
//! has to appear in shell history.

use clap::{Args, Parser, Subcommand};

use dropline_protocol::config::{
    ChannelConfig, DEFAULT_FEE_RATE, DEFAULT_INDEXER_URL, DEFAULT_MAILBOX_COUNT, REQUEST_TIMEOUT,
};

use crate::logging::LogFormat;

/// Dropline channel daemon.
///
/// Derives the mailboxes and key of a shared-secret channel, scans the test
/// network for notes, prepares outgoing notes for an external signer, and
/// optionally serves a local HTTP API with Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "dropline-node",
    about = "Dropline shared-secret channel daemon",
    version,
    propagate_version = true
)]
pub struct DroplineCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "DROPLINE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the channel's mailbox addresses.
    Mailboxes(ChannelArgs),
    /// Scan the mailboxes once and print every note that decrypts.
    Inbox(InboxArgs),
    /// Build the next note and print the unsigned artifact as JSON.
    Send(SendArgs),
    /// Push a signed transaction through the indexer.
    Broadcast(BroadcastArgs),
    /// Run the scan loop and serve the local API.
    Serve(ServeArgs),
    /// Print version information and exit.
    Version,
}

/// Settings shared by every subcommand that opens a channel.
#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    /// The 12-word channel phrase.
    ///
    /// Prefer the environment variable over the flag.
    #[arg(long, env = "DROPLINE_SECRET", hide_env_values = true)]
    pub secret: String,

    /// Esplora-compatible indexer base URL.
    #[arg(long, env = "DROPLINE_INDEXER_URL", default_value = DEFAULT_INDEXER_URL)]
    pub indexer_url: String,

    /// Number of mailboxes to derive and rotate through.
    #[arg(long, env = "DROPLINE_MAILBOXES", default_value_t = DEFAULT_MAILBOX_COUNT)]
    pub mailboxes: u32,

    /// Fee rate in sat/vB.
    #[arg(long, env = "DROPLINE_FEE_RATE", default_value_t = DEFAULT_FEE_RATE)]
    pub fee_rate: f64,

    /// Our funding address. Needed to send, and to tell our own notes apart.
    #[arg(long, env = "DROPLINE_SENDER")]
    pub sender: Option<String>,

    /// Timeout for each indexer call, in milliseconds.
    #[arg(long, env = "DROPLINE_TIMEOUT_MS", default_value_t = REQUEST_TIMEOUT.as_millis() as u64)]
    pub timeout_ms: u64,
}

impl ChannelArgs {
    pub fn to_config(&self) -> ChannelConfig {
        ChannelConfig {
            mailbox_count: self.mailboxes,
            fee_rate: self.fee_rate,
            indexer_url: self.indexer_url.clone(),
            request_timeout_ms: self.timeout_ms,
            sender_address: self.sender.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct InboxArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,

    /// Print the timeline as JSON instead of one line per note.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,

    /// The note to send. Trimmed; must fit in one annotation.
    pub message: String,
}

#[derive(Args, Debug)]
pub struct BroadcastArgs {
    /// Esplora-compatible indexer base URL.
    #[arg(long, env = "DROPLINE_INDEXER_URL", default_value = DEFAULT_INDEXER_URL)]
    pub indexer_url: String,

    /// Signed transaction, hex encoded.
    pub hex: String,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,

    /// Address to bind the API and metrics listeners on.
    #[arg(long, env = "DROPLINE_BIND", default_value = "127.0.0.1")]
    pub bind: String,

    /// Port for the local HTTP API.
    #[arg(long, env = "DROPLINE_API_PORT", default_value_t = 9841)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "DROPLINE_METRICS_PORT", default_value_t = 9842)]
    pub metrics_port: u16,

    /// Seconds between background scans. 0 disables the loop.
    #[arg(long, env = "DROPLINE_SCAN_INTERVAL", default_value_t = 30)]
    pub scan_interval: u64,
}
