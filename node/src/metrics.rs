//! # Prometheus Metrics
//!
//! Channel-level counters for the daemon, scraped from `/metrics` on the
//! metrics port. Metrics live in their own [`prometheus::Registry`] under the
//! `dropline` prefix.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

use dropline_protocol::session::InboxRefresh;

#[derive(Clone)]
pub struct ChannelMetrics {
    registry: Registry,
    /// Inbox scans run, background and on demand.
    pub scans_total: IntCounter,
    /// Scans where at least one source or mailbox could not be read.
    pub scans_degraded_total: IntCounter,
    /// Notes that decrypted under the channel key.
    pub messages_received_total: IntCounter,
    /// Annotations on our mailboxes that did not decrypt.
    pub payloads_undecryptable_total: IntCounter,
    pub sends_prepared_total: IntCounter,
    pub sends_committed_total: IntCounter,
    /// Wall-clock duration of a full scan.
    pub scan_latency_seconds: Histogram,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> prometheus::Result<C> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl ChannelMetrics {
    /// Creates and registers all metrics.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("dropline".into()), None)?;

        let scans_total = register(
            &registry,
            IntCounter::new("scans_total", "Inbox scans performed")?,
        )?;
        let scans_degraded_total = register(
            &registry,
            IntCounter::new(
                "scans_degraded_total",
                "Inbox scans that could not read every source",
            )?,
        )?;
        let messages_received_total = register(
            &registry,
            IntCounter::new("messages_received_total", "Notes decrypted from the ledger")?,
        )?;
        let payloads_undecryptable_total = register(
            &registry,
            IntCounter::new(
                "payloads_undecryptable_total",
                "Mailbox annotations that failed to decrypt",
            )?,
        )?;
        let sends_prepared_total = register(
            &registry,
            IntCounter::new("sends_prepared_total", "Unsigned note transactions prepared")?,
        )?;
        let sends_committed_total = register(
            &registry,
            IntCounter::new("sends_committed_total", "Broadcast notes recorded in the outbox")?,
        )?;
        let scan_latency_seconds = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new("scan_latency_seconds", "Duration of a full inbox scan")
                    .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            )?,
        )?;

        Ok(Self {
            registry,
            scans_total,
            scans_degraded_total,
            messages_received_total,
            payloads_undecryptable_total,
            sends_prepared_total,
            sends_committed_total,
            scan_latency_seconds,
        })
    }

    /// Records the outcome of one scan.
    pub fn observe_scan(&self, refresh: &InboxRefresh, elapsed: Duration) {
        self.scans_total.inc();
        if refresh.degraded {
            self.scans_degraded_total.inc();
        }
        self.messages_received_total.inc_by(refresh.messages.len() as u64);
        self.payloads_undecryptable_total
            .inc_by(refresh.undecryptable as u64);
        self.scan_latency_seconds.observe(elapsed.as_secs_f64());
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<ChannelMetrics>;

/// Renders `/metrics`.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_outcome_is_counted() {
        let metrics = ChannelMetrics::new().unwrap();
        let refresh = InboxRefresh {
            messages: Vec::new(),
            undecryptable: 2,
            degraded: true,
            used_fallback: false,
        };
        metrics.observe_scan(&refresh, Duration::from_millis(120));

        assert_eq!(metrics.scans_total.get(), 1);
        assert_eq!(metrics.scans_degraded_total.get(), 1);
        assert_eq!(metrics.payloads_undecryptable_total.get(), 2);

        let text = metrics.encode().unwrap();
        assert!(text.contains("dropline_scans_total 1"));
        assert!(text.contains("dropline_scan_latency_seconds_count 1"));
    }
}
