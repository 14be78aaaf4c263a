// packages/relay/src/observability/mod.rs
//! Logging and metrics setup for the binary
//!
//! The library only emits `tracing` events and `metrics` counters; both
//! are no-ops until the functions here install a subscriber and recorder.

use crate::utils::errors::{PipelineError, Result};
use metrics::{describe_counter, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
///
/// Filtered by `RUST_LOG` (default `info`). Logs go to stderr so stdin/stdout
/// stay free for event input.
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| PipelineError::Observability(e.to_string()))
}

/// Install the Prometheus recorder, serving `/metrics` on `addr`
///
/// Must run inside a tokio runtime (the listener is spawned onto it).
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| PipelineError::Observability(e.to_string()))?;

    describe_metrics();
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

fn describe_metrics() {
    describe_counter!("relay_events_enqueued_total", Unit::Count, "Events passed to record_event");
    describe_counter!("relay_events_sent_total", Unit::Count, "Events accepted by the collector");
    describe_counter!("relay_events_failed_total", Unit::Count, "Events in failed delivery attempts");
    describe_counter!("relay_flush_total", Unit::Count, "Delivery attempts by outcome");
    describe_counter!("relay_compactions_total", Unit::Count, "Completed compaction passes");
    describe_counter!("relay_archives_deleted_total", Unit::Count, "Archive segments removed by retention, by reason");
    describe_counter!("relay_debris_removed_total", Unit::Count, "Abandoned temporaries and expired quarantined records removed");
    describe_counter!("relay_events_dropped_total", Unit::Count, "Records refused by the full pending queue");
}
