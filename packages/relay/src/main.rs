// packages/relay/src/main.rs
//! Event Relay
//!
//! Reads events from stdin, one per line (`provider<TAB>message`, or a bare
//! message attributed to `stdin`), and runs them through the pipeline until
//! EOF or Ctrl-C.

use anyhow::{Context, Result};
use event_relay::observability::{init_metrics, init_tracing};
use event_relay::{Pipeline, PipelineConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = PipelineConfig::load().context("Failed to load configuration")?;

    init_tracing(config.log_json)?;
    if let Some(addr) = config.metrics_addr {
        init_metrics(addr)?;
    }

    info!("Starting event-relay v{}", event_relay::VERSION);

    let pipeline = Pipeline::new(config).context("Failed to build pipeline")?;
    let recovered = pipeline.start();
    info!(recovered, queue_dir = ?pipeline.queue_dir(), "Pipeline started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => record_line(&pipeline, &line),
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
        }
    }

    pipeline.shutdown().await;

    let stats = pipeline.stats();
    info!(
        enqueued = stats.total_enqueued,
        sent = stats.total_sent,
        failed = stats.total_failed,
        pending = stats.pending,
        "Stopped"
    );
    Ok(())
}

fn record_line(pipeline: &Pipeline, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }

    match line.split_once('\t') {
        Some((provider, message)) => pipeline.record_event(provider.trim(), message),
        None => pipeline.record_event("stdin", line),
    }
}
