use anyhow::{Context, Result};
use statelog::config::{load_config, StatelogConfig};
use statelog::{store, Recorder, StateChangeEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Reads newline-delimited StateChangeEvent JSON from stdin and records it.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statelog=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => load_config(&PathBuf::from(path))?,
        None => StatelogConfig::default(),
    };
    config.apply_env();

    info!(
        backend = ?config.store.backend,
        path = %config.store.path.display(),
        "statelog starting"
    );

    let store = store::open(&config.store).context("Failed to open state store")?;
    let recorder = Arc::new(Recorder::new(Arc::clone(&store), config.recorder.clone()));
    recorder.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match StateChangeEvent::from_json(line.as_bytes()) {
            Ok(event) => {
                recorder.submit(event)?;
            }
            Err(e) => warn!(line = line_no, error = %e, "Skipping undecodable event"),
        }
    }

    recorder
        .block_till_done()
        .await
        .context("Recorder did not drain before shutdown")?;
    recorder.shutdown().await;

    let health = recorder.health();
    info!(
        recorded = health.metrics.recorded,
        dropped = health.metrics.dropped,
        lost = health.metrics.lost,
        degraded = health.degraded,
        "Input exhausted"
    );
    println!("{}", store.record_count()?);

    Ok(())
}
