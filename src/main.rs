// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use fetchq::prelude::*;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Fetch one or more files concurrently, resuming where possible.
#[derive(Debug, Parser)]
#[command(name = "fetchq", version)]
struct Cli {
    /// Locations to fetch.
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory to write into (overrides the config file).
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fetchq=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = cli.dir {
        config.download_dir = dir;
    }

    let registry = Registry::new(config)?;
    let mut events = registry.subscribe();

    for url in &cli.urls {
        if let Err(e) = registry.submit(url).await {
            eprintln!("skipping '{url}': {e}");
        }
    }

    loop {
        if registry.is_idle().await {
            break;
        }
        tokio::select! {
            event = events.recv() => match event {
                Ok(TransferEvent::Progress { id }) | Ok(TransferEvent::StatusChanged { id, .. }) => {
                    if let Some(snap) = registry.snapshot(id).await {
                        print_line(&snap);
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\ninterrupted, canceling transfers");
                registry.shutdown(ShutdownMode::Cancel).await;
                break;
            }
        }
    }

    let snapshots = registry.snapshots().await;
    println!();
    for snap in &snapshots {
        print_line(snap);
    }

    let failed = snapshots
        .iter()
        .filter(|s| matches!(s.status, TransferStatus::Failed(_)))
        .count();
    if failed > 0 {
        bail!("{failed} of {} transfers failed", snapshots.len());
    }
    Ok(())
}

fn print_line(snap: &TransferSnapshot) {
    let percent = snap
        .progress_percent
        .map(|p| format!("{p:>3}%"))
        .unwrap_or_else(|| "  -%".to_string());
    let rate = snap
        .throughput_bps
        .map(|bps| format!("{}/s", format_size(Some(bps as u64))))
        .unwrap_or_default();
    println!(
        "{:<6} {:<40} {:>10} {} {:<12} {}",
        snap.id.to_string(),
        snap.display_name(),
        snap.size_label(),
        percent,
        snap.status.to_string(),
        rate
    );
}
