//! Settlement node binary
//!
//! Runs the coordinator with its background tasks. BTC watcher reports are
//! read from stdin as JSON lines, e.g.
//! `{"event":"confirmed","txid":"ab12…","confirmations":1}`.
//! Domain events are logged and written to stdout as JSON lines.

use anyhow::Context;
use curve_settlement::{
    BackgroundTasks, BroadcastPublisher, BtcEvent, Config, DryRunExecutor, FanoutPublisher,
    SettlementCoordinator, TracingPublisher,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var_os("SETTLEMENT_LOG_JSON").is_some() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting settlement node");

    // Load configuration
    let config = match std::env::var("SETTLEMENT_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("loading config from environment")?,
    };
    let btc_capacity = config.settlement.mailbox_capacity;

    let broadcast_events = BroadcastPublisher::new(config.events.channel_capacity);
    let mut event_rx = broadcast_events.subscribe();
    let publisher = FanoutPublisher::new(vec![
        Arc::new(TracingPublisher),
        Arc::new(broadcast_events),
    ]);

    let coordinator = Arc::new(
        SettlementCoordinator::open(config, Arc::new(DryRunExecutor), Arc::new(publisher))
            .context("opening settlement coordinator")?,
    );

    let event_feed = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    let line = match event.to_json() {
                        Ok(json) => json + "\n",
                        Err(e) => {
                            tracing::warn!("Failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if stdout.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event output lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let recovered = coordinator.recover().await?;
    tracing::info!(recovered, "Recovery complete");

    let (btc_tx, btc_rx) = mpsc::channel(btc_capacity);
    let tasks = BackgroundTasks::start(coordinator.clone(), btc_rx);

    let stdin_feed = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BtcEvent>(&line) {
                Ok(event) => {
                    if btc_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Ignoring malformed BTC event: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down settlement node");
    stdin_feed.abort();
    tasks.stop().await;
    coordinator.shutdown().await;
    event_feed.abort();
    Ok(())
}
