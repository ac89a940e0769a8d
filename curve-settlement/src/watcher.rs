//! Background tasks advancing the lifecycle
//!
//! - BTC event consumer: applies confirmations and reorgs reported by the
//!   Bitcoin watcher
//! - Execution loop: drives INCLUDED / EXECUTING / REVERTED intents, woken
//!   by the coordinator's work signal or by its interval
//! - Expiry sweeper: expires SIGNED intents past the inclusion window
//!
//! All tasks stop when the shared `watch` shutdown flag flips to `true`.

use crate::{coordinator::SettlementCoordinator, types::BtcTxid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Report from the Bitcoin watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BtcEvent {
    /// Funding tx seen with this many confirmations
    Confirmed {
        /// Funding tx
        txid: BtcTxid,
        /// Current depth
        confirmations: u32,
    },
    /// Funding tx no longer in the best chain
    Reorged {
        /// Funding tx
        txid: BtcTxid,
    },
}

/// Consume BTC watcher events until the channel closes or shutdown
pub fn spawn_btc_watcher(
    coordinator: Arc<SettlementCoordinator>,
    mut events: mpsc::Receiver<BtcEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    let result = match &event {
                        BtcEvent::Confirmed { txid, confirmations } => {
                            coordinator.on_btc_confirmed(txid, *confirmations).await
                        }
                        BtcEvent::Reorged { txid } => coordinator.on_btc_reorged(txid).await,
                    };
                    if let Err(e) = result {
                        tracing::error!(?event, "Failed to apply BTC event: {}", e);
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                else => break,
            }
        }
        tracing::debug!("BTC event consumer stopped");
    })
}

/// Run execution sweeps on every tick and whenever work is signalled
pub fn spawn_execution_loop(
    coordinator: Arc<SettlementCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let work = coordinator.work_signal();
    let mut ticker = interval(coordinator.config().settlement.execution_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = work.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match coordinator.run_execution_sweep().await {
                Ok(0) => {}
                Ok(driven) => tracing::debug!(driven, "Execution sweep"),
                Err(e) => tracing::error!("Execution sweep failed: {}", e),
            }
        }
        tracing::debug!("Execution loop stopped");
    })
}

/// Expire stale SIGNED intents on every tick
pub fn spawn_expiry_sweeper(
    coordinator: Arc<SettlementCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut ticker = interval(coordinator.config().settlement.expiry_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match coordinator.expire_stale().await {
                        Ok(0) => {}
                        Ok(expired) => tracing::info!(expired, "Expiry sweep"),
                        Err(e) => tracing::error!("Expiry sweep failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Expiry sweeper stopped");
    })
}

/// The three background tasks plus their shutdown switch
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawn every task against `coordinator`
    pub fn start(
        coordinator: Arc<SettlementCoordinator>,
        btc_events: mpsc::Receiver<BtcEvent>,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = vec![
            spawn_btc_watcher(coordinator.clone(), btc_events, rx.clone()),
            spawn_execution_loop(coordinator.clone(), rx.clone()),
            spawn_expiry_sweeper(coordinator, rx),
        ];
        Self { shutdown, handles }
    }

    /// Signal shutdown and wait for every task to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Background task panicked: {}", e);
            }
        }
    }
}
