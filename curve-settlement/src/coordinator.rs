//! Settlement coordinator
//!
//! Entry point of the core. Owns the store, the per-launch actor registry and
//! the shared execution context. Ingress (submissions, BTC watcher reports)
//! and sweeps (execution, expiry) are routed to the actor of the target
//! launch; reads go straight to storage.

use crate::{
    actor::{spawn_launch_actor, LaunchHandle, SettlementContext},
    events::EventPublisher,
    executor::{EvmExecutor, RetryPolicy},
    intent_ledger::IntentLedger,
    metrics::Metrics,
    refund::RefundBatch,
    storage::Storage,
    types::{
        BtcTxid, Intent, IntentId, IntentPhase, IntentRequest, Launch, LaunchId, Purchase,
        Refund, SubmitReceipt,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Phases the execution sweep picks up, in the order they are drained
const SWEEP_PHASES: [IntentPhase; 3] = [
    IntentPhase::Executing,
    IntentPhase::Reverted,
    IntentPhase::Included,
];

/// Settlement coordinator
pub struct SettlementCoordinator {
    config: Config,
    context: Arc<SettlementContext>,
    actors: DashMap<LaunchId, LaunchHandle>,
    work: Arc<Notify>,
}

impl std::fmt::Debug for SettlementCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementCoordinator")
            .field("service", &self.config.service_name)
            .field("actors", &self.actors.len())
            .finish_non_exhaustive()
    }
}

impl SettlementCoordinator {
    /// Open the store under `config.data_dir` and build the coordinator
    pub fn open(
        config: Config,
        executor: Arc<dyn EvmExecutor>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let context = Arc::new(SettlementContext {
            ledger: Arc::new(IntentLedger::new(storage)),
            executor,
            publisher,
            metrics,
            retry: RetryPolicy::from_config(&config.retry),
            min_confirmations: config.settlement.min_confirmations,
        });

        tracing::info!(
            service = %config.service_name,
            data_dir = %config.data_dir.display(),
            min_confirmations = config.settlement.min_confirmations,
            max_attempts = context.retry.max_attempts(),
            "Settlement coordinator opened"
        );

        Ok(Self {
            config,
            context,
            actors: DashMap::new(),
            work: Arc::new(Notify::new()),
        })
    }

    /// Resume work left behind by a previous process: EXECUTING intents are
    /// re-executed, REVERTED intents get their refund scheduled and INCLUDED
    /// intents are executed. Returns the number of intents driven.
    pub async fn recover(&self) -> Result<usize> {
        for phase in SWEEP_PHASES {
            let count = self.ledger().list_in_phase(phase)?.len();
            if count > 0 {
                tracing::info!(phase = phase.as_str(), count, "Recovering intents");
            }
        }
        self.run_execution_sweep().await
    }

    fn ledger(&self) -> &IntentLedger {
        &self.context.ledger
    }

    fn storage(&self) -> &Storage {
        self.context.ledger.storage()
    }

    /// Actor for `launch_id`, spawned on first use
    fn handle(&self, launch_id: &LaunchId) -> LaunchHandle {
        let mut entry = self.actors.entry(launch_id.clone()).or_insert_with(|| {
            spawn_launch_actor(
                launch_id.clone(),
                self.context.clone(),
                self.config.settlement.mailbox_capacity,
            )
        });
        if entry.is_closed() {
            tracing::warn!(launch_id = %launch_id, "Launch actor stopped, respawning");
            *entry = spawn_launch_actor(
                launch_id.clone(),
                self.context.clone(),
                self.config.settlement.mailbox_capacity,
            );
        }
        entry.clone()
    }

    // Ingress

    /// Accept a signed intent. Answers synchronously with the recorded phase.
    pub async fn submit(&self, request: IntentRequest) -> Result<SubmitReceipt> {
        self.handle(&request.launch_id).submit(request).await
    }

    /// BTC watcher: funding tx `txid` has `confirmations`
    pub async fn on_btc_confirmed(
        &self,
        txid: &BtcTxid,
        confirmations: u32,
    ) -> Result<Option<Intent>> {
        let Some(intent) = self.ledger().find_by_txid(txid)? else {
            tracing::debug!(txid = %txid, "Confirmation for unknown tx");
            return Ok(None);
        };

        let intent = self
            .handle(&intent.launch_id)
            .confirmed(intent.id, confirmations)
            .await?;
        if intent.phase == IntentPhase::Included {
            self.work.notify_one();
        }
        Ok(Some(intent))
    }

    /// BTC watcher: funding tx `txid` was reorged out
    pub async fn on_btc_reorged(&self, txid: &BtcTxid) -> Result<Option<Intent>> {
        let Some(intent) = self.ledger().find_by_txid(txid)? else {
            tracing::debug!(txid = %txid, "Reorg for unknown tx");
            return Ok(None);
        };

        self.handle(&intent.launch_id)
            .reorged(intent.id)
            .await
            .map(Some)
    }

    // Sweeps

    /// Drive one intent to its next resting phase
    pub async fn execute_intent(&self, intent_id: &IntentId) -> Result<Intent> {
        let intent = self.ledger().get(intent_id)?;
        self.handle(&intent.launch_id).execute(intent.id).await
    }

    /// Drive every pending intent. Launches run in parallel; within a launch
    /// intents run in arrival order. Returns the number of intents driven.
    pub async fn run_execution_sweep(&self) -> Result<usize> {
        let mut by_launch: BTreeMap<LaunchId, Vec<Intent>> = BTreeMap::new();
        for phase in SWEEP_PHASES {
            for intent in self.ledger().list_in_phase(phase)? {
                by_launch
                    .entry(intent.launch_id.clone())
                    .or_default()
                    .push(intent);
            }
        }
        if by_launch.is_empty() {
            return Ok(0);
        }

        let mut tasks = JoinSet::new();
        for (launch_id, mut intents) in by_launch {
            // Resumed work first, then arrival order
            intents.sort_by_key(|i| (i.phase != IntentPhase::Executing, i.created_at));
            let handle = self.handle(&launch_id);
            tasks.spawn(async move {
                let mut driven = 0usize;
                for intent in intents {
                    match handle.execute(intent.id.clone()).await {
                        Ok(_) => driven += 1,
                        Err(e) => tracing::error!(
                            intent_id = %intent.id,
                            launch_id = %launch_id,
                            "Sweep could not drive intent: {}",
                            e
                        ),
                    }
                }
                driven
            });
        }

        let mut total = 0;
        while let Some(joined) = tasks.join_next().await {
            total += joined.map_err(|e| Error::Concurrency(format!("Sweep task failed: {}", e)))?;
        }
        Ok(total)
    }

    /// Expire SIGNED intents whose inclusion window opened before
    /// `now - inclusion_timeout`. A reorg reopens the window.
    /// Returns the number expired.
    pub async fn expire_stale_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = self.config.settlement.inclusion_timeout()?;
        let deadline = now.checked_sub_signed(timeout).ok_or_else(|| {
            Error::Config(format!("inclusion deadline before {} out of range", now))
        })?;
        let mut expired = 0;
        for intent in self.ledger().signed_before(deadline)? {
            if self
                .handle(&intent.launch_id)
                .expire(intent.id, deadline)
                .await?
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Expire stale SIGNED intents as of now
    pub async fn expire_stale(&self) -> Result<usize> {
        self.expire_stale_at(Utc::now()).await
    }

    // Refunds

    /// Unpaid refunds
    pub fn pending_refunds(&self) -> Result<Vec<Refund>> {
        let pending = self.storage().pending_refunds()?;
        self.context.metrics.update_refunds_pending(pending.len());
        Ok(pending)
    }

    /// Up to `limit` unpaid refunds for the settlement cycle
    pub fn refund_batch(&self, limit: usize) -> Result<RefundBatch> {
        Ok(RefundBatch::collect(self.pending_refunds()?, limit))
    }

    /// Settlement cycle paid the refund for `intent_id`
    pub async fn mark_refunded(&self, intent_id: &IntentId) -> Result<Refund> {
        let intent = self.ledger().get(intent_id)?;
        let refund = self
            .handle(&intent.launch_id)
            .mark_refunded(intent.id)
            .await?;
        tracing::info!(intent_id = %intent_id, asset = ?refund.asset, "Refund paid");
        Ok(refund)
    }

    // Reads

    /// Get intent by ID
    pub fn get_intent(&self, intent_id: &IntentId) -> Result<Intent> {
        self.ledger().get(intent_id)
    }

    /// Get launch by ID
    pub fn get_launch(&self, launch_id: &LaunchId) -> Result<Launch> {
        self.storage()
            .get_launch(launch_id)?
            .ok_or_else(|| Error::LaunchNotFound(launch_id.to_string()))
    }

    /// All launches
    pub fn list_launches(&self) -> Result<Vec<Launch>> {
        self.storage().list_launches()
    }

    /// Purchase log from `sequence` (inclusive), at most `limit` records
    pub fn purchases_since(&self, sequence: u64, limit: usize) -> Result<Vec<Purchase>> {
        self.storage().purchases_since(sequence, limit)
    }

    /// Purchases of one launch in commit order
    pub fn launch_purchases(&self, launch_id: &LaunchId) -> Result<Vec<Purchase>> {
        self.storage().launch_purchases(launch_id)
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.context.metrics
    }

    /// Configuration in effect
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Signalled when an intent becomes executable
    pub fn work_signal(&self) -> Arc<Notify> {
        self.work.clone()
    }

    /// Stop every launch actor
    pub async fn shutdown(&self) {
        let handles: Vec<LaunchHandle> = self.actors.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                tracing::debug!(launch_id = %handle.launch_id(), "Actor already stopped: {}", e);
            }
        }
        self.actors.clear();
        tracing::info!("Settlement coordinator stopped");
    }
}
