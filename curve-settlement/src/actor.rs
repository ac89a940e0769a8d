//! Per-launch single-writer actors
//!
//! Every mutation of a launch and of the intents that target it runs inside
//! that launch's actor. Launches proceed in parallel; within one launch,
//! intents are priced and committed strictly one at a time against the
//! current authoritative supply.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │     SettlementCoordinator / watchers / sweepers      │
//! └─────────────────────┬────────────────────────────────┘
//!                       │  LaunchHandle (Clone)
//!                       │  mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │             LaunchActor (one task per launch)        │
//! │  SIGNED ─► INCLUDED ─► EXECUTING ─► COMMITTED        │
//! │                          │    └───► REVERTED ─► REFUND_PENDING
//! │                          └────────► FAILED           │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//!        IntentLedger (atomic RocksDB write batches)
//! ```

use crate::{
    curve::{split_fee, PricingCurve},
    events::{DomainEvent, EventPublisher},
    executor::{EvmExecutor, ExecutionRequest, RetryPolicy},
    intent_ledger::{IntentLedger, TradeFill},
    metrics::Metrics,
    types::{
        CommitResult, Intent, IntentId, IntentKind, IntentPhase, IntentRequest, Launch, LaunchId,
        RevertReason, Sats, SlippageBound, SubmitReceipt, TradeType,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Shared collaborators of every launch actor
pub struct SettlementContext {
    /// Durable intent store
    pub ledger: Arc<IntentLedger>,
    /// EVM side
    pub executor: Arc<dyn EvmExecutor>,
    /// Event sink
    pub publisher: Arc<dyn EventPublisher>,
    /// Metrics
    pub metrics: Metrics,
    /// Execution retry policy
    pub retry: RetryPolicy,
    /// Confirmations before SIGNED -> INCLUDED
    pub min_confirmations: u32,
}

impl std::fmt::Debug for SettlementContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementContext")
            .field("retry", &self.retry)
            .field("min_confirmations", &self.min_confirmations)
            .finish_non_exhaustive()
    }
}

/// Message sent to a launch actor
#[derive(Debug)]
pub enum LaunchMessage {
    /// Record a new intent
    Submit {
        request: IntentRequest,
        response: oneshot::Sender<Result<SubmitReceipt>>,
    },

    /// Funding tx seen with `confirmations`
    Confirmed {
        intent_id: IntentId,
        confirmations: u32,
        response: oneshot::Sender<Result<Intent>>,
    },

    /// Funding tx dropped by a reorg
    Reorged {
        intent_id: IntentId,
        response: oneshot::Sender<Result<Intent>>,
    },

    /// Drive an intent to its next resting phase
    Execute {
        intent_id: IntentId,
        response: oneshot::Sender<Result<Intent>>,
    },

    /// Expire a SIGNED intent whose inclusion window opened before `deadline`
    Expire {
        intent_id: IntentId,
        deadline: DateTime<Utc>,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Settlement cycle paid the refund
    MarkRefunded {
        intent_id: IntentId,
        response: oneshot::Sender<Result<crate::types::Refund>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Outcome of re-pricing an intent
enum Planned {
    Ready(Box<ExecutionPlan>),
    Rejected(RevertReason),
}

struct ExecutionPlan {
    request: ExecutionRequest,
    /// Launch state after the trade
    launch: Launch,
    /// `None` for CREATE
    fill: Option<TradeFill>,
    /// Trade moves the launch to FINALIZED
    finalizes: bool,
}

/// Actor owning one launch
pub struct LaunchActor {
    launch_id: LaunchId,
    context: Arc<SettlementContext>,
    mailbox: mpsc::Receiver<LaunchMessage>,
}

impl LaunchActor {
    /// Create new actor
    pub fn new(
        launch_id: LaunchId,
        context: Arc<SettlementContext>,
        mailbox: mpsc::Receiver<LaunchMessage>,
    ) -> Self {
        Self {
            launch_id,
            context,
            mailbox,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        tracing::debug!(launch_id = %self.launch_id, "Launch actor started");

        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LaunchMessage::Submit { request, response } => {
                    let _ = response.send(self.submit(request));
                }
                LaunchMessage::Confirmed {
                    intent_id,
                    confirmations,
                    response,
                } => {
                    let _ = response.send(self.confirm(&intent_id, confirmations));
                }
                LaunchMessage::Reorged {
                    intent_id,
                    response,
                } => {
                    let _ = response.send(self.reorg(&intent_id));
                }
                LaunchMessage::Execute {
                    intent_id,
                    response,
                } => {
                    let result = self.execute(&intent_id).await;
                    if let Err(e) = &result {
                        tracing::error!(
                            intent_id = %intent_id,
                            launch_id = %self.launch_id,
                            "Execution step failed: {}",
                            e
                        );
                    }
                    let _ = response.send(result);
                }
                LaunchMessage::Expire {
                    intent_id,
                    deadline,
                    response,
                } => {
                    let _ = response.send(self.expire(&intent_id, deadline));
                }
                LaunchMessage::MarkRefunded {
                    intent_id,
                    response,
                } => {
                    let _ = response.send(self.context.ledger.mark_refunded(&intent_id));
                }
                LaunchMessage::Shutdown => break,
            }
        }

        tracing::debug!(launch_id = %self.launch_id, "Launch actor stopped");
    }

    fn ledger(&self) -> &IntentLedger {
        &self.context.ledger
    }

    fn submit(&self, request: IntentRequest) -> Result<SubmitReceipt> {
        request.validate()?;

        if let Some(existing) = self.ledger().find(&request.intent_id)? {
            if existing.matches_request(&request) {
                return Ok(SubmitReceipt {
                    intent_id: existing.id,
                    phase: existing.phase,
                    duplicate: true,
                });
            }
            return Err(Error::DuplicateIntent(request.intent_id));
        }

        let launch = self.ledger().storage().get_launch(&request.launch_id)?;
        match (request.kind, launch) {
            (IntentKind::Create, Some(_)) => {
                return Err(Error::Validation(format!(
                    "launch {} already exists",
                    request.launch_id
                )));
            }
            (IntentKind::Create, None) => {}
            (_, None) => return Err(Error::LaunchNotFound(request.launch_id.to_string())),
            (_, Some(launch)) if launch.is_finalized() => {
                return Err(Error::CapacityExceeded(format!(
                    "launch {} is finalized",
                    launch.id
                )));
            }
            (_, Some(_)) => {}
        }

        let intent = self
            .ledger()
            .create(Intent::from_request(request, Utc::now()))?;
        self.context.metrics.intents_submitted.inc();

        tracing::info!(
            intent_id = %intent.id,
            launch_id = %intent.launch_id,
            kind = ?intent.kind,
            amount_in = intent.amount_in,
            "Intent submitted"
        );

        Ok(SubmitReceipt {
            intent_id: intent.id,
            phase: intent.phase,
            duplicate: false,
        })
    }

    fn confirm(&self, intent_id: &IntentId, confirmations: u32) -> Result<Intent> {
        let intent = self.ledger().get(intent_id)?;
        match intent.phase {
            IntentPhase::Signed if confirmations >= self.context.min_confirmations => {
                let intent = self.ledger().mark_included(intent_id, confirmations)?;
                tracing::info!(
                    intent_id = %intent.id,
                    confirmations,
                    "Funding tx included"
                );
                Ok(intent)
            }
            IntentPhase::Included => self.ledger().mark_included(intent_id, confirmations),
            IntentPhase::Expired => {
                tracing::warn!(
                    intent_id = %intent.id,
                    txid = %intent.btc_txid,
                    "Funding tx confirmed after the intent expired"
                );
                Err(Error::ExpiredIntent(intent.id))
            }
            _ => Ok(intent),
        }
    }

    fn reorg(&self, intent_id: &IntentId) -> Result<Intent> {
        let intent = self.ledger().get(intent_id)?;
        match intent.phase {
            IntentPhase::Included => {
                let intent = self.ledger().mark_reorged(intent_id, Utc::now())?;
                self.context.metrics.reorgs.inc();
                tracing::warn!(intent_id = %intent.id, "Funding tx reorged out, back to SIGNED");
                Ok(intent)
            }
            IntentPhase::Signed | IntentPhase::Expired | IntentPhase::Failed => Ok(intent),
            phase => {
                tracing::warn!(
                    intent_id = %intent.id,
                    phase = phase.as_str(),
                    "Reorg reported after execution started, phase unchanged"
                );
                Err(Error::ChainReorg(format!(
                    "funding tx {} of intent {} reorged while {}",
                    intent.btc_txid,
                    intent.id,
                    phase.as_str()
                )))
            }
        }
    }

    fn expire(&self, intent_id: &IntentId, deadline: DateTime<Utc>) -> Result<bool> {
        let intent = self.ledger().get(intent_id)?;
        if intent.phase != IntentPhase::Signed || intent.signed_at >= deadline {
            return Ok(false);
        }
        self.ledger().expire(intent_id)?;
        self.context.metrics.intents_expired.inc();
        tracing::info!(intent_id = %intent_id, "Intent expired before inclusion");
        Ok(true)
    }

    /// Drive one intent forward. INCLUDED and EXECUTING intents are priced
    /// and executed; REVERTED intents get their refund scheduled; anything
    /// already resting is returned unchanged.
    async fn execute(&self, intent_id: &IntentId) -> Result<Intent> {
        let intent = self.ledger().get(intent_id)?;
        let intent = match intent.phase {
            IntentPhase::Included => self.ledger().advance(intent_id, IntentPhase::Executing)?,
            IntentPhase::Executing => {
                tracing::info!(
                    intent_id = %intent.id,
                    attempts = intent.attempts,
                    "Resuming execution"
                );
                intent
            }
            IntentPhase::Reverted => {
                self.ledger().schedule_refund(intent_id)?;
                return self.ledger().get(intent_id);
            }
            IntentPhase::Signed => {
                return Err(Error::InvalidTransition {
                    intent_id: intent.id,
                    from: IntentPhase::Signed,
                    to: IntentPhase::Executing,
                });
            }
            _ => return Ok(intent),
        };

        let plan = match self.plan(&intent)? {
            Planned::Ready(plan) => plan,
            Planned::Rejected(reason) => return self.revert(&intent, reason),
        };

        loop {
            let attempts = self.ledger().record_attempt(intent_id)?;
            if attempts > self.context.retry.max_attempts() {
                return self.fail(&intent, "execution attempts exhausted".to_string());
            }
            self.context.metrics.execution_attempts.inc();

            let started = Instant::now();
            let outcome = self.context.executor.execute(&plan.request).await;
            self.context
                .metrics
                .record_execution_duration(started.elapsed().as_secs_f64());

            match outcome {
                Ok(receipt) => return self.commit(&intent, *plan, receipt.tx_hash),
                Err(e) if self.context.retry.should_retry(attempts, &e) => {
                    let delay = self.context.retry.delay_for(attempts - 1);
                    tracing::warn!(
                        intent_id = %intent.id,
                        attempt = attempts,
                        max_attempts = self.context.retry.max_attempts(),
                        ?delay,
                        "EVM execution failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return self.fail(&intent, e.to_string()),
            }
        }
    }

    /// Re-price against the current launch state. Economic rejections become
    /// `Planned::Rejected`; infrastructure errors propagate.
    fn plan(&self, intent: &Intent) -> Result<Planned> {
        match self.price(intent) {
            Ok(planned) => Ok(planned),
            Err(e) => match RevertReason::from_error(&e) {
                Some(reason) => Ok(Planned::Rejected(reason)),
                None => Err(e),
            },
        }
    }

    fn price(&self, intent: &Intent) -> Result<Planned> {
        let storage = self.ledger().storage();
        let now = Utc::now();

        if intent.kind == IntentKind::Create {
            if storage.get_launch(&intent.launch_id)?.is_some() {
                return Err(Error::Validation(format!(
                    "launch {} already exists",
                    intent.launch_id
                )));
            }
            let params = intent.launch_params.as_ref().ok_or_else(|| {
                Error::Validation("CREATE intent without launch parameters".to_string())
            })?;
            let launch = Launch::from_params(intent.launch_id.clone(), params, now);
            return Ok(Planned::Ready(Box::new(ExecutionPlan {
                request: ExecutionRequest {
                    intent_id: intent.id.clone(),
                    launch_id: intent.launch_id.clone(),
                    kind: IntentKind::Create,
                    token_address: params.token_address.clone(),
                    btc_amount: to_sats(intent.amount_in)?,
                    token_amount: 0,
                },
                launch,
                fill: None,
                finalizes: false,
            })));
        }

        let mut launch = storage
            .get_launch(&intent.launch_id)?
            .ok_or_else(|| Error::LaunchNotFound(intent.launch_id.to_string()))?;
        if launch.is_finalized() {
            return Err(Error::CapacityExceeded(format!(
                "launch {} is finalized",
                launch.id
            )));
        }
        let curve = PricingCurve::new(launch.curve)?;

        let fill = match intent.kind {
            IntentKind::Buy => {
                let quote = curve.quote_buy(launch.current_supply, to_sats(intent.amount_in)?)?;
                if quote.tokens_out == 0 {
                    return Ok(Planned::Rejected(RevertReason::BelowMinimumPurchase));
                }
                // Never partially fill against the cap
                if quote.capped {
                    return Err(Error::CapacityExceeded(format!(
                        "buy of {} sats overshoots cap {} at supply {}",
                        quote.cost_sats + quote.unspent_sats,
                        launch.curve.supply_cap,
                        launch.current_supply
                    )));
                }
                match intent.bound {
                    Some(SlippageBound::MinTokensOut(min)) if quote.tokens_out < min => {
                        return Err(Error::SlippageExceeded {
                            bound: min,
                            actual: quote.tokens_out,
                        });
                    }
                    Some(SlippageBound::MaxBtcIn(max)) if quote.cost_sats > max => {
                        return Err(Error::SlippageExceeded {
                            bound: u128::from(max),
                            actual: u128::from(quote.cost_sats),
                        });
                    }
                    _ => {}
                }
                TradeFill {
                    trade_type: TradeType::Buy,
                    btc_amount: quote.cost_sats,
                    token_amount: quote.tokens_out,
                    new_supply: quote.new_supply,
                    new_price: quote.new_price,
                    fees: split_fee(quote.cost_sats, launch.creator_fee_rate_bps),
                    unspent_sats: quote.unspent_sats,
                    tx_hash: String::new(),
                }
            }
            IntentKind::Sell => {
                let quote = curve.quote_sell(launch.current_supply, intent.amount_in)?;
                if let Some(SlippageBound::MinBtcOut(min)) = intent.bound {
                    if quote.proceeds_sats < min {
                        return Err(Error::SlippageExceeded {
                            bound: u128::from(min),
                            actual: u128::from(quote.proceeds_sats),
                        });
                    }
                }
                TradeFill {
                    trade_type: TradeType::Sell,
                    btc_amount: quote.proceeds_sats,
                    token_amount: quote.tokens_in,
                    new_supply: quote.new_supply,
                    new_price: quote.new_price,
                    fees: split_fee(quote.proceeds_sats, launch.creator_fee_rate_bps),
                    unspent_sats: 0,
                    tx_hash: String::new(),
                }
            }
            IntentKind::Create => {
                return Err(Error::Validation("CREATE priced as a trade".to_string()));
            }
        };

        let finalizes = launch.apply_supply(fill.new_supply, now)?;

        Ok(Planned::Ready(Box::new(ExecutionPlan {
            request: ExecutionRequest {
                intent_id: intent.id.clone(),
                launch_id: intent.launch_id.clone(),
                kind: intent.kind,
                token_address: launch.token_address.clone(),
                btc_amount: fill.btc_amount,
                token_amount: fill.token_amount,
            },
            launch,
            fill: Some(fill),
            finalizes,
        })))
    }

    fn commit(&self, intent: &Intent, plan: ExecutionPlan, tx_hash: String) -> Result<Intent> {
        let fill = plan.fill.map(|fill| TradeFill { tx_hash, ..fill });
        let result = self.ledger().commit(&intent.id, &plan.launch, fill)?;
        self.context.metrics.intents_committed.inc();

        match &result {
            CommitResult::Trade(purchase) => {
                self.context
                    .publisher
                    .publish(DomainEvent::from_purchase(purchase));
                if plan.finalizes {
                    self.context.metrics.launches_finalized.inc();
                    tracing::info!(
                        launch_id = %plan.launch.id,
                        final_supply = plan.launch.current_supply,
                        "Launch finalized"
                    );
                    self.context.publisher.publish(DomainEvent::LaunchFinalized {
                        launch_id: plan.launch.id.clone(),
                        final_supply: plan.launch.current_supply,
                    });
                }
            }
            CommitResult::LaunchCreated(launch) => {
                self.context.publisher.publish(DomainEvent::LaunchCreated {
                    launch_id: launch.id.clone(),
                    token_address: launch.token_address.clone(),
                    curve_params: launch.curve,
                });
            }
        }

        self.ledger().get(&intent.id)
    }

    fn revert(&self, intent: &Intent, reason: RevertReason) -> Result<Intent> {
        tracing::warn!(
            intent_id = %intent.id,
            launch_id = %intent.launch_id,
            %reason,
            "Intent reverted"
        );
        self.ledger().revert(&intent.id, reason.clone())?;
        self.context.metrics.intents_reverted.inc();
        self.context.publisher.publish(DomainEvent::IntentReverted {
            launch_id: intent.launch_id.clone(),
            intent_id: intent.id.clone(),
            reason: reason.to_string(),
        });

        self.ledger().schedule_refund(&intent.id)?;
        self.ledger().get(&intent.id)
    }

    fn fail(&self, intent: &Intent, reason: String) -> Result<Intent> {
        tracing::error!(
            intent_id = %intent.id,
            launch_id = %intent.launch_id,
            "Intent failed: {}",
            reason
        );
        let failed = self.ledger().fail(&intent.id, reason.clone())?;
        self.context.metrics.intents_failed.inc();
        self.context.publisher.publish(DomainEvent::IntentFailed {
            launch_id: intent.launch_id.clone(),
            intent_id: intent.id.clone(),
            reason,
        });
        Ok(failed)
    }
}

fn to_sats(amount: u128) -> Result<Sats> {
    Sats::try_from(amount)
        .map_err(|_| Error::Validation(format!("BTC amount {} exceeds u64 sats", amount)))
}

/// Handle for sending messages to a launch actor
#[derive(Clone, Debug)]
pub struct LaunchHandle {
    launch_id: LaunchId,
    sender: mpsc::Sender<LaunchMessage>,
}

impl LaunchHandle {
    /// Create new handle
    pub fn new(launch_id: LaunchId, sender: mpsc::Sender<LaunchMessage>) -> Self {
        Self { launch_id, sender }
    }

    /// Launch this actor owns
    pub fn launch_id(&self) -> &LaunchId {
        &self.launch_id
    }

    /// Whether the actor task has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LaunchMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|_| {
            Error::Concurrency(format!("launch {} actor mailbox closed", self.launch_id))
        })?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Record a new intent
    pub async fn submit(&self, request: IntentRequest) -> Result<SubmitReceipt> {
        self.request(|response| LaunchMessage::Submit { request, response })
            .await
    }

    /// Report confirmations of the funding tx
    pub async fn confirmed(&self, intent_id: IntentId, confirmations: u32) -> Result<Intent> {
        self.request(|response| LaunchMessage::Confirmed {
            intent_id,
            confirmations,
            response,
        })
        .await
    }

    /// Report the funding tx reorged out
    pub async fn reorged(&self, intent_id: IntentId) -> Result<Intent> {
        self.request(|response| LaunchMessage::Reorged {
            intent_id,
            response,
        })
        .await
    }

    /// Drive an intent to its next resting phase
    pub async fn execute(&self, intent_id: IntentId) -> Result<Intent> {
        self.request(|response| LaunchMessage::Execute {
            intent_id,
            response,
        })
        .await
    }

    /// Expire the intent if still SIGNED and its window opened before `deadline`
    pub async fn expire(&self, intent_id: IntentId, deadline: DateTime<Utc>) -> Result<bool> {
        self.request(|response| LaunchMessage::Expire {
            intent_id,
            deadline,
            response,
        })
        .await
    }

    /// Record the refund for `intent_id` as paid
    pub async fn mark_refunded(&self, intent_id: IntentId) -> Result<crate::types::Refund> {
        self.request(|response| LaunchMessage::MarkRefunded {
            intent_id,
            response,
        })
        .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LaunchMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the actor for `launch_id`
pub fn spawn_launch_actor(
    launch_id: LaunchId,
    context: Arc<SettlementContext>,
    mailbox_capacity: usize,
) -> LaunchHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let actor = LaunchActor::new(launch_id.clone(), context, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    LaunchHandle::new(launch_id, tx)
}
