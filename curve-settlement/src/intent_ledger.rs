//! Durable intent lifecycle
//!
//! The ledger is the only code that writes intents. Each method loads the
//! current record, checks the lifecycle edge, and persists the new phase
//! together with any records the step produces, in one write batch.
//!
//! Callers are the per-launch actors, so mutations of one launch's intents
//! are already serialized. Creation is the exception: ids and txids are
//! global, so `create` takes a short guard.

use crate::{
    curve::FeeSplit,
    storage::{StateWrite, Storage},
    types::{
        BtcTxid, CommitResult, Intent, IntentId, IntentOutcome, IntentPhase, Launch, LaunchId,
        Purchase, Refund, RefundAsset, RefundKind, RevertReason, Sats, TokenUnits, TradeType,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Economic fill of a trade, before it becomes a Purchase record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeFill {
    /// Direction
    pub trade_type: TradeType,
    /// BTC spent (buy) or released (sell)
    pub btc_amount: Sats,
    /// Units minted or burned
    pub token_amount: TokenUnits,
    /// Supply after the trade
    pub new_supply: TokenUnits,
    /// Spot price after the trade
    pub new_price: Sats,
    /// Creator/protocol split of `btc_amount`
    pub fees: FeeSplit,
    /// Buy budget left over
    pub unspent_sats: Sats,
    /// EVM execution transaction hash
    pub tx_hash: String,
}

/// Durable record of every intent
#[derive(Debug)]
pub struct IntentLedger {
    storage: Arc<Storage>,
    create_guard: Mutex<()>,
}

impl IntentLedger {
    /// Create ledger over an opened store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            create_guard: Mutex::new(()),
        }
    }

    /// Underlying store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Record a new intent in phase SIGNED
    pub fn create(&self, intent: Intent) -> Result<Intent> {
        if intent.phase != IntentPhase::Signed {
            return Err(Error::Validation(format!(
                "new intent must start SIGNED, got {:?}",
                intent.phase
            )));
        }

        let _guard = self.create_guard.lock();

        if self.storage.get_intent(&intent.id)?.is_some() {
            return Err(Error::DuplicateIntent(intent.id));
        }
        if let Some(existing) = self.storage.intent_for_txid(&intent.btc_txid)? {
            return Err(Error::Validation(format!(
                "btc tx {} already funds intent {}",
                intent.btc_txid, existing
            )));
        }

        self.storage.apply(&StateWrite {
            intent: Some((&intent, None)),
            ..Default::default()
        })?;

        tracing::debug!(
            intent_id = %intent.id,
            launch_id = %intent.launch_id,
            kind = ?intent.kind,
            "Intent recorded"
        );

        Ok(intent)
    }

    /// Get intent by ID
    pub fn get(&self, intent_id: &IntentId) -> Result<Intent> {
        self.storage
            .get_intent(intent_id)?
            .ok_or_else(|| Error::IntentNotFound(intent_id.to_string()))
    }

    /// Get intent by ID, if recorded
    pub fn find(&self, intent_id: &IntentId) -> Result<Option<Intent>> {
        self.storage.get_intent(intent_id)
    }

    /// Get the intent funded by a BTC transaction
    pub fn find_by_txid(&self, txid: &BtcTxid) -> Result<Option<Intent>> {
        match self.storage.intent_for_txid(txid)? {
            Some(intent_id) => self.storage.get_intent(&intent_id),
            None => Ok(None),
        }
    }

    /// Intents currently in `phase`
    pub fn list_in_phase(&self, phase: IntentPhase) -> Result<Vec<Intent>> {
        self.storage.intents_in_phase(phase)
    }

    /// Move an intent along one lifecycle edge. Re-advancing to the current
    /// phase is a no-op.
    pub fn advance(&self, intent_id: &IntentId, phase: IntentPhase) -> Result<Intent> {
        let intent = self.get(intent_id)?;
        if intent.phase == phase {
            return Ok(intent);
        }
        self.transition(intent, phase, |_| {})
    }

    /// SIGNED -> INCLUDED with the reported confirmation count
    pub fn mark_included(&self, intent_id: &IntentId, confirmations: u32) -> Result<Intent> {
        let mut intent = self.get(intent_id)?;
        if intent.phase == IntentPhase::Included {
            if confirmations > intent.confirmations {
                let previous = intent.phase;
                intent.confirmations = confirmations;
                intent.updated_at = Utc::now();
                self.persist(&intent, previous)?;
            }
            return Ok(intent);
        }
        self.transition(intent, IntentPhase::Included, |i| i.confirmations = confirmations)
    }

    /// INCLUDED -> SIGNED after the funding tx was reorged out. The
    /// inclusion window restarts at `now`.
    pub fn mark_reorged(&self, intent_id: &IntentId, now: DateTime<Utc>) -> Result<Intent> {
        let intent = self.get(intent_id)?;
        self.transition(intent, IntentPhase::Signed, |i| {
            i.confirmations = 0;
            i.signed_at = now;
        })
    }

    /// Count one EVM execution attempt. Persisted before the attempt is made
    /// so the ceiling survives restarts.
    pub fn record_attempt(&self, intent_id: &IntentId) -> Result<u32> {
        let mut intent = self.get(intent_id)?;
        if intent.phase != IntentPhase::Executing {
            return Err(Error::InvalidTransition {
                intent_id: intent.id,
                from: intent.phase,
                to: IntentPhase::Executing,
            });
        }
        intent.attempts += 1;
        intent.updated_at = Utc::now();
        self.persist(&intent, IntentPhase::Executing)?;
        Ok(intent.attempts)
    }

    /// EXECUTING -> COMMITTED, atomically with the launch state, the purchase
    /// record and any dust refund.
    ///
    /// Calling this again for a committed intent writes nothing and returns
    /// the stored result unchanged.
    pub fn commit(
        &self,
        intent_id: &IntentId,
        launch: &Launch,
        fill: Option<TradeFill>,
    ) -> Result<CommitResult> {
        let mut intent = self.get(intent_id)?;

        if intent.phase == IntentPhase::Committed {
            return intent.commit_result().cloned().ok_or_else(|| {
                Error::Storage(format!("committed intent {} has no result", intent.id))
            });
        }
        self.check_edge(&intent, IntentPhase::Committed)?;

        // Held until the batch is written so the log is visible in order
        let appender = self.storage.purchase_appender();
        let now = Utc::now();
        let purchase = fill.map(|fill| Purchase {
            id: Uuid::now_v7(),
            sequence: appender.sequence(),
            launch_id: intent.launch_id.clone(),
            intent_id: intent.id.clone(),
            trade_type: fill.trade_type,
            btc_amount: fill.btc_amount,
            token_amount: fill.token_amount,
            new_supply: fill.new_supply,
            new_price: fill.new_price,
            creator_fee_sats: fill.fees.creator_sats,
            protocol_fee_sats: fill.fees.protocol_sats,
            unspent_sats: fill.unspent_sats,
            tx_hash: fill.tx_hash,
            timestamp: now,
        });

        let result = match &purchase {
            Some(purchase) => CommitResult::Trade(purchase.clone()),
            None => CommitResult::LaunchCreated(launch.clone()),
        };

        let dust = purchase
            .as_ref()
            .filter(|p| p.unspent_sats > 0)
            .map(|p| Refund {
                intent_id: intent.id.clone(),
                launch_id: intent.launch_id.clone(),
                btc_txid: intent.btc_txid.clone(),
                asset: RefundAsset::Btc(p.unspent_sats),
                kind: RefundKind::Dust,
                scheduled_at: now,
                refunded_at: None,
            });

        let previous = intent.phase;
        intent.phase = IntentPhase::Committed;
        intent.outcome = Some(IntentOutcome::Committed(result.clone()));
        intent.updated_at = now;

        appender.append(&StateWrite {
            intent: Some((&intent, Some(previous))),
            launch: Some(launch),
            purchase: purchase.as_ref(),
            refund: dust.as_ref(),
        })?;

        tracing::info!(
            intent_id = %intent.id,
            launch_id = %intent.launch_id,
            supply = launch.current_supply,
            finalized = launch.is_finalized(),
            "Intent committed"
        );

        Ok(result)
    }

    /// EXECUTING -> REVERTED
    pub fn revert(&self, intent_id: &IntentId, reason: RevertReason) -> Result<Intent> {
        let intent = self.get(intent_id)?;
        self.transition(intent, IntentPhase::Reverted, |i| {
            i.outcome = Some(IntentOutcome::Reverted { reason })
        })
    }

    /// REVERTED -> REFUND_PENDING, writing the refund for the settlement cycle
    pub fn schedule_refund(&self, intent_id: &IntentId) -> Result<Refund> {
        let mut intent = self.get(intent_id)?;
        if intent.phase == IntentPhase::RefundPending {
            return self
                .storage
                .get_refund(&intent.id)?
                .ok_or_else(|| Error::Storage(format!("refund for {} missing", intent.id)));
        }
        self.check_edge(&intent, IntentPhase::RefundPending)?;

        let now = Utc::now();
        let refund = Refund {
            intent_id: intent.id.clone(),
            launch_id: intent.launch_id.clone(),
            btc_txid: intent.btc_txid.clone(),
            asset: intent.refund_asset(),
            kind: RefundKind::Reverted,
            scheduled_at: now,
            refunded_at: None,
        };

        let previous = intent.phase;
        intent.phase = IntentPhase::RefundPending;
        intent.updated_at = now;

        self.storage.apply(&StateWrite {
            intent: Some((&intent, Some(previous))),
            refund: Some(&refund),
            ..Default::default()
        })?;

        Ok(refund)
    }

    /// Record that the settlement cycle paid the refund for `intent_id`.
    /// Reverted intents move REFUND_PENDING -> REFUNDED; dust refunds of
    /// committed intents leave the intent phase alone.
    pub fn mark_refunded(&self, intent_id: &IntentId) -> Result<Refund> {
        let mut refund = self
            .storage
            .get_refund(intent_id)?
            .ok_or_else(|| Error::IntentNotFound(format!("no refund for {}", intent_id)))?;
        if refund.is_paid() {
            return Ok(refund);
        }

        let now = Utc::now();
        refund.refunded_at = Some(now);

        let mut intent = self.get(intent_id)?;
        let previous = intent.phase;
        let intent_write = match refund.kind {
            RefundKind::Reverted => {
                self.check_edge(&intent, IntentPhase::Refunded)?;
                intent.phase = IntentPhase::Refunded;
                intent.updated_at = now;
                Some((&intent, Some(previous)))
            }
            RefundKind::Dust => None,
        };

        self.storage.apply(&StateWrite {
            intent: intent_write,
            refund: Some(&refund),
            ..Default::default()
        })?;

        Ok(refund)
    }

    /// Any non-terminal pre-commit phase -> FAILED
    pub fn fail(&self, intent_id: &IntentId, reason: impl Into<String>) -> Result<Intent> {
        let intent = self.get(intent_id)?;
        let reason = reason.into();
        self.transition(intent, IntentPhase::Failed, |i| {
            i.outcome = Some(IntentOutcome::Failed { reason })
        })
    }

    /// SIGNED -> EXPIRED
    pub fn expire(&self, intent_id: &IntentId) -> Result<Intent> {
        let intent = self.get(intent_id)?;
        self.transition(intent, IntentPhase::Expired, |i| {
            i.outcome = Some(IntentOutcome::Expired)
        })
    }

    /// SIGNED intents whose inclusion window opened before `deadline`
    pub fn signed_before(&self, deadline: DateTime<Utc>) -> Result<Vec<Intent>> {
        Ok(self
            .list_in_phase(IntentPhase::Signed)?
            .into_iter()
            .filter(|i| i.signed_at < deadline)
            .collect())
    }

    /// Launch ids with work waiting in `phase`
    pub fn launches_with(&self, phase: IntentPhase) -> Result<Vec<(LaunchId, IntentId)>> {
        Ok(self
            .list_in_phase(phase)?
            .into_iter()
            .map(|i| (i.launch_id, i.id))
            .collect())
    }

    fn check_edge(&self, intent: &Intent, to: IntentPhase) -> Result<()> {
        if !intent.phase.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                intent_id: intent.id.clone(),
                from: intent.phase,
                to,
            });
        }
        Ok(())
    }

    fn transition(
        &self,
        mut intent: Intent,
        to: IntentPhase,
        update: impl FnOnce(&mut Intent),
    ) -> Result<Intent> {
        self.check_edge(&intent, to)?;

        let previous = intent.phase;
        intent.phase = to;
        intent.updated_at = Utc::now();
        update(&mut intent);
        self.persist(&intent, previous)?;

        tracing::debug!(
            intent_id = %intent.id,
            from = previous.as_str(),
            to = to.as_str(),
            "Intent advanced"
        );

        Ok(intent)
    }

    fn persist(&self, intent: &Intent, previous: IntentPhase) -> Result<()> {
        self.storage.apply(&StateWrite {
            intent: Some((intent, Some(previous))),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::split_fee;
    use crate::types::{CurveParams, IntentKind, IntentRequest, LaunchParams, SlippageBound};
    use crate::Config;
    use tempfile::TempDir;

    fn test_ledger() -> (IntentLedger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let storage = Arc::new(Storage::open(&config).unwrap());
        (IntentLedger::new(storage), temp_dir)
    }

    fn buy_intent(id: &str) -> Intent {
        Intent::from_request(
            IntentRequest {
                intent_id: IntentId::new(id),
                kind: IntentKind::Buy,
                launch_id: LaunchId::new("launch-1"),
                amount_in: 1_000_000,
                bound: Some(SlippageBound::MinTokensOut(1)),
                btc_txid: BtcTxid::new(format!("tx-{}", id)),
                launch_params: None,
            },
            Utc::now(),
        )
    }

    fn test_launch() -> Launch {
        let params = LaunchParams {
            token_address: "0xtoken".to_string(),
            creator: "0xcreator".to_string(),
            curve: CurveParams {
                base_price: 50_000,
                price_increment: 100,
                supply_cap: 5_000_000,
            },
            creator_fee_rate_bps: 100,
        };
        Launch::from_params(LaunchId::new("launch-1"), &params, Utc::now())
    }

    fn test_fill() -> TradeFill {
        TradeFill {
            trade_type: TradeType::Buy,
            btc_amount: 967_100,
            token_amount: 19,
            new_supply: 19,
            new_price: 51_900,
            fees: split_fee(967_100, 100),
            unspent_sats: 32_900,
            tx_hash: "0xfeed".to_string(),
        }
    }

    fn to_executing(ledger: &IntentLedger, id: &IntentId) {
        ledger.mark_included(id, 1).unwrap();
        ledger.advance(id, IntentPhase::Executing).unwrap();
    }

    #[test]
    fn test_create_rejects_duplicate_id() {
        let (ledger, _temp) = test_ledger();
        ledger.create(buy_intent("a")).unwrap();

        let mut again = buy_intent("a");
        again.btc_txid = BtcTxid::new("tx-other");
        assert!(matches!(ledger.create(again), Err(Error::DuplicateIntent(_))));
    }

    #[test]
    fn test_create_rejects_reused_txid() {
        let (ledger, _temp) = test_ledger();
        ledger.create(buy_intent("a")).unwrap();

        let mut other = buy_intent("b");
        other.btc_txid = BtcTxid::new("tx-a");
        assert!(matches!(ledger.create(other), Err(Error::Validation(_))));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let (ledger, _temp) = test_ledger();
        let id = ledger.create(buy_intent("a")).unwrap().id;
        to_executing(&ledger, &id);

        let result = ledger.advance(&id, IntentPhase::Included);
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        assert!(matches!(
            ledger.advance(&id, IntentPhase::Signed),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(ledger.get(&id).unwrap().phase, IntentPhase::Executing);
    }

    #[test]
    fn test_reorg_returns_to_signed() {
        let (ledger, _temp) = test_ledger();
        let id = ledger.create(buy_intent("a")).unwrap().id;

        let included = ledger.mark_included(&id, 2).unwrap();
        assert_eq!(included.confirmations, 2);

        let reorged = ledger.mark_reorged(&id, Utc::now()).unwrap();
        assert_eq!(reorged.phase, IntentPhase::Signed);
        assert_eq!(reorged.confirmations, 0);
        assert_eq!(ledger.list_in_phase(IntentPhase::Signed).unwrap().len(), 1);
    }

    #[test]
    fn test_reorg_restarts_inclusion_window() {
        let (ledger, _temp) = test_ledger();
        let signed = Utc::now() - chrono::Duration::hours(12);
        let mut intent = buy_intent("a");
        intent.created_at = signed;
        intent.signed_at = signed;
        let id = ledger.create(intent).unwrap().id;

        let deadline = Utc::now() - chrono::Duration::hours(6);
        assert_eq!(ledger.signed_before(deadline).unwrap().len(), 1);

        ledger.mark_included(&id, 1).unwrap();
        let reorged = ledger.mark_reorged(&id, Utc::now()).unwrap();
        assert_eq!(reorged.created_at, signed);
        assert!(reorged.signed_at > deadline);
        assert!(ledger.signed_before(deadline).unwrap().is_empty());
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (ledger, _temp) = test_ledger();
        let id = ledger.create(buy_intent("a")).unwrap().id;
        to_executing(&ledger, &id);

        let mut launch = test_launch();
        launch.apply_supply(19, Utc::now()).unwrap();

        let first = ledger.commit(&id, &launch, Some(test_fill())).unwrap();
        let second = ledger.commit(&id, &launch, Some(test_fill())).unwrap();
        assert_eq!(first, second);

        let purchases = ledger.storage().purchases_since(0, 10).unwrap();
        assert_eq!(purchases.len(), 1);
        match first {
            CommitResult::Trade(purchase) => {
                assert_eq!(purchases[0], purchase);
                assert_eq!(purchase.creator_fee_sats + purchase.protocol_fee_sats, 967_100);
            }
            other => panic!("unexpected result {:?}", other),
        }

        let dust = ledger.storage().get_refund(&id).unwrap().unwrap();
        assert_eq!(dust.kind, RefundKind::Dust);
        assert_eq!(dust.asset, RefundAsset::Btc(32_900));
        assert_eq!(ledger.get(&id).unwrap().phase, IntentPhase::Committed);
    }

    #[test]
    fn test_commit_requires_executing() {
        let (ledger, _temp) = test_ledger();
        let id = ledger.create(buy_intent("a")).unwrap().id;
        let result = ledger.commit(&id, &test_launch(), Some(test_fill()));
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        assert!(ledger.storage().purchases_since(0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_revert_then_refund() {
        let (ledger, _temp) = test_ledger();
        let id = ledger.create(buy_intent("a")).unwrap().id;
        to_executing(&ledger, &id);

        let reverted = ledger
            .revert(&id, RevertReason::SlippageExceeded { bound: 20, actual: 19 })
            .unwrap();
        assert_eq!(reverted.phase, IntentPhase::Reverted);

        let refund = ledger.schedule_refund(&id).unwrap();
        assert_eq!(refund.asset, RefundAsset::Btc(1_000_000));
        assert_eq!(ledger.get(&id).unwrap().phase, IntentPhase::RefundPending);
        assert_eq!(ledger.schedule_refund(&id).unwrap(), refund);

        let paid = ledger.mark_refunded(&id).unwrap();
        assert!(paid.is_paid());
        assert_eq!(ledger.get(&id).unwrap().phase, IntentPhase::Refunded);
        assert!(ledger.storage().pending_refunds().unwrap().is_empty());
    }

    #[test]
    fn test_fail_and_expire() {
        let (ledger, _temp) = test_ledger();
        let failed = ledger.create(buy_intent("a")).unwrap().id;
        to_executing(&ledger, &failed);
        assert_eq!(ledger.record_attempt(&failed).unwrap(), 1);
        let intent = ledger.fail(&failed, "rpc down").unwrap();
        assert_eq!(intent.phase, IntentPhase::Failed);
        assert_eq!(intent.attempts, 1);

        let expired = ledger.create(buy_intent("b")).unwrap().id;
        let intent = ledger.expire(&expired).unwrap();
        assert_eq!(intent.outcome, Some(IntentOutcome::Expired));
        assert!(matches!(
            ledger.mark_included(&expired, 1),
            Err(Error::InvalidTransition { .. })
        ));
    }
}
