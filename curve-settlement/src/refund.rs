//! Refund schedule handed to the external settlement cycle
//!
//! Refunds are never paid here. The coordinator schedules them (reverted
//! intents and buy dust), the settlement cycle pulls a [`RefundBatch`], pays
//! it out of band, and reports each intent back through `mark_refunded`.

use crate::types::{IntentId, LaunchId, Refund, RefundAsset, RefundKind, Sats, TokenUnits};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of unpaid refunds, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundBatch {
    /// Refunds in the batch
    pub refunds: Vec<Refund>,
    /// BTC owed across the batch
    pub btc_total: Sats,
    /// Tokens owed, per launch
    pub tokens_by_launch: BTreeMap<LaunchId, TokenUnits>,
}

impl RefundBatch {
    /// Take up to `limit` unpaid refunds, oldest scheduled first
    pub fn collect(mut pending: Vec<Refund>, limit: usize) -> Self {
        pending.retain(|r| !r.is_paid());
        pending.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.intent_id.cmp(&b.intent_id))
        });
        pending.truncate(limit);

        let mut batch = RefundBatch::default();
        for refund in pending {
            match refund.asset {
                RefundAsset::Btc(sats) => batch.btc_total = batch.btc_total.saturating_add(sats),
                RefundAsset::Tokens(units) => {
                    let owed = batch
                        .tokens_by_launch
                        .entry(refund.launch_id.clone())
                        .or_insert(0);
                    *owed = owed.saturating_add(units);
                }
            }
            batch.refunds.push(refund);
        }
        batch
    }

    /// Nothing to pay
    pub fn is_empty(&self) -> bool {
        self.refunds.is_empty()
    }

    /// Number of refunds
    pub fn len(&self) -> usize {
        self.refunds.len()
    }

    /// Intent ids to report back once paid
    pub fn intent_ids(&self) -> Vec<IntentId> {
        self.refunds.iter().map(|r| r.intent_id.clone()).collect()
    }

    /// Refunds of reverted intents (full amount back)
    pub fn reverted(&self) -> impl Iterator<Item = &Refund> {
        self.refunds
            .iter()
            .filter(|r| r.kind == RefundKind::Reverted)
    }

    /// Unspent remainders of committed buys
    pub fn dust(&self) -> impl Iterator<Item = &Refund> {
        self.refunds.iter().filter(|r| r.kind == RefundKind::Dust)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BtcTxid;
    use chrono::{Duration, Utc};

    fn refund(id: &str, asset: RefundAsset, kind: RefundKind, age_secs: i64) -> Refund {
        Refund {
            intent_id: IntentId::new(id),
            launch_id: LaunchId::new("launch-1"),
            btc_txid: BtcTxid::new(format!("tx-{}", id)),
            asset,
            kind,
            scheduled_at: Utc::now() - Duration::seconds(age_secs),
            refunded_at: None,
        }
    }

    #[test]
    fn test_collect_orders_and_totals() {
        let pending = vec![
            refund("b", RefundAsset::Btc(32_900), RefundKind::Dust, 10),
            refund("a", RefundAsset::Btc(1_000_000), RefundKind::Reverted, 20),
            refund("c", RefundAsset::Tokens(5), RefundKind::Reverted, 5),
        ];

        let batch = RefundBatch::collect(pending, 10);

        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.intent_ids(),
            vec![IntentId::new("a"), IntentId::new("b"), IntentId::new("c")]
        );
        assert_eq!(batch.btc_total, 1_032_900);
        assert_eq!(batch.tokens_by_launch[&LaunchId::new("launch-1")], 5);
        assert_eq!(batch.reverted().count(), 2);
        assert_eq!(batch.dust().count(), 1);
    }

    #[test]
    fn test_collect_respects_limit_and_skips_paid() {
        let mut paid = refund("p", RefundAsset::Btc(1), RefundKind::Dust, 100);
        paid.refunded_at = Some(Utc::now());
        let pending = vec![
            paid,
            refund("a", RefundAsset::Btc(10), RefundKind::Reverted, 50),
            refund("b", RefundAsset::Btc(20), RefundKind::Reverted, 40),
        ];

        let batch = RefundBatch::collect(pending, 1);
        assert_eq!(batch.intent_ids(), vec![IntentId::new("a")]);
        assert_eq!(batch.btc_total, 10);

        assert!(RefundBatch::collect(Vec::new(), 5).is_empty());
    }
}
