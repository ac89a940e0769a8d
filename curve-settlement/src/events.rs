//! Domain events and the publish seam
//!
//! Events are a closed set tagged by `kind`. Decoding rejects unknown kinds
//! and missing fields, so consumers match exhaustively.
//!
//! Delivery is fire-and-forget: `publish` returns nothing and the core never
//! waits for a subscriber.

use crate::{
    types::{CurveParams, IntentId, LaunchId, Purchase, Sats, TokenUnits, TradeType},
    Result,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Token amounts travel as decimal strings; JSON numbers lose precision
/// above 2^53 in most consumers.
mod units_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Payload shared by `tokens_purchased` and `tokens_sold`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Launch traded
    pub launch_id: LaunchId,
    /// Intent committed
    pub intent_id: IntentId,
    /// BTC spent or released
    pub btc_amount: Sats,
    /// Units minted or burned
    #[serde(with = "units_as_string")]
    pub token_amount: TokenUnits,
    /// Supply after the trade
    #[serde(with = "units_as_string")]
    pub new_supply: TokenUnits,
    /// Spot price after the trade
    pub new_price: Sats,
}

/// Committed domain event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    /// CREATE committed
    LaunchCreated {
        /// New launch
        launch_id: LaunchId,
        /// Token contract
        token_address: String,
        /// Curve parameters
        curve_params: CurveParams,
    },
    /// BUY committed
    TokensPurchased(TradeEvent),
    /// SELL committed
    TokensSold(TradeEvent),
    /// Supply cap reached
    LaunchFinalized {
        /// Finalized launch
        launch_id: LaunchId,
        /// Supply at finalization
        #[serde(with = "units_as_string")]
        final_supply: TokenUnits,
    },
    /// Intent reverted, refund scheduled
    IntentReverted {
        /// Target launch
        launch_id: LaunchId,
        /// Reverted intent
        intent_id: IntentId,
        /// Human-readable cause
        reason: String,
    },
    /// Execution retries exhausted
    IntentFailed {
        /// Target launch
        launch_id: LaunchId,
        /// Failed intent
        intent_id: IntentId,
        /// Last execution error
        reason: String,
    },
}

impl DomainEvent {
    /// Event for a committed purchase record
    pub fn from_purchase(purchase: &Purchase) -> Self {
        let trade = TradeEvent {
            launch_id: purchase.launch_id.clone(),
            intent_id: purchase.intent_id.clone(),
            btc_amount: purchase.btc_amount,
            token_amount: purchase.token_amount,
            new_supply: purchase.new_supply,
            new_price: purchase.new_price,
        };
        match purchase.trade_type {
            TradeType::Buy => DomainEvent::TokensPurchased(trade),
            TradeType::Sell => DomainEvent::TokensSold(trade),
        }
    }

    /// Tag value
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::LaunchCreated { .. } => "launch_created",
            DomainEvent::TokensPurchased(_) => "tokens_purchased",
            DomainEvent::TokensSold(_) => "tokens_sold",
            DomainEvent::LaunchFinalized { .. } => "launch_finalized",
            DomainEvent::IntentReverted { .. } => "intent_reverted",
            DomainEvent::IntentFailed { .. } => "intent_failed",
        }
    }

    /// Launch the event belongs to
    pub fn launch_id(&self) -> &LaunchId {
        match self {
            DomainEvent::LaunchCreated { launch_id, .. }
            | DomainEvent::LaunchFinalized { launch_id, .. }
            | DomainEvent::IntentReverted { launch_id, .. }
            | DomainEvent::IntentFailed { launch_id, .. } => launch_id,
            DomainEvent::TokensPurchased(trade) | DomainEvent::TokensSold(trade) => {
                &trade.launch_id
            }
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Sink for committed events
pub trait EventPublisher: Send + Sync {
    /// Hand off one event. Must not block and must not fail the caller.
    fn publish(&self, event: DomainEvent);
}

/// In-process fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<DomainEvent>,
}

impl BroadcastPublisher {
    /// Create publisher with bounded history
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// New subscriber; sees events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: DomainEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

/// Writes every event to the log as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: DomainEvent) {
        match event.to_json() {
            Ok(json) => tracing::info!(
                target: "settlement_events",
                kind = event.kind(),
                launch_id = %event.launch_id(),
                payload = %json,
                "Domain event"
            ),
            Err(e) => tracing::warn!(kind = event.kind(), "Failed to encode event: {}", e),
        }
    }
}

/// Publishes to several sinks in order
pub struct FanoutPublisher {
    sinks: Vec<std::sync::Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    /// Create from sinks
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventPublisher>>) -> Self {
        Self { sinks }
    }
}

impl std::fmt::Debug for FanoutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventPublisher for FanoutPublisher {
    fn publish(&self, event: DomainEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trade() -> TradeEvent {
        TradeEvent {
            launch_id: LaunchId::new("launch-1"),
            intent_id: IntentId::new("intent-1"),
            btc_amount: 967_100,
            token_amount: 19,
            new_supply: 19,
            new_price: 51_900,
        }
    }

    #[test]
    fn test_event_tagging() {
        let event = DomainEvent::TokensPurchased(trade());
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["kind"], "tokens_purchased");
        assert_eq!(value["launch_id"], "launch-1");
        assert_eq!(value["token_amount"], "19");
        assert_eq!(value["btc_amount"], 967_100);
    }

    #[test]
    fn test_event_decode() {
        let raw = json!({
            "kind": "launch_finalized",
            "launch_id": "launch-1",
            "final_supply": "5000000"
        });
        let event = DomainEvent::from_json(&raw.to_string()).unwrap();
        assert_eq!(
            event,
            DomainEvent::LaunchFinalized {
                launch_id: LaunchId::new("launch-1"),
                final_supply: 5_000_000,
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_kind_and_missing_fields() {
        let unknown = json!({"kind": "tokens_burned", "launch_id": "x"});
        assert!(DomainEvent::from_json(&unknown.to_string()).is_err());

        let missing = json!({"kind": "tokens_sold", "launch_id": "x"});
        assert!(DomainEvent::from_json(&missing.to_string()).is_err());
    }

    #[tokio::test]
    async fn test_broadcast_publisher() {
        let publisher = BroadcastPublisher::new(16);
        // Publishing without subscribers is silently dropped
        publisher.publish(DomainEvent::TokensSold(trade()));

        let mut rx = publisher.subscribe();
        publisher.publish(DomainEvent::TokensPurchased(trade()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), "tokens_purchased");
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink_in_order() {
        let first = BroadcastPublisher::new(16);
        let second = BroadcastPublisher::new(16);
        let mut rx_first = first.subscribe();
        let mut rx_second = second.subscribe();

        let fanout = FanoutPublisher::new(vec![
            std::sync::Arc::new(first),
            std::sync::Arc::new(TracingPublisher),
            std::sync::Arc::new(second),
        ]);
        fanout.publish(DomainEvent::TokensPurchased(trade()));
        fanout.publish(DomainEvent::LaunchFinalized {
            launch_id: LaunchId::new("launch-1"),
            final_supply: 19,
        });

        for rx in [&mut rx_first, &mut rx_second] {
            assert_eq!(rx.recv().await.unwrap(), DomainEvent::TokensPurchased(trade()));
            assert_eq!(rx.recv().await.unwrap().kind(), "launch_finalized");
        }
    }
}
