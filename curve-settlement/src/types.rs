//! Core types for the settlement core
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (integer sats and token units, no floating point)
//! - Explicit lifecycle phases that are persisted at every boundary

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Decimals of the token's base unit. One curve unit is `10^18` base units.
pub const TOKEN_DECIMALS: u32 = 18;

/// Basis-point denominator for fee rates
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Bitcoin amount in satoshis
pub type Sats = u64;

/// Token amount in whole curve units
pub type TokenUnits = u128;

/// Convert curve units to 18-decimal base units
pub fn to_base_units(units: TokenUnits) -> Option<u128> {
    units.checked_mul(10u128.pow(TOKEN_DECIMALS))
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get as string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Client-chosen intent identifier, carried inside the BTC transaction
    IntentId
);

string_id!(
    /// Launch identifier
    LaunchId
);

string_id!(
    /// Bitcoin transaction id (hex)
    BtcTxid
);

/// Kind of economic request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum IntentKind {
    /// Buy tokens with BTC
    Buy = 1,
    /// Sell tokens for BTC
    Sell = 2,
    /// Create a new launch
    Create = 3,
}

/// Caller-supplied slippage bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlippageBound {
    /// BUY: at least this many tokens
    MinTokensOut(TokenUnits),
    /// BUY: spend at most this many sats
    MaxBtcIn(Sats),
    /// SELL: receive at least this many sats
    MinBtcOut(Sats),
}

impl SlippageBound {
    fn fits(&self, kind: IntentKind) -> bool {
        matches!(
            (self, kind),
            (SlippageBound::MinTokensOut(_), IntentKind::Buy)
                | (SlippageBound::MaxBtcIn(_), IntentKind::Buy)
                | (SlippageBound::MinBtcOut(_), IntentKind::Sell)
        )
    }
}

/// Linear curve parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurveParams {
    /// Price of the first unit (sats)
    pub base_price: Sats,
    /// Price increase per unit of supply (sats)
    pub price_increment: Sats,
    /// Maximum supply (units)
    pub supply_cap: TokenUnits,
}

/// Parameters carried by a CREATE intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    /// Token contract address on the EVM side
    pub token_address: String,
    /// Creator fee recipient
    pub creator: String,
    /// Curve parameters
    pub curve: CurveParams,
    /// Creator fee rate in basis points
    pub creator_fee_rate_bps: u16,
}

/// Launch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LaunchStatus {
    /// Primary market open
    Active = 1,
    /// Supply cap reached (terminal)
    Finalized = 2,
}

/// Per-launch market state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Launch {
    /// Launch ID
    pub id: LaunchId,

    /// Token contract address
    pub token_address: String,

    /// Creator fee recipient
    pub creator: String,

    /// Curve parameters
    pub curve: CurveParams,

    /// Authoritative supply (units)
    pub current_supply: TokenUnits,

    /// Creator fee rate in basis points
    pub creator_fee_rate_bps: u16,

    /// Current status
    pub status: LaunchStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Set once, when the cap is reached
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Launch {
    /// Build the initial state for a committed CREATE intent
    pub fn from_params(id: LaunchId, params: &LaunchParams, now: DateTime<Utc>) -> Self {
        Self {
            id,
            token_address: params.token_address.clone(),
            creator: params.creator.clone(),
            curve: params.curve,
            current_supply: 0,
            creator_fee_rate_bps: params.creator_fee_rate_bps,
            status: LaunchStatus::Active,
            created_at: now,
            finalized_at: None,
        }
    }

    /// Check if the primary market is closed
    pub fn is_finalized(&self) -> bool {
        self.status == LaunchStatus::Finalized
    }

    /// Units still purchasable
    pub fn remaining_capacity(&self) -> TokenUnits {
        self.curve.supply_cap.saturating_sub(self.current_supply)
    }

    /// Apply a new supply. Flips to FINALIZED when the cap is reached and
    /// returns `true` only on that flip.
    pub fn apply_supply(&mut self, new_supply: TokenUnits, now: DateTime<Utc>) -> Result<bool> {
        if self.is_finalized() {
            return Err(Error::CapacityExceeded(format!("launch {} is finalized", self.id)));
        }
        if new_supply > self.curve.supply_cap {
            return Err(Error::CapacityExceeded(format!(
                "supply {} exceeds cap {}",
                new_supply, self.curve.supply_cap
            )));
        }

        self.current_supply = new_supply;
        if new_supply == self.curve.supply_cap {
            self.status = LaunchStatus::Finalized;
            self.finalized_at = Some(now);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Intent lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IntentPhase {
    /// Accepted, BTC tx broadcast but unconfirmed
    Signed = 1,
    /// BTC tx confirmed
    Included = 2,
    /// Re-priced under the launch's single writer
    Executing = 3,
    /// Economic effect applied (terminal)
    Committed = 4,
    /// Bound or cap violated at execution
    Reverted = 5,
    /// Refund handed to the settlement cycle
    RefundPending = 6,
    /// Refund paid (terminal)
    Refunded = 7,
    /// Execution retries exhausted (terminal)
    Failed = 8,
    /// No inclusion within the wait window (terminal)
    Expired = 9,
}

impl IntentPhase {
    /// All phases, in declaration order
    pub const ALL: [IntentPhase; 9] = [
        IntentPhase::Signed,
        IntentPhase::Included,
        IntentPhase::Executing,
        IntentPhase::Committed,
        IntentPhase::Reverted,
        IntentPhase::RefundPending,
        IntentPhase::Refunded,
        IntentPhase::Failed,
        IntentPhase::Expired,
    ];

    /// Check if phase is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentPhase::Committed
                | IntentPhase::Refunded
                | IntentPhase::Failed
                | IntentPhase::Expired
        )
    }

    /// Lifecycle edges. INCLUDED -> SIGNED is the only backward edge (reorg).
    pub fn can_transition_to(&self, next: IntentPhase) -> bool {
        use IntentPhase::*;
        matches!(
            (self, next),
            (Signed, Included)
                | (Signed, Expired)
                | (Signed, Failed)
                | (Included, Executing)
                | (Included, Signed)
                | (Included, Failed)
                | (Executing, Committed)
                | (Executing, Reverted)
                | (Executing, Failed)
                | (Reverted, RefundPending)
                | (RefundPending, Refunded)
        )
    }

    /// Lowercase name for logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentPhase::Signed => "signed",
            IntentPhase::Included => "included",
            IntentPhase::Executing => "executing",
            IntentPhase::Committed => "committed",
            IntentPhase::Reverted => "reverted",
            IntentPhase::RefundPending => "refund_pending",
            IntentPhase::Refunded => "refunded",
            IntentPhase::Failed => "failed",
            IntentPhase::Expired => "expired",
        }
    }
}

/// Direction of a committed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TradeType {
    /// Tokens minted against BTC
    Buy = 1,
    /// Tokens burned for BTC
    Sell = 2,
}

/// Immutable record of a committed trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    /// Record ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Position in the append-only log
    pub sequence: u64,

    /// Launch traded
    pub launch_id: LaunchId,

    /// Intent that produced this record
    pub intent_id: IntentId,

    /// Direction
    pub trade_type: TradeType,

    /// BTC spent (buy) or paid out gross (sell)
    pub btc_amount: Sats,

    /// Units minted (buy) or burned (sell)
    pub token_amount: TokenUnits,

    /// Supply after the trade
    pub new_supply: TokenUnits,

    /// Spot price after the trade
    pub new_price: Sats,

    /// Creator share of `btc_amount`
    pub creator_fee_sats: Sats,

    /// Protocol/reserve share of `btc_amount`
    pub protocol_fee_sats: Sats,

    /// Buy budget not spent, scheduled back to the caller
    pub unspent_sats: Sats,

    /// EVM execution transaction hash
    pub tx_hash: String,

    /// Commit timestamp
    pub timestamp: DateTime<Utc>,
}

/// Result stored on commit and returned verbatim on every later commit call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitResult {
    /// BUY or SELL
    Trade(Purchase),
    /// CREATE
    LaunchCreated(Launch),
}

/// Why an intent was reverted at execution time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertReason {
    /// Re-priced result violated the bound
    SlippageExceeded {
        /// Caller bound
        bound: u128,
        /// Re-priced value
        actual: u128,
    },
    /// Cap reached or launch finalized
    CapacityExceeded(String),
    /// Budget does not cover a single unit at the current price
    BelowMinimumPurchase,
    /// Trade no longer valid against current state
    InvalidAtExecution(String),
}

impl RevertReason {
    /// Classify an execution-time error. `None` means the error is not an
    /// economic rejection and must not revert the intent.
    pub fn from_error(err: &Error) -> Option<Self> {
        match err {
            Error::SlippageExceeded { bound, actual } => Some(RevertReason::SlippageExceeded {
                bound: *bound,
                actual: *actual,
            }),
            Error::CapacityExceeded(msg) => Some(RevertReason::CapacityExceeded(msg.clone())),
            Error::Validation(msg) | Error::LaunchNotFound(msg) => {
                Some(RevertReason::InvalidAtExecution(msg.clone()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertReason::SlippageExceeded { bound, actual } => {
                write!(f, "slippage exceeded (bound {}, actual {})", bound, actual)
            }
            RevertReason::CapacityExceeded(msg) => write!(f, "capacity exceeded: {}", msg),
            RevertReason::BelowMinimumPurchase => write!(f, "amount below price of one unit"),
            RevertReason::InvalidAtExecution(msg) => write!(f, "invalid at execution: {}", msg),
        }
    }
}

/// Final outcome recorded on the intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentOutcome {
    /// Economic effect applied
    Committed(CommitResult),
    /// Rejected at execution, refund scheduled
    Reverted {
        /// Cause
        reason: RevertReason,
    },
    /// Execution retries exhausted
    Failed {
        /// Last execution error
        reason: String,
    },
    /// No inclusion in time
    Expired,
}

/// What a refund returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundAsset {
    /// BTC in sats
    Btc(Sats),
    /// Escrowed tokens
    Tokens(TokenUnits),
}

/// Why a refund exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RefundKind {
    /// Whole intent reverted
    Reverted = 1,
    /// Unspent remainder of a committed buy
    Dust = 2,
}

/// Compensating action handed to the external settlement cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    /// Intent being compensated
    pub intent_id: IntentId,
    /// Launch the intent targeted
    pub launch_id: LaunchId,
    /// Funding transaction
    pub btc_txid: BtcTxid,
    /// Amount returned
    pub asset: RefundAsset,
    /// Cause
    pub kind: RefundKind,
    /// When the refund was scheduled
    pub scheduled_at: DateTime<Utc>,
    /// When the settlement cycle reported it paid
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Refund {
    /// Check if the settlement cycle has paid this refund
    pub fn is_paid(&self) -> bool {
        self.refunded_at.is_some()
    }
}

/// Inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRequest {
    /// Client-chosen id
    pub intent_id: IntentId,
    /// Kind
    pub kind: IntentKind,
    /// Target launch (chosen by the client for CREATE)
    pub launch_id: LaunchId,
    /// Sats for BUY and CREATE, units for SELL
    pub amount_in: u128,
    /// Mandatory for BUY and SELL
    pub bound: Option<SlippageBound>,
    /// BTC transaction carrying the intent id
    pub btc_txid: BtcTxid,
    /// Required for CREATE
    pub launch_params: Option<LaunchParams>,
}

impl IntentRequest {
    /// Stateless checks, run before anything is recorded
    pub fn validate(&self) -> Result<()> {
        if self.intent_id.as_str().is_empty() {
            return Err(Error::Validation("intent id must not be empty".to_string()));
        }
        if self.launch_id.as_str().is_empty() {
            return Err(Error::Validation("launch id must not be empty".to_string()));
        }
        if self.btc_txid.as_str().is_empty() {
            return Err(Error::Validation("btc txid must not be empty".to_string()));
        }

        match self.kind {
            IntentKind::Buy | IntentKind::Sell => {
                if self.amount_in == 0 {
                    return Err(Error::Validation("amount must be positive".to_string()));
                }
                if self.kind == IntentKind::Buy && self.amount_in > Sats::MAX as u128 {
                    return Err(Error::Validation("buy amount exceeds sats range".to_string()));
                }
                let bound = self.bound.ok_or_else(|| {
                    Error::Validation("slippage bound is mandatory for trades".to_string())
                })?;
                if !bound.fits(self.kind) {
                    return Err(Error::Validation(format!(
                        "bound {:?} does not apply to {:?}",
                        bound, self.kind
                    )));
                }
                if self.launch_params.is_some() {
                    return Err(Error::Validation(
                        "launch params only apply to CREATE".to_string(),
                    ));
                }
            }
            IntentKind::Create => {
                if self.bound.is_some() {
                    return Err(Error::Validation("CREATE takes no slippage bound".to_string()));
                }
                if self.amount_in > Sats::MAX as u128 {
                    return Err(Error::Validation("creation fee exceeds sats range".to_string()));
                }
                let params = self.launch_params.as_ref().ok_or_else(|| {
                    Error::Validation("CREATE requires launch params".to_string())
                })?;
                crate::curve::validate_launch_params(params)?;
            }
        }

        Ok(())
    }
}

/// Durable intent record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Intent ID
    pub id: IntentId,

    /// Target launch
    pub launch_id: LaunchId,

    /// Kind
    pub kind: IntentKind,

    /// Sats for BUY and CREATE, units for SELL
    pub amount_in: u128,

    /// Slippage bound
    pub bound: Option<SlippageBound>,

    /// Funding transaction
    pub btc_txid: BtcTxid,

    /// CREATE parameters
    pub launch_params: Option<LaunchParams>,

    /// Current phase
    pub phase: IntentPhase,

    /// Last confirmation count reported by the BTC watcher
    pub confirmations: u32,

    /// EVM execution attempts made so far
    pub attempts: u32,

    /// Terminal outcome
    pub outcome: Option<IntentOutcome>,

    /// Created timestamp (signing time)
    pub created_at: DateTime<Utc>,

    /// Start of the current inclusion window. Equals `created_at` until a
    /// reorg sends the intent back to SIGNED.
    pub signed_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Intent {
    /// Record a validated request in phase SIGNED
    pub fn from_request(request: IntentRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: request.intent_id,
            launch_id: request.launch_id,
            kind: request.kind,
            amount_in: request.amount_in,
            bound: request.bound,
            btc_txid: request.btc_txid,
            launch_params: request.launch_params,
            phase: IntentPhase::Signed,
            confirmations: 0,
            attempts: 0,
            outcome: None,
            created_at: now,
            signed_at: now,
            updated_at: now,
        }
    }

    /// Same economic request as `request`
    pub fn matches_request(&self, request: &IntentRequest) -> bool {
        self.id == request.intent_id
            && self.launch_id == request.launch_id
            && self.kind == request.kind
            && self.amount_in == request.amount_in
            && self.bound == request.bound
            && self.btc_txid == request.btc_txid
            && self.launch_params == request.launch_params
    }

    /// What a full revert returns to the caller
    pub fn refund_asset(&self) -> RefundAsset {
        match self.kind {
            IntentKind::Sell => RefundAsset::Tokens(self.amount_in),
            IntentKind::Buy | IntentKind::Create => RefundAsset::Btc(self.amount_in as Sats),
        }
    }

    /// Committed result, if any
    pub fn commit_result(&self) -> Option<&CommitResult> {
        match &self.outcome {
            Some(IntentOutcome::Committed(result)) => Some(result),
            _ => None,
        }
    }
}

/// Synchronous answer to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Intent ID
    pub intent_id: IntentId,
    /// Phase at the time of the answer
    pub phase: IntentPhase,
    /// The same request was already recorded
    pub duplicate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy_request() -> IntentRequest {
        IntentRequest {
            intent_id: IntentId::new("intent-1"),
            kind: IntentKind::Buy,
            launch_id: LaunchId::new("launch-1"),
            amount_in: 1_000_000,
            bound: Some(SlippageBound::MinTokensOut(10)),
            btc_txid: BtcTxid::new("aa11"),
            launch_params: None,
        }
    }

    fn test_launch() -> Launch {
        let params = LaunchParams {
            token_address: "0xtoken".to_string(),
            creator: "0xcreator".to_string(),
            curve: CurveParams {
                base_price: 50_000,
                price_increment: 100,
                supply_cap: 10,
            },
            creator_fee_rate_bps: 100,
        };
        Launch::from_params(LaunchId::new("launch-1"), &params, Utc::now())
    }

    #[test]
    fn test_phase_transitions() {
        assert!(IntentPhase::Signed.can_transition_to(IntentPhase::Included));
        assert!(IntentPhase::Included.can_transition_to(IntentPhase::Signed));
        assert!(IntentPhase::Reverted.can_transition_to(IntentPhase::RefundPending));

        assert!(!IntentPhase::Executing.can_transition_to(IntentPhase::Included));
        assert!(!IntentPhase::Committed.can_transition_to(IntentPhase::Reverted));
        assert!(!IntentPhase::Signed.can_transition_to(IntentPhase::Committed));
        assert!(!IntentPhase::Expired.can_transition_to(IntentPhase::Included));
    }

    #[test]
    fn test_phase_terminal() {
        let terminal: Vec<_> = IntentPhase::ALL
            .iter()
            .filter(|p| p.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 4);
        assert!(!IntentPhase::RefundPending.is_terminal());
        for phase in IntentPhase::ALL.iter().filter(|p| p.is_terminal()) {
            assert!(IntentPhase::ALL.iter().all(|next| !phase.can_transition_to(*next)));
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(buy_request().validate().is_ok());

        let mut no_bound = buy_request();
        no_bound.bound = None;
        assert!(matches!(no_bound.validate(), Err(Error::Validation(_))));

        let mut wrong_bound = buy_request();
        wrong_bound.bound = Some(SlippageBound::MinBtcOut(1));
        assert!(matches!(wrong_bound.validate(), Err(Error::Validation(_))));

        let mut zero = buy_request();
        zero.amount_in = 0;
        assert!(matches!(zero.validate(), Err(Error::Validation(_))));

        let mut create = buy_request();
        create.kind = IntentKind::Create;
        create.bound = None;
        assert!(matches!(create.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_launch_finalizes_once() {
        let mut launch = test_launch();
        let now = Utc::now();

        assert!(!launch.apply_supply(4, now).unwrap());
        assert_eq!(launch.remaining_capacity(), 6);
        assert!(launch.apply_supply(10, now).unwrap());
        assert!(launch.is_finalized());
        assert_eq!(launch.finalized_at, Some(now));

        assert!(matches!(
            launch.apply_supply(10, now),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_launch_rejects_supply_above_cap() {
        let mut launch = test_launch();
        assert!(matches!(
            launch.apply_supply(11, Utc::now()),
            Err(Error::CapacityExceeded(_))
        ));
        assert_eq!(launch.current_supply, 0);
    }

    #[test]
    fn test_base_units() {
        assert_eq!(to_base_units(19), Some(19_000_000_000_000_000_000));
        assert_eq!(to_base_units(u128::MAX), None);
    }

    #[test]
    fn test_intent_matches_request() {
        let request = buy_request();
        let intent = Intent::from_request(request.clone(), Utc::now());
        assert_eq!(intent.phase, IntentPhase::Signed);
        assert!(intent.matches_request(&request));

        let mut other = request;
        other.amount_in += 1;
        assert!(!intent.matches_request(&other));
    }
}
