//! Curve Settlement Core
//!
//! Turns Bitcoin-funded intents into deterministic token supply changes on a
//! linear bonding curve, with exactly one economic outcome per intent.
//!
//! # Architecture
//!
//! - **Pricing**: Pure integer curve math, 256-bit intermediates, no floats
//! - **Single Writer**: One actor per launch serializes pricing and commits
//! - **Durable Lifecycle**: Every phase boundary is an atomic RocksDB batch
//! - **Idempotency**: Intent ids are committed at most once
//!
//! # Invariants
//!
//! - Supply conservation: `0 ≤ current_supply ≤ supply_cap` for every launch
//! - Finalization: ACTIVE → FINALIZED exactly once, with the capping trade
//! - Fee exactness: creator + protocol shares sum to the committed amount
//! - Append-only: Purchase records are never modified or deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod config;
pub mod coordinator;
pub mod curve;
pub mod error;
pub mod events;
pub mod executor;
pub mod intent_ledger;
pub mod metrics;
pub mod refund;
pub mod storage;
pub mod types;
pub mod watcher;

// Re-exports
pub use config::Config;
pub use coordinator::SettlementCoordinator;
pub use curve::{BuyQuote, FeeSplit, PricingCurve, SellQuote};
pub use error::{Error, Result};
pub use events::{
    BroadcastPublisher, DomainEvent, EventPublisher, FanoutPublisher, TracingPublisher,
};
pub use executor::{DryRunExecutor, EvmExecutor, EvmReceipt, ExecutionRequest};
pub use intent_ledger::IntentLedger;
pub use storage::Storage;
pub use types::{
    BtcTxid, CurveParams, Intent, IntentId, IntentKind, IntentPhase, IntentRequest, Launch,
    LaunchId, LaunchParams, LaunchStatus, Purchase, Refund, SlippageBound, SubmitReceipt,
};
pub use watcher::{BackgroundTasks, BtcEvent};
