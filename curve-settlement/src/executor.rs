//! EVM execution seam and retry policy
//!
//! The coordinator never talks to a chain directly. It hands an
//! [`ExecutionRequest`] to an [`EvmExecutor`] and retries transient failures
//! with bounded exponential backoff. Implementations must be idempotent by
//! intent id: a request replayed after a crash returns the original receipt.

use crate::{
    config::RetryConfig,
    types::{IntentId, IntentKind, LaunchId, Sats, TokenUnits},
    Error, Result,
};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Work handed to the EVM side for one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Idempotency key
    pub intent_id: IntentId,
    /// Target launch
    pub launch_id: LaunchId,
    /// BUY mints, SELL burns, CREATE deploys
    pub kind: IntentKind,
    /// Token contract
    pub token_address: String,
    /// BTC side of the trade (cost, proceeds or creation fee)
    pub btc_amount: Sats,
    /// Units minted or burned; zero for CREATE
    pub token_amount: TokenUnits,
}

/// Receipt of a successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmReceipt {
    /// EVM transaction hash
    pub tx_hash: String,
}

/// EVM execution backend
#[async_trait]
pub trait EvmExecutor: Send + Sync {
    /// Execute or replay the request.
    ///
    /// Transient faults should surface as [`Error::ExecutionFailure`] so the
    /// caller retries them.
    async fn execute(&self, request: &ExecutionRequest) -> Result<EvmReceipt>;
}

/// Executor for local runs: derives a stable tx hash from the intent id
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    /// Hash that [`DryRunExecutor::execute`] returns for `intent_id`
    pub fn tx_hash_for(intent_id: &IntentId) -> String {
        format!("0x{}", blake3::hash(intent_id.as_str().as_bytes()).to_hex())
    }
}

#[async_trait]
impl EvmExecutor for DryRunExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<EvmReceipt> {
        tracing::debug!(
            intent_id = %request.intent_id,
            launch_id = %request.launch_id,
            kind = ?request.kind,
            "Dry-run execution"
        );
        Ok(EvmReceipt {
            tx_hash: Self::tx_hash_for(&request.intent_id),
        })
    }
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ms: u64,
}

impl RetryPolicy {
    /// Build from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms.max(config.initial_delay_ms),
            jitter_ms: config.jitter_ms,
        }
    }

    /// Total attempts allowed per intent, across restarts
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay before retry number `retry`, with random jitter added
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.base_delay(retry) + Duration::from_millis(jitter)
    }

    /// Whether another attempt is allowed after `attempts_made` failed with `err`
    pub fn should_retry(&self, attempts_made: u32, err: &Error) -> bool {
        err.is_transient() && attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_attempts,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter_ms: 0,
        })
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = no_jitter(5);
        assert_eq!(policy.base_delay(0).as_millis(), 1000);
        assert_eq!(policy.base_delay(1).as_millis(), 2000);
        assert_eq!(policy.base_delay(2).as_millis(), 4000);
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = no_jitter(5);
        assert_eq!(policy.base_delay(3).as_millis(), 5000);
        assert_eq!(policy.base_delay(200).as_millis(), 5000);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_ms: 50,
        });
        for _ in 0..32 {
            let delay = policy.delay_for(0).as_millis();
            assert!((100..=150).contains(&delay));
        }
    }

    #[test]
    fn test_should_retry_only_transient() {
        let policy = no_jitter(3);
        let transient = Error::ExecutionFailure("rpc timeout".to_string());
        let economic = Error::CapacityExceeded("cap".to_string());

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &economic));
    }

    #[tokio::test]
    async fn test_dry_run_is_deterministic() {
        let request = ExecutionRequest {
            intent_id: IntentId::new("intent-1"),
            launch_id: LaunchId::new("launch-1"),
            kind: IntentKind::Buy,
            token_address: "0xabc".to_string(),
            btc_amount: 967_100,
            token_amount: 19,
        };

        let first = DryRunExecutor.execute(&request).await.unwrap();
        let second = DryRunExecutor.execute(&request).await.unwrap();

        assert_eq!(first, second);
        assert!(first.tx_hash.starts_with("0x"));
        assert_eq!(first.tx_hash.len(), 66);
    }
}
