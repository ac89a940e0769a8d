//! Linear bonding curve pricing
//!
//! `price(s) = base_price + price_increment * s`, in sats per whole unit.
//! Buying `d` units starting at supply `s0` costs the discrete integral
//!
//! ```text
//! cost(s0, d) = base_price * d + price_increment * (s0 * d + d * (d - 1) / 2)
//! ```
//!
//! Every path here is integer-only. Intermediates are widened to 256 bits so
//! that squaring the discriminant cannot overflow.
//!
//! # Example
//!
//! ```
//! use curve_settlement::curve::PricingCurve;
//! use curve_settlement::types::CurveParams;
//!
//! let curve = PricingCurve::new(CurveParams {
//!     base_price: 50_000,
//!     price_increment: 100,
//!     supply_cap: 5_000_000,
//! })
//! .unwrap();
//!
//! let quote = curve.quote_buy(0, 1_000_000).unwrap();
//! assert_eq!(quote.tokens_out, 19);
//! assert_eq!(quote.cost_sats, 967_100);
//! assert_eq!(quote.unspent_sats, 32_900);
//! ```

use crate::{
    types::{CurveParams, LaunchParams, Sats, TokenUnits, BPS_DENOMINATOR},
    Error, Result,
};
use serde::{Deserialize, Serialize};

// Expanded in its own module so the macro's `Result<T, E>` does not resolve
// to the crate's single-parameter `Result` alias.
mod wide {
    uint::construct_uint! {
        /// 256-bit unsigned integer for curve intermediates
        pub struct U256(4);
    }
}
pub use wide::U256;

/// Result of pricing a buy against a given supply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyQuote {
    /// Units purchased
    pub tokens_out: TokenUnits,
    /// Sats consumed by the curve
    pub cost_sats: Sats,
    /// Budget left over, owed back to the caller
    pub unspent_sats: Sats,
    /// Supply after the buy
    pub new_supply: TokenUnits,
    /// Spot price after the buy
    pub new_price: Sats,
    /// The budget affords more than the remaining capacity; `tokens_out`
    /// is the remaining capacity
    pub capped: bool,
}

/// Result of pricing a sell against a given supply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellQuote {
    /// Units burned
    pub tokens_in: TokenUnits,
    /// Gross sats released by the curve
    pub proceeds_sats: Sats,
    /// Supply after the sell
    pub new_supply: TokenUnits,
    /// Spot price after the sell
    pub new_price: Sats,
}

/// Creator/protocol split of a committed BTC amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    /// Creator share (floored)
    pub creator_sats: Sats,
    /// Protocol/reserve share, including the rounding remainder
    pub protocol_sats: Sats,
}

/// Split `amount` at `rate_bps`. The creator share is floored and the
/// remainder always accrues to the protocol side.
pub fn split_fee(amount: Sats, rate_bps: u16) -> FeeSplit {
    let rate = u128::from(rate_bps.min(BPS_DENOMINATOR as u16));
    let creator = u128::from(amount) * rate / u128::from(BPS_DENOMINATOR);
    let creator_sats = creator as Sats;
    FeeSplit {
        creator_sats,
        protocol_sats: amount - creator_sats,
    }
}

/// Check CREATE parameters
pub fn validate_launch_params(params: &LaunchParams) -> Result<()> {
    if params.token_address.is_empty() {
        return Err(Error::Validation("token address must not be empty".to_string()));
    }
    if params.creator.is_empty() {
        return Err(Error::Validation("creator must not be empty".to_string()));
    }
    if u64::from(params.creator_fee_rate_bps) > BPS_DENOMINATOR {
        return Err(Error::Validation(format!(
            "creator fee rate {} bps exceeds {}",
            params.creator_fee_rate_bps, BPS_DENOMINATOR
        )));
    }
    PricingCurve::new(params.curve).map(|_| ())
}

/// Pure pricing functions over one set of curve parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingCurve {
    params: CurveParams,
}

impl PricingCurve {
    /// Validate parameters and build the curve
    pub fn new(params: CurveParams) -> Result<Self> {
        if params.base_price == 0 {
            return Err(Error::Validation("base price must be positive".to_string()));
        }
        if params.supply_cap == 0 {
            return Err(Error::Validation("supply cap must be positive".to_string()));
        }

        let curve = Self { params };
        // The spot price at the cap must be representable
        curve.current_price(params.supply_cap)?;
        Ok(curve)
    }

    /// Curve parameters
    pub fn params(&self) -> &CurveParams {
        &self.params
    }

    /// Spot price at `supply`
    pub fn current_price(&self, supply: TokenUnits) -> Result<Sats> {
        let price = U256::from(self.params.price_increment)
            .checked_mul(U256::from(supply))
            .and_then(|p| p.checked_add(U256::from(self.params.base_price)))
            .ok_or_else(overflow)?;
        narrow_sats(price)
    }

    /// Cost of `d` units starting at supply `s0`
    pub fn cost(&self, s0: TokenUnits, d: TokenUnits) -> Result<u128> {
        narrow_u128(self.cost_wide(s0, d)?)
    }

    fn cost_wide(&self, s0: TokenUnits, d: TokenUnits) -> Result<U256> {
        if d == 0 {
            return Ok(U256::zero());
        }
        let d_wide = U256::from(d);
        let base = U256::from(self.params.base_price)
            .checked_mul(d_wide)
            .ok_or_else(overflow)?;

        // d * (d - 1) is always even
        let triangle = d_wide
            .checked_mul(d_wide - U256::one())
            .ok_or_else(overflow)?
            / U256::from(2u8);
        let steps = U256::from(s0)
            .checked_mul(d_wide)
            .and_then(|v| v.checked_add(triangle))
            .ok_or_else(overflow)?;
        let increment = U256::from(self.params.price_increment)
            .checked_mul(steps)
            .ok_or_else(overflow)?;

        base.checked_add(increment).ok_or_else(overflow)
    }

    /// Largest `d` with `cost(s0, d) <= budget`, ignoring the cap
    pub fn max_affordable(&self, s0: TokenUnits, budget: Sats) -> Result<TokenUnits> {
        let budget_wide = U256::from(budget);
        let base = U256::from(self.params.base_price);
        let inc = U256::from(self.params.price_increment);

        let mut d = if inc.is_zero() {
            budget_wide / base
        } else {
            // 2 * cost(d) = inc * d^2 + (2 * base + 2 * inc * s0 - inc) * d
            let two = U256::from(2u8);
            let linear = inc
                .checked_mul(U256::from(s0))
                .and_then(|v| v.checked_add(base))
                .and_then(|v| v.checked_mul(two))
                .ok_or_else(overflow)?;
            let (b_abs, b_negative) = if linear >= inc {
                (linear - inc, false)
            } else {
                (inc - linear, true)
            };
            let discriminant = b_abs
                .checked_mul(b_abs)
                .and_then(|sq| {
                    inc.checked_mul(budget_wide)
                        .and_then(|v| v.checked_mul(U256::from(8u8)))
                        .and_then(|v| sq.checked_add(v))
                })
                .ok_or_else(overflow)?;
            let root = discriminant.integer_sqrt();
            let numerator = if b_negative {
                b_abs.checked_add(root).ok_or_else(overflow)?
            } else {
                root - b_abs
            };
            numerator / (inc * two)
        };

        // Floor of the square root can land one step off either way
        while self.cost_wide(s0, narrow_u128(d + U256::one())?)? <= budget_wide {
            d = d + U256::one();
        }
        while !d.is_zero() && self.cost_wide(s0, narrow_u128(d)?)? > budget_wide {
            d = d - U256::one();
        }

        narrow_u128(d)
    }

    /// Price a buy of `amount_in` sats at supply `s0`.
    ///
    /// A budget too small for one unit yields `tokens_out == 0`. A budget
    /// that affords more than the remaining capacity is quoted at the
    /// remaining capacity with `capped` set, so the caller can reject it.
    /// At the cap the buy fails with `CapacityExceeded`.
    pub fn quote_buy(&self, s0: TokenUnits, amount_in: Sats) -> Result<BuyQuote> {
        let cap = self.params.supply_cap;
        if s0 > cap {
            return Err(Error::Validation(format!(
                "supply {} above cap {}",
                s0, cap
            )));
        }
        if s0 == cap {
            return Err(Error::CapacityExceeded(format!(
                "supply cap {} reached",
                cap
            )));
        }

        let affordable = self.max_affordable(s0, amount_in)?;
        let remaining = cap - s0;
        let (tokens_out, capped) = if affordable > remaining {
            (remaining, true)
        } else {
            (affordable, false)
        };

        let cost_sats = narrow_sats(self.cost_wide(s0, tokens_out)?)?;
        let new_supply = s0 + tokens_out;

        Ok(BuyQuote {
            tokens_out,
            cost_sats,
            unspent_sats: amount_in - cost_sats,
            new_supply,
            new_price: self.current_price(new_supply)?,
            capped,
        })
    }

    /// Price a sell of `tokens_in` units at supply `s0`
    pub fn quote_sell(&self, s0: TokenUnits, tokens_in: TokenUnits) -> Result<SellQuote> {
        if tokens_in == 0 {
            return Err(Error::Validation("sell amount must be positive".to_string()));
        }
        if tokens_in > s0 {
            return Err(Error::Validation(format!(
                "sell of {} exceeds supply {}",
                tokens_in, s0
            )));
        }

        let new_supply = s0 - tokens_in;
        let proceeds_sats = narrow_sats(self.cost_wide(new_supply, tokens_in)?)?;

        Ok(SellQuote {
            tokens_in,
            proceeds_sats,
            new_supply,
            new_price: self.current_price(new_supply)?,
        })
    }
}

fn overflow() -> Error {
    Error::Validation("curve arithmetic overflow".to_string())
}

fn narrow_u128(value: U256) -> Result<u128> {
    if value.bits() > 128 {
        return Err(overflow());
    }
    Ok(value.low_u128())
}

fn narrow_sats(value: U256) -> Result<Sats> {
    if value.bits() > 64 {
        return Err(Error::Validation(
            "amount exceeds sats range".to_string(),
        ));
    }
    Ok(value.low_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_curve() -> PricingCurve {
        PricingCurve::new(CurveParams {
            base_price: 50_000,
            price_increment: 100,
            supply_cap: 5_000_000,
        })
        .unwrap()
    }

    #[test]
    fn test_current_price() {
        let curve = test_curve();
        assert_eq!(curve.current_price(0).unwrap(), 50_000);
        assert_eq!(curve.current_price(10).unwrap(), 51_000);
    }

    #[test]
    fn test_cost_matches_price_sum() {
        let curve = test_curve();
        let s0 = 37;
        let summed: u128 = (s0..s0 + 25)
            .map(|s| u128::from(curve.current_price(s).unwrap()))
            .sum();
        assert_eq!(curve.cost(s0, 25).unwrap(), summed);
        assert_eq!(curve.cost(s0, 0).unwrap(), 0);
    }

    #[test]
    fn test_reference_buy_is_deterministic() {
        let curve = test_curve();
        let first = curve.quote_buy(0, 1_000_000).unwrap();
        for _ in 0..10 {
            assert_eq!(curve.quote_buy(0, 1_000_000).unwrap(), first);
        }

        assert_eq!(first.tokens_out, 19);
        assert_eq!(first.cost_sats, 967_100);
        assert_eq!(first.unspent_sats, 32_900);
        assert_eq!(first.new_supply, 19);
        assert_eq!(first.new_price, 51_900);
        assert!(!first.capped);
    }

    #[test]
    fn test_buy_brackets_budget() {
        let curve = test_curve();
        for budget in [1u64, 49_999, 50_000, 100_099, 100_100, 7_777_777, 123_456_789] {
            let quote = curve.quote_buy(1_234, budget).unwrap();
            let d = quote.tokens_out;
            assert!(curve.cost(1_234, d).unwrap() <= u128::from(budget));
            assert!(curve.cost(1_234, d + 1).unwrap() > u128::from(budget));
        }
    }

    #[test]
    fn test_budget_below_one_unit() {
        let curve = test_curve();
        let quote = curve.quote_buy(0, 49_999).unwrap();
        assert_eq!(quote.tokens_out, 0);
        assert_eq!(quote.unspent_sats, 49_999);
    }

    #[test]
    fn test_steep_curve_negative_linear_term() {
        // increment > 2 * base makes the linear coefficient negative at s0 = 0
        let curve = PricingCurve::new(CurveParams {
            base_price: 1,
            price_increment: 1_000,
            supply_cap: 1_000_000,
        })
        .unwrap();

        let quote = curve.quote_buy(0, 1_000_000).unwrap();
        let d = quote.tokens_out;
        assert!(curve.cost(0, d).unwrap() <= 1_000_000);
        assert!(curve.cost(0, d + 1).unwrap() > 1_000_000);
    }

    #[test]
    fn test_flat_curve() {
        let curve = PricingCurve::new(CurveParams {
            base_price: 1_000,
            price_increment: 0,
            supply_cap: 1_000,
        })
        .unwrap();

        let quote = curve.quote_buy(0, 10_500).unwrap();
        assert_eq!(quote.tokens_out, 10);
        assert_eq!(quote.unspent_sats, 500);
    }

    #[test]
    fn test_quote_flags_cap_overshoot() {
        let curve = PricingCurve::new(CurveParams {
            base_price: 100,
            price_increment: 1,
            supply_cap: 10,
        })
        .unwrap();

        let quote = curve.quote_buy(7, 1_000_000).unwrap();
        assert!(quote.capped);
        assert_eq!(quote.tokens_out, 3);
        assert_eq!(quote.new_supply, 10);
        assert_eq!(quote.cost_sats, 107 + 108 + 109);
        assert_eq!(quote.unspent_sats, 1_000_000 - 324);
    }

    #[test]
    fn test_buy_at_cap_rejected() {
        let curve = PricingCurve::new(CurveParams {
            base_price: 100,
            price_increment: 1,
            supply_cap: 10,
        })
        .unwrap();

        assert!(matches!(
            curve.quote_buy(10, 1_000_000),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_sell_mirrors_buy() {
        let curve = test_curve();
        let buy = curve.quote_buy(500, 10_000_000).unwrap();
        let sell = curve.quote_sell(buy.new_supply, buy.tokens_out).unwrap();

        assert_eq!(sell.proceeds_sats, buy.cost_sats);
        assert_eq!(sell.new_supply, 500);
        assert_eq!(sell.new_price, curve.current_price(500).unwrap());
    }

    #[test]
    fn test_sell_exceeding_supply() {
        let curve = test_curve();
        assert!(matches!(curve.quote_sell(5, 6), Err(Error::Validation(_))));
        assert!(matches!(curve.quote_sell(5, 0), Err(Error::Validation(_))));
    }

    #[test]
    fn test_fee_split_reference() {
        let split = split_fee(1_000_000, 100);
        assert_eq!(split.creator_sats, 10_000);
        assert_eq!(split.protocol_sats, 990_000);
    }

    #[test]
    fn test_fee_split_remainder_to_protocol() {
        let split = split_fee(999, 150);
        // 999 * 150 / 10000 = 14.985
        assert_eq!(split.creator_sats, 14);
        assert_eq!(split.protocol_sats, 985);
        assert_eq!(split.creator_sats + split.protocol_sats, 999);
    }

    #[test]
    fn test_invalid_params() {
        let zero_base = CurveParams {
            base_price: 0,
            price_increment: 1,
            supply_cap: 10,
        };
        assert!(PricingCurve::new(zero_base).is_err());

        let price_overflow = CurveParams {
            base_price: 1,
            price_increment: u64::MAX,
            supply_cap: 2,
        };
        assert!(PricingCurve::new(price_overflow).is_err());
    }
}
