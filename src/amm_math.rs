//! # Constant-Product AMM Math
//!
//! Pure, deterministic swap math on `rust_decimal::Decimal`. No state
//! lookups, no side effects beyond tracing; callers supply pool snapshots
//! and are responsible for their freshness.
//!
//! Fault discipline: invalid inputs (drained pools, non-positive amounts)
//! produce sentinel zero results as the quoting contract requires; genuine
//! numeric faults (overflow, bad radicand) are warn-logged at this boundary
//! and also degrade to zero, never surfacing as errors to the scan loop.

use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use tracing::{instrument, warn};

use crate::errors::NumericError;
use crate::types::{DexProtocol, PoolState};

//================================================================================================//
//                                         CONSTANTS                                             //
//================================================================================================//

/// Largest fraction of the smaller input reserve the optimizer will size.
const MAX_RESERVE_FRACTION: Decimal = dec!(0.1);

/// Newton iteration bound for `decimal_sqrt`.
const SQRT_MAX_ITERATIONS: usize = 32;

/// Convergence threshold for `decimal_sqrt`.
const SQRT_EPSILON: Decimal = dec!(0.000001);

/// Static per-swap gas estimates by venue. Rough figures for typical
/// constant-product swaps.
static GAS_ESTIMATES: Lazy<BTreeMap<DexProtocol, u64>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    m.insert(DexProtocol::UniswapV2, 120_000);
    m.insert(DexProtocol::SushiSwap, 120_000);
    m.insert(DexProtocol::PancakeSwap, 110_000);
    m
});

/// Gas estimate for one swap on the given venue.
pub fn estimate_swap_gas(protocol: &DexProtocol) -> u64 {
    GAS_ESTIMATES.get(protocol).copied().unwrap_or(150_000)
}

/// Gas estimate for a two-leg round trip.
pub fn estimate_round_trip_gas(sell: &DexProtocol, buy: &DexProtocol) -> u64 {
    estimate_swap_gas(sell) + estimate_swap_gas(buy)
}

//================================================================================================//
//                                       PUBLIC INTERFACE                                        //
//================================================================================================//

/// Constant-product output for a fee-adjusted input:
/// `out = (in·(1−fee)·reserve_out) / (reserve_in + in·(1−fee))`.
///
/// Returns zero for non-positive input or a drained pool.
pub fn output_for_input(
    amount_in: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
    fee_rate: Decimal,
) -> Decimal {
    if amount_in <= Decimal::ZERO || reserve_in <= Decimal::ZERO || reserve_out <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match try_output_for_input(amount_in, reserve_in, reserve_out, fee_rate) {
        Ok(out) => out,
        Err(e) => {
            warn!(target: "amm_math", error = %e, %amount_in, %reserve_in, %reserve_out, "output calculation degraded to zero");
            Decimal::ZERO
        }
    }
}

/// Output plus the relative price move the trade itself causes.
///
/// `price = reserve_out / reserve_in`; slippage is
/// `|price_after − price_before| / price_before`. Invalid or drained pools
/// report `(0, 1.0)`: full slippage, guaranteed rejection upstream.
pub fn slippage(
    amount_in: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
    fee_rate: Decimal,
) -> (Decimal, Decimal) {
    if amount_in <= Decimal::ZERO || reserve_in <= Decimal::ZERO || reserve_out <= Decimal::ZERO {
        return (Decimal::ZERO, Decimal::ONE);
    }
    match try_slippage(amount_in, reserve_in, reserve_out, fee_rate) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(target: "amm_math", error = %e, %amount_in, %reserve_in, %reserve_out, "slippage calculation degraded to full");
            (Decimal::ZERO, Decimal::ONE)
        }
    }
}

/// Approximate profit-maximizing input for a two-pool arbitrage, in units of
/// the pools' base (input-side) token.
///
/// This is the geometric-mean heuristic
/// `sqrt(k_a · (price_b − price_a) / (price_a · price_b))`, not a verified
/// closed-form optimum; the exact solution solves a quadratic from the two
/// constant-product curves. The result is clamped to 10% of the smaller
/// input reserve, which keeps the heuristic in the region where it
/// under-sizes rather than over-sizes.
///
/// Returns zero when `price_b ≤ price_a` (no arbitrage direction), when
/// either pool is drained, or on any numeric failure.
#[instrument(skip_all, fields(buy_pool = ?pool_a.pool, sell_pool = ?pool_b.pool))]
pub fn optimal_input(pool_a: &PoolState, pool_b: &PoolState) -> Decimal {
    let (price_a, price_b) = match (pool_a.spot_price(), pool_b.spot_price()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Decimal::ZERO,
    };
    if price_b <= price_a {
        return Decimal::ZERO;
    }
    match try_optimal_input(pool_a, pool_b, price_a, price_b) {
        Ok(amount) => amount,
        Err(e) => {
            warn!(target: "amm_math", error = %e, "optimal input calculation degraded to zero");
            Decimal::ZERO
        }
    }
}

/// Newton's-method square root. Errors on a negative radicand; zero maps to
/// zero.
pub fn decimal_sqrt(value: Decimal) -> Result<Decimal, NumericError> {
    if value < Decimal::ZERO {
        return Err(NumericError::NegativeRadicand("decimal_sqrt"));
    }
    if value.is_zero() {
        return Ok(Decimal::ZERO);
    }

    // Start above max(1, value/2) so the iterate never touches zero.
    let mut x = (value + Decimal::ONE) / Decimal::TWO;
    for _ in 0..SQRT_MAX_ITERATIONS {
        let quotient = value
            .checked_div(x)
            .ok_or(NumericError::DivisionByZero("decimal_sqrt"))?;
        let next = (x + quotient) / Decimal::TWO;
        if (next - x).abs() < SQRT_EPSILON {
            return Ok(next);
        }
        x = next;
    }
    Ok(x)
}

//================================================================================================//
//                                          INTERNALS                                            //
//================================================================================================//

fn try_output_for_input(
    amount_in: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
    fee_rate: Decimal,
) -> Result<Decimal, NumericError> {
    let amount_in_with_fee = amount_in
        .checked_mul(Decimal::ONE - fee_rate)
        .ok_or(NumericError::Overflow("fee adjustment"))?;
    let numerator = amount_in_with_fee
        .checked_mul(reserve_out)
        .ok_or(NumericError::Overflow("output numerator"))?;
    let denominator = reserve_in
        .checked_add(amount_in_with_fee)
        .ok_or(NumericError::Overflow("output denominator"))?;
    numerator
        .checked_div(denominator)
        .ok_or(NumericError::DivisionByZero("output_for_input"))
}

fn try_slippage(
    amount_in: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
    fee_rate: Decimal,
) -> Result<(Decimal, Decimal), NumericError> {
    let amount_out = try_output_for_input(amount_in, reserve_in, reserve_out, fee_rate)?;

    let price_before = reserve_out
        .checked_div(reserve_in)
        .ok_or(NumericError::DivisionByZero("price_before"))?;

    let new_reserve_in = reserve_in
        .checked_add(amount_in)
        .ok_or(NumericError::Overflow("post-trade reserve_in"))?;
    let new_reserve_out = reserve_out - amount_out;
    if new_reserve_out <= Decimal::ZERO {
        return Ok((Decimal::ZERO, Decimal::ONE));
    }

    let price_after = new_reserve_out
        .checked_div(new_reserve_in)
        .ok_or(NumericError::DivisionByZero("price_after"))?;
    let slippage_pct = (price_before - price_after)
        .abs()
        .checked_div(price_before)
        .ok_or(NumericError::DivisionByZero("slippage_pct"))?;

    Ok((amount_out, slippage_pct))
}

fn try_optimal_input(
    pool_a: &PoolState,
    pool_b: &PoolState,
    price_a: Decimal,
    price_b: Decimal,
) -> Result<Decimal, NumericError> {
    let k_a = pool_a
        .reserve_in
        .checked_mul(pool_a.reserve_out)
        .ok_or(NumericError::Overflow("pool constant"))?;
    let price_product = price_a
        .checked_mul(price_b)
        .ok_or(NumericError::Overflow("price product"))?;
    let radicand = k_a
        .checked_mul(price_b - price_a)
        .ok_or(NumericError::Overflow("radicand"))?
        .checked_div(price_product)
        .ok_or(NumericError::DivisionByZero("radicand"))?;

    let optimal = decimal_sqrt(radicand)?;

    let max_input = pool_a
        .reserve_in
        .min(pool_b.reserve_in)
        .checked_mul(MAX_RESERVE_FRACTION)
        .ok_or(NumericError::Overflow("reserve clamp"))?;

    Ok(optimal.min(max_input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenPair;
    use chrono::Utc;
    use ethers::types::Address;

    fn pool(id: u64, reserve_in: Decimal, reserve_out: Decimal) -> PoolState {
        PoolState {
            pool: Address::from_low_u64_be(id),
            pair: TokenPair::new(Address::from_low_u64_be(100), Address::from_low_u64_be(101)),
            protocol: DexProtocol::UniswapV2,
            reserve_in,
            reserve_out,
            fee_rate: dec!(0.003),
            last_update: Utc::now(),
            block_number: 1,
        }
    }

    #[test]
    fn output_never_drains_the_pool() {
        let reserve_in = dec!(1000);
        let reserve_out = dec!(2500000);
        for amount in [dec!(0.001), dec!(1), dec!(500), dec!(1000), dec!(1000000)] {
            let out = output_for_input(amount, reserve_in, reserve_out, dec!(0.003));
            assert!(out >= Decimal::ZERO, "negative output for {}", amount);
            assert!(out < reserve_out, "drained pool at input {}", amount);
        }
    }

    #[test]
    fn output_is_strictly_monotonic_in_input() {
        let reserve_in = dec!(1000);
        let reserve_out = dec!(2500000);
        let mut previous = Decimal::ZERO;
        for amount in [dec!(1), dec!(2), dec!(5), dec!(10), dec!(50), dec!(200), dec!(900)] {
            let out = output_for_input(amount, reserve_in, reserve_out, dec!(0.003));
            assert!(out > previous, "output not increasing at input {}", amount);
            previous = out;
        }
    }

    #[test]
    fn zero_reserve_yields_zero_output_and_full_slippage() {
        assert_eq!(
            output_for_input(dec!(10), Decimal::ZERO, dec!(1000), dec!(0.003)),
            Decimal::ZERO
        );
        let (out, slip) = slippage(dec!(10), Decimal::ZERO, dec!(1000), dec!(0.003));
        assert_eq!(out, Decimal::ZERO);
        assert_eq!(slip, Decimal::ONE);
    }

    #[test]
    fn slippage_grows_with_trade_size() {
        let (_, small) = slippage(dec!(1), dec!(1000), dec!(2500000), dec!(0.003));
        let (_, large) = slippage(dec!(100), dec!(1000), dec!(2500000), dec!(0.003));
        assert!(small < large);
        assert!(small > Decimal::ZERO);
        assert!(large < Decimal::ONE);
    }

    #[test]
    fn equal_prices_yield_no_arbitrage_direction() {
        let a = pool(1, dec!(1000), dec!(2500000));
        let b = pool(2, dec!(400), dec!(1000000));
        assert_eq!(a.spot_price(), b.spot_price());
        assert_eq!(optimal_input(&a, &b), Decimal::ZERO);
    }

    #[test]
    fn lower_priced_second_pool_yields_zero() {
        let a = pool(1, dec!(1000), dec!(2500000));
        let b = pool(2, dec!(1000), dec!(2400000));
        assert_eq!(optimal_input(&a, &b), Decimal::ZERO);
    }

    #[test]
    fn drained_pool_yields_zero_optimal_input() {
        let a = pool(1, dec!(1000), dec!(2500000));
        let b = pool(2, Decimal::ZERO, dec!(1000000));
        assert_eq!(optimal_input(&a, &b), Decimal::ZERO);
    }

    #[test]
    fn price_gap_sizes_a_positive_clamped_input() {
        // Pool A at 2500, pool B at 3131.25; the raw heuristic (~449) is
        // clamped to 10% of the smaller input reserve.
        let a = pool(1, dec!(1000), dec!(2500000));
        let b = pool(2, dec!(800), dec!(2505000));
        let optimal = optimal_input(&a, &b);
        assert_eq!(optimal, dec!(80.0));
    }

    #[test]
    fn round_trip_on_priced_gap_is_profitable_before_gas() {
        // Sell the base token into the pricier pool, rebuy through the cheap
        // one with reserves reversed.
        let a = pool(1, dec!(1000), dec!(2500000));
        let b = pool(2, dec!(800), dec!(2505000));
        let input = optimal_input(&a, &b);
        assert!(input > Decimal::ZERO);

        let (intermediate, _) = slippage(input, b.reserve_in, b.reserve_out, b.fee_rate);
        assert!(intermediate > Decimal::ZERO);
        let (final_amount, _) = slippage(intermediate, a.reserve_out, a.reserve_in, a.fee_rate);
        assert!(final_amount > input, "round trip lost money: {} -> {}", input, final_amount);
    }

    #[test]
    fn sqrt_converges_on_perfect_squares() {
        for (value, root) in [(dec!(4), dec!(2)), (dec!(144), dec!(12)), (dec!(2.25), dec!(1.5))] {
            let result = decimal_sqrt(value).unwrap();
            assert!((result - root).abs() < SQRT_EPSILON, "sqrt({}) = {}", value, result);
        }
    }

    #[test]
    fn sqrt_rejects_negative_radicand() {
        assert!(matches!(
            decimal_sqrt(dec!(-1)),
            Err(NumericError::NegativeRadicand(_))
        ));
    }

    #[test]
    fn gas_estimates_cover_known_venues() {
        assert_eq!(estimate_swap_gas(&DexProtocol::UniswapV2), 120_000);
        assert_eq!(estimate_swap_gas(&DexProtocol::Other("velodrome".into())), 150_000);
        assert_eq!(
            estimate_round_trip_gas(&DexProtocol::UniswapV2, &DexProtocol::SushiSwap),
            240_000
        );
    }
}
