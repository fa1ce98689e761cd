//! Bonding-curve parameters and the Bancor pricing formula.
//!
//! Purchase return:
//!   supply * ((1 + deposit / balance) ^ (ratio / PPM) - 1)
//!
//! Sale return:
//!   balance * (1 - (1 - amount / supply) ^ (PPM / ratio))
//!
//! Powers are evaluated as `exp(y * ln(x))` in 18-decimal fixed point on
//! 256-bit integers. All intermediate divisions floor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::amount::{Amount, U256};
use super::chain::{CurveEvaluator, EvaluationError};
use super::error::CurveError;
use super::tribute::PCT_BASE;

/// Reserve ratios are parts per million (1_000_000 = 100%).
pub const PPM: u32 = 1_000_000;

const ONE: u128 = 1_000_000_000_000_000_000;
const LN2: u128 = 693_147_180_559_945_309;
/// 2^MAX_EXP_SHIFT * 2e18 must stay below 2^256.
const MAX_EXP_SHIFT: u32 = 190;

/// Snapshot of the market maker's curve configuration for the collateral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurveParameters {
    pub virtual_supply: Amount,
    pub virtual_balance: Amount,
    /// Connector weight in PPM.
    pub reserve_ratio: u32,
    /// Entry tribute, fraction of `PCT_BASE`.
    pub buy_tribute_rate: Amount,
    /// Exit tribute, fraction of `PCT_BASE`.
    pub sell_tribute_rate: Amount,
}

impl CurveParameters {
    pub fn validate(&self) -> Result<(), CurveError> {
        let base = Amount::from_u128(PCT_BASE);
        if self.reserve_ratio == 0 || self.reserve_ratio > PPM {
            return Err(CurveError::InvalidParameters);
        }
        if self.buy_tribute_rate > base || self.sell_tribute_rate > base {
            return Err(CurveError::InvalidParameters);
        }
        Ok(())
    }
}

fn one() -> U256 {
    U256::from(ONE)
}

fn mul(a: U256, b: U256) -> Result<U256, CurveError> {
    a.checked_mul(b).ok_or(CurveError::Overflow)
}

fn add(a: U256, b: U256) -> Result<U256, CurveError> {
    a.checked_add(b).ok_or(CurveError::Overflow)
}

fn mul_div(a: U256, b: U256, c: U256) -> Result<U256, CurveError> {
    Amount::from_u256(a)
        .mul_div(Amount::from_u256(b), Amount::from_u256(c))
        .map(|r| r.as_u256())
        .ok_or(CurveError::Overflow)
}

/// Natural log of `x / ONE` for `x >= ONE`, scaled by `ONE`.
fn ln_fixed(x: U256) -> Result<U256, CurveError> {
    let one = one();
    if x < one {
        return Err(CurveError::InvalidParameters);
    }

    // x = y * 2^k with y in [1, 2)
    let two = one * U256::from(2u8);
    let mut y = x;
    let mut k = 0u64;
    while y >= two {
        y = y / U256::from(2u8);
        k += 1;
    }

    // ln(y) = 2 * atanh(z), z = (y - 1) / (y + 1) <= 1/3
    let z = mul(y - one, one)? / (y + one);
    let z_sq = z * z / one;
    let mut term = z;
    let mut sum = U256::ZERO;
    let mut n = 1u64;
    while !term.is_zero() {
        sum = sum + term / U256::from(n);
        term = term * z_sq / one;
        n += 2;
    }

    add(mul(U256::from(k), U256::from(LN2))?, sum * U256::from(2u8))
}

/// `e^(x / ONE)` for `x >= 0`, scaled by `ONE`.
fn exp_fixed(x: U256) -> Result<U256, CurveError> {
    let one = one();
    let ln2 = U256::from(LN2);

    // x = k * ln2 + r with r in [0, ln2)
    let k = x / ln2;
    if k > U256::from(MAX_EXP_SHIFT) {
        return Err(CurveError::Overflow);
    }
    let r = x - k * ln2;

    let mut sum = one;
    let mut term = one;
    let mut n = 1u64;
    loop {
        term = term * r / one / U256::from(n);
        if term.is_zero() {
            break;
        }
        sum = sum + term;
        n += 1;
    }

    let mut result = sum;
    for _ in 0..k.to::<u32>() {
        result = mul(result, U256::from(2u8))?;
    }
    Ok(result)
}

/// `(base / ONE) ^ (num / den)`, scaled by `ONE`, for `base >= ONE`.
fn pow_fixed(base: U256, num: u32, den: u32) -> Result<U256, CurveError> {
    let log = ln_fixed(base)?;
    let scaled = mul(log, U256::from(num))? / U256::from(den);
    exp_fixed(scaled)
}

/// Pure Bancor-style formula.
#[derive(Debug, Clone, Copy, Default)]
pub struct BancorFormula;

impl BancorFormula {
    fn check(supply: Amount, balance: Amount, ratio: u32) -> Result<(), CurveError> {
        if supply.is_zero() || balance.is_zero() || ratio == 0 || ratio > PPM {
            return Err(CurveError::InvalidParameters);
        }
        Ok(())
    }

    /// Bonded tokens minted for `deposit` collateral.
    pub fn calculate_purchase_return(
        supply: Amount,
        balance: Amount,
        ratio: u32,
        deposit: Amount,
    ) -> Result<Amount, CurveError> {
        Self::check(supply, balance, ratio)?;
        if deposit.is_zero() {
            return Ok(Amount::ZERO);
        }

        let (s, b, d) = (supply.as_u256(), balance.as_u256(), deposit.as_u256());
        if ratio == PPM {
            return mul_div(s, d, b).map(Amount::from_u256);
        }

        let base = mul_div(add(b, d)?, one(), b)?;
        let power = pow_fixed(base, ratio, PPM)?;
        let growth = power.saturating_sub(one());
        mul_div(s, growth, one()).map(Amount::from_u256)
    }

    /// Collateral released for burning `amount` bonded tokens.
    pub fn calculate_sale_return(
        supply: Amount,
        balance: Amount,
        ratio: u32,
        amount: Amount,
    ) -> Result<Amount, CurveError> {
        Self::check(supply, balance, ratio)?;
        if amount > supply {
            return Err(CurveError::ExceedsSupply);
        }
        if amount.is_zero() {
            return Ok(Amount::ZERO);
        }
        if amount == supply {
            return Ok(balance);
        }

        let (s, b, a) = (supply.as_u256(), balance.as_u256(), amount.as_u256());
        if ratio == PPM {
            return mul_div(b, a, s).map(Amount::from_u256);
        }

        // (1 - a/s)^(PPM/ratio) = 1 / (s / (s - a))^(PPM/ratio)
        let inverse_base = mul_div(s, one(), s - a)?;
        let power = match pow_fixed(inverse_base, PPM, ratio) {
            Ok(p) => p,
            // the remaining fraction rounds to nothing
            Err(CurveError::Overflow) => return Ok(balance),
            Err(e) => return Err(e),
        };
        mul_div(b, power - one(), power).map(Amount::from_u256)
    }
}

#[async_trait]
impl CurveEvaluator for BancorFormula {
    async fn purchase_return(
        &self,
        supply: Amount,
        reserve_balance: Amount,
        reserve_ratio: u32,
        deposit: Amount,
    ) -> Result<Amount, EvaluationError> {
        Ok(Self::calculate_purchase_return(
            supply,
            reserve_balance,
            reserve_ratio,
            deposit,
        )?)
    }

    async fn sale_return(
        &self,
        supply: Amount,
        reserve_balance: Amount,
        reserve_ratio: u32,
        sell_amount: Amount,
    ) -> Result<Amount, EvaluationError> {
        Ok(Self::calculate_sale_return(
            supply,
            reserve_balance,
            reserve_ratio,
            sell_amount,
        )?)
    }
}
