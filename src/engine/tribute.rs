//! Entry and exit tribute.
//!
//! Tribute rates are fractions of [`PCT_BASE`], the same base the market maker
//! contract uses (`10^18` = 100%).

use super::amount::Amount;

pub const PCT_BASE: u128 = 1_000_000_000_000_000_000;

pub fn pct_base() -> Amount {
    Amount::from_u128(PCT_BASE)
}

/// Part of `amount` retained as tribute at `rate`.
pub fn tribute_of(amount: Amount, rate: Amount) -> Amount {
    amount.mul_div(rate, pct_base()).unwrap_or(amount)
}

/// `amount - amount * rate / PCT_BASE`.
///
/// Rates above `PCT_BASE` are clamped, so the result never exceeds `amount`.
pub fn apply_tribute(amount: Amount, rate: Amount) -> Amount {
    let rate = rate.min(pct_base());
    amount.saturating_sub(tribute_of(amount, rate))
}

/// `rate` as a percentage string, e.g. `2` for `2 * 10^16`.
pub fn rate_to_pct(rate: Amount) -> String {
    use super::amount::{format_units, FormatOptions};

    let pct = rate.checked_mul(Amount::from(100u64)).unwrap_or(Amount::MAX);
    format_units(
        pct,
        18,
        FormatOptions {
            truncate_to: Some(4),
            commas: false,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pct(p: u64) -> Amount {
        Amount::from_u128(PCT_BASE / 100 * p as u128)
    }

    #[test]
    fn test_zero_rate_is_identity() {
        for raw in [0u64, 1, 99, 1_000_000, u64::MAX] {
            let amount = Amount::from(raw);
            assert_eq!(apply_tribute(amount, Amount::ZERO), amount);
        }
    }

    #[test]
    fn test_tribute_never_grows_amount() {
        let amounts = [0u64, 1, 7, 1000, 123_456_789, u64::MAX];
        let rates = [Amount::ZERO, pct(1), pct(2), pct(50), pct(100), Amount::from(1u64)];
        for raw in amounts {
            for rate in rates {
                let amount = Amount::from(raw);
                assert!(apply_tribute(amount, rate) <= amount);
            }
        }
    }

    #[test]
    fn test_two_percent_exit_tribute() {
        let raw_output = Amount::from_units(1000, 18);
        assert_eq!(apply_tribute(raw_output, pct(2)), Amount::from_units(980, 18));
        assert_eq!(tribute_of(raw_output, pct(2)), Amount::from_units(20, 18));
    }

    #[test]
    fn test_floor_division_only() {
        // 3% of 10 is 0.3 -> floors to 0 retained
        assert_eq!(apply_tribute(Amount::from(10u64), pct(3)), Amount::from(10u64));
        assert_eq!(apply_tribute(Amount::from(100u64), pct(100)), Amount::ZERO);
    }

    #[test]
    fn test_rate_to_pct() {
        assert_eq!(rate_to_pct(pct(2)), "2");
        assert_eq!(rate_to_pct(Amount::from_u128(PCT_BASE / 1000)), "0.1");
        assert_eq!(rate_to_pct(Amount::ZERO), "0");
    }
}
