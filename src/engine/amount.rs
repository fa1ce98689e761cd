//! Token quantities in base units.
//!
//! All quote and plan arithmetic runs on [`Amount`], a 256-bit unsigned
//! integer. Division always floors; nothing here touches floating point.

use alloy_primitives::utils::{self as units, ParseUnits};
use alloy_primitives::Uint;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub use alloy_primitives::U256;

/// Wide intermediate for `a * b / c` without overflow.
type U512 = Uint<512, 8>;

/// Largest decimals value whose unit, `10^decimals`, fits in 256 bits.
pub const MAX_DECIMALS: u8 = 77;

fn widen(value: U256) -> U512 {
    U512::from_be_slice(&value.to_be_bytes::<32>())
}

fn narrow(value: U512) -> Option<U256> {
    let bytes = value.to_be_bytes::<64>();
    if bytes[..32].iter().any(|&b| b != 0) {
        return None;
    }
    Some(U256::from_be_slice(&bytes[32..]))
}

/// Token amount in base units (wei-like).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);
    pub const MAX: Amount = Amount(U256::MAX);

    pub fn from_u128(value: u128) -> Self {
        Amount(U256::from(value))
    }

    pub fn from_u256(value: U256) -> Self {
        Amount(value)
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    /// One whole token, `10^decimals` base units. `None` above [`MAX_DECIMALS`].
    pub fn checked_one_unit(decimals: u8) -> Option<Self> {
        U256::from(10u8)
            .checked_pow(U256::from(decimals))
            .map(Amount)
    }

    /// Like [`checked_one_unit`](Self::checked_one_unit), saturating at `Amount::MAX`.
    pub fn one_unit(decimals: u8) -> Self {
        Self::checked_one_unit(decimals).unwrap_or(Amount::MAX)
    }

    /// `whole * 10^decimals`, for writing amounts in whole tokens. Saturates.
    pub fn from_units(whole: u128, decimals: u8) -> Self {
        Self::checked_one_unit(decimals)
            .and_then(|unit| Amount::from_u128(whole).checked_mul(unit))
            .unwrap_or(Amount::MAX)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn checked_mul(self, other: Amount) -> Option<Amount> {
        self.0.checked_mul(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        self.checked_add(other).unwrap_or(Amount::MAX)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        self.checked_sub(other).unwrap_or(Amount::ZERO)
    }

    /// `floor(self * numerator / denominator)`, computed on a 512-bit
    /// intermediate. `None` on a zero denominator or a result above `U256::MAX`.
    pub fn mul_div(self, numerator: Amount, denominator: Amount) -> Option<Amount> {
        if denominator.is_zero() {
            return None;
        }
        let product = widen(self.0) * widen(numerator.0);
        narrow(product / widen(denominator.0)).map(Amount)
    }
}

impl From<Amount> for U256 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(U256::from(value))
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount::from_u128(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid amount: {0}")]
pub struct ParseAmountError(String);

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError(s.to_string()));
        }
        U256::from_str_radix(trimmed, 10)
            .map(Amount)
            .map_err(|_| ParseAmountError(s.to_string()))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> de::Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or decimal string in base units")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(Amount::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                u64::try_from(v)
                    .map(Amount::from)
                    .map_err(|_| E::custom("amount cannot be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/// Parse a human decimal string ("12.5") into base units.
///
/// Returns `None` for anything that is not a plain non-negative decimal with
/// at most `decimals` fractional digits. An empty string parses as zero.
pub fn parse_units(input: &str, decimals: u8) -> Option<Amount> {
    let input = input.trim().replace(',', "");
    if input.is_empty() {
        return Some(Amount::ZERO);
    }

    let (whole, fraction) = match input.split_once('.') {
        Some((w, f)) => (w, f),
        None => (input.as_str(), ""),
    };
    let digits_only = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !digits_only(whole) || !digits_only(fraction) || (whole.is_empty() && fraction.is_empty()) {
        return None;
    }
    if fraction.len() > decimals as usize {
        return None;
    }

    // 77 significant digits always fit in 256 bits
    if whole.trim_start_matches('0').len() + decimals as usize > MAX_DECIMALS as usize {
        return None;
    }

    match units::parse_units(&input, decimals).ok()? {
        ParseUnits::U256(value) => Some(Amount(value)),
        ParseUnits::I256(_) => None,
    }
}

/// Display options for [`format_units`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Keep at most this many fractional digits (truncated, never rounded).
    pub truncate_to: Option<usize>,
    /// Insert thousands separators in the whole part.
    pub commas: bool,
}

/// Render base units as a human decimal string, trimming trailing zeros.
pub fn format_units(amount: Amount, decimals: u8, options: FormatOptions) -> String {
    let rendered = units::format_units(amount.0, decimals).unwrap_or_else(|_| amount.to_string());
    let (whole, fraction) = rendered.split_once('.').unwrap_or((rendered.as_str(), ""));

    let mut fraction = fraction.to_string();
    if let Some(limit) = options.truncate_to {
        fraction.truncate(limit);
    }
    let fraction = fraction.trim_end_matches('0');

    let whole = if options.commas {
        group_thousands(whole)
    } else {
        whole.to_string()
    };

    if fraction.is_empty() {
        whole
    } else {
        format!("{}.{}", whole, fraction)
    }
}

fn group_thousands(whole: &str) -> String {
    let mut out = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
