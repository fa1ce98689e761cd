//! Converter configuration
//!
//! Read from the environment (after `dotenvy::dotenv()` in `main`). Values that
//! fail to parse fall back to their defaults with a warning.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::amount::{parse_units, Amount, MAX_DECIMALS};
use crate::engine::chain::{TokenInfo, TxHash};
use crate::engine::oracle::RETRY_EVERY;
use crate::engine::planner::{RECEIPT_POLL, REVEAL_DELAY};

pub const MAINNET_CHAIN_ID: u64 = 1;
pub const RINKEBY_CHAIN_ID: u64 = 4;
pub const XDAI_CHAIN_ID: u64 = 100;

/// Reserve ratio of the mainnet market maker, in PPM.
pub const MAINNET_CONNECTOR_WEIGHT: u32 = 250_000;
/// Reserve ratio used on every other network.
pub const TESTNET_CONNECTOR_WEIGHT: u32 = 33_333;

#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub chain_id: u64,
    pub listen_addr: SocketAddr,
    pub price_retry: Duration,
    pub reveal_delay: Duration,
    pub receipt_poll: Duration,
    pub collateral: TokenInfo,
    pub bonded: TokenInfo,
    /// Entry tribute as an 18-decimal fraction (1e18 = 100%).
    pub buy_tribute_rate: Amount,
    /// Exit tribute as an 18-decimal fraction.
    pub sell_tribute_rate: Amount,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            chain_id: MAINNET_CHAIN_ID,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            price_retry: RETRY_EVERY,
            reveal_delay: REVEAL_DELAY,
            receipt_poll: RECEIPT_POLL,
            collateral: TokenInfo {
                symbol: "DAI".to_string(),
                decimals: 18,
            },
            bonded: TokenInfo {
                symbol: "TEC".to_string(),
                decimals: 18,
            },
            buy_tribute_rate: pct_rate("2").unwrap_or_default(),
            sell_tribute_rate: pct_rate("2").unwrap_or_default(),
        }
    }
}

/// "2.5" (percent) to an 18-decimal fraction.
pub fn pct_rate(pct: &str) -> Option<Amount> {
    parse_units(pct, 16)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

fn env_pct(key: &str, default: Amount) -> Amount {
    match std::env::var(key) {
        Ok(raw) => match pct_rate(&raw) {
            Some(rate) if rate <= Amount::from_units(1, 18) => rate,
            _ => {
                tracing::warn!("Ignoring invalid {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Token decimals from `raw`, rejecting values whose unit would not fit in 256 bits.
fn parse_decimals(key: &str, raw: Option<&str>, default: u8) -> u8 {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<u8>() {
        Ok(decimals) if decimals <= MAX_DECIMALS => decimals,
        _ => {
            tracing::warn!(
                "Ignoring invalid {}={:?} (at most {}), using default",
                key,
                raw,
                MAX_DECIMALS
            );
            default
        }
    }
}

fn env_decimals(key: &str, default: u8) -> u8 {
    parse_decimals(key, std::env::var(key).ok().as_deref(), default)
}

impl ConverterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chain_id: env_or("CHAIN_ID", defaults.chain_id),
            listen_addr: env_or("CONVERTER_ADDR", defaults.listen_addr),
            price_retry: env_millis("PRICE_RETRY_MS", defaults.price_retry),
            reveal_delay: env_millis("PLAN_REVEAL_DELAY_MS", defaults.reveal_delay),
            receipt_poll: env_millis("RECEIPT_POLL_MS", defaults.receipt_poll),
            collateral: TokenInfo {
                symbol: env_or("COLLATERAL_SYMBOL", defaults.collateral.symbol),
                decimals: env_decimals("COLLATERAL_DECIMALS", defaults.collateral.decimals),
            },
            bonded: TokenInfo {
                symbol: env_or("BONDED_SYMBOL", defaults.bonded.symbol),
                decimals: env_decimals("BONDED_DECIMALS", defaults.bonded.decimals),
            },
            buy_tribute_rate: env_pct("BUY_TRIBUTE_PCT", defaults.buy_tribute_rate),
            sell_tribute_rate: env_pct("SELL_TRIBUTE_PCT", defaults.sell_tribute_rate),
        }
    }

    /// Reserve ratio of the market maker on this network, in PPM.
    pub fn connector_weight(&self) -> u32 {
        if self.chain_id == MAINNET_CHAIN_ID {
            MAINNET_CONNECTOR_WEIGHT
        } else {
            TESTNET_CONNECTOR_WEIGHT
        }
    }

    /// Block explorer link for a transaction, when the network has one.
    pub fn explorer_tx_url(&self, hash: &TxHash) -> Option<String> {
        let base = match self.chain_id {
            MAINNET_CHAIN_ID => "https://etherscan.io/tx/",
            RINKEBY_CHAIN_ID => "https://rinkeby.etherscan.io/tx/",
            XDAI_CHAIN_ID => "https://blockscout.com/poa/xdai/tx/",
            _ => return None,
        };
        Some(format!("{}{}", base, hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::chain::B256;

    #[test]
    fn test_pct_rate() {
        assert_eq!(pct_rate("2"), Some(Amount::from_units(2, 16)));
        assert_eq!(pct_rate("0.5"), Some(Amount::from_units(5, 15)));
        assert_eq!(pct_rate("x"), None);
    }

    #[test]
    fn test_decimals_bounded() {
        assert_eq!(parse_decimals("D", None, 18), 18);
        assert_eq!(parse_decimals("D", Some(" 6 "), 18), 6);
        assert_eq!(parse_decimals("D", Some("77"), 18), 77);
        assert_eq!(parse_decimals("D", Some("78"), 18), 18);
        assert_eq!(parse_decimals("D", Some("255"), 18), 18);
        assert_eq!(parse_decimals("D", Some("six"), 18), 18);
    }

    #[test]
    fn test_connector_weight_per_chain() {
        let mut config = ConverterConfig::default();
        assert_eq!(config.connector_weight(), 250_000);
        config.chain_id = RINKEBY_CHAIN_ID;
        assert_eq!(config.connector_weight(), 33_333);
    }

    #[test]
    fn test_explorer_url() {
        let mut config = ConverterConfig::default();
        let hash = B256::repeat_byte(0xab);
        let url = config.explorer_tx_url(&hash).unwrap();
        assert!(url.starts_with("https://etherscan.io/tx/0xabab"));
        config.chain_id = 1337;
        assert_eq!(config.explorer_tx_url(&hash), None);
    }
}
