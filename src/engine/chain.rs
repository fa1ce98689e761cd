//! Chain-facing types and the collaborator traits the engine calls.
//!
//! Contract bindings, signing and gas live outside the engine; they reach it
//! only through [`MarketReader`], [`CurveEvaluator`] and [`ConversionGateway`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::amount::Amount;
use super::curve::CurveParameters;
use super::error::{ChainError, CurveError};

pub use alloy_primitives::{Address, Log, TxHash, B256};

/// Which way a conversion goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionDirection {
    /// Collateral in, bonded token out (buy order).
    ToBonded,
    /// Bonded token in, collateral out (sell order).
    FromBonded,
}

impl ConversionDirection {
    pub fn is_buy(&self) -> bool {
        matches!(self, ConversionDirection::ToBonded)
    }

    pub fn source_token(&self) -> TokenKind {
        match self {
            ConversionDirection::ToBonded => TokenKind::Collateral,
            ConversionDirection::FromBonded => TokenKind::Bonded,
        }
    }

    pub fn target_token(&self) -> TokenKind {
        match self {
            ConversionDirection::ToBonded => TokenKind::Bonded,
            ConversionDirection::FromBonded => TokenKind::Collateral,
        }
    }

    pub fn inverted(&self) -> Self {
        match self {
            ConversionDirection::ToBonded => ConversionDirection::FromBonded,
            ConversionDirection::FromBonded => ConversionDirection::ToBonded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Collateral,
    Bonded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: TxHash,
    pub block_number: u64,
    /// `false` when the transaction was mined but reverted.
    pub status: bool,
    pub logs: Vec<Log>,
}

/// Read access to the market maker and its tokens. Every call hits the chain;
/// implementations must not cache.
#[async_trait]
pub trait MarketReader: Send + Sync {
    async fn curve_parameters(&self) -> Result<CurveParameters, ChainError>;

    async fn bonded_total_supply(&self) -> Result<Amount, ChainError>;

    /// Collateral held by the curve's reserve treasury.
    async fn reserve_balance(&self) -> Result<Amount, ChainError>;

    async fn balance_of(&self, token: TokenKind, owner: Address) -> Result<Amount, ChainError>;
}

/// Bonding-curve evaluation, either local math or a formula contract call.
#[async_trait]
pub trait CurveEvaluator: Send + Sync {
    async fn purchase_return(
        &self,
        supply: Amount,
        reserve_balance: Amount,
        reserve_ratio: u32,
        deposit: Amount,
    ) -> Result<Amount, EvaluationError>;

    async fn sale_return(
        &self,
        supply: Amount,
        reserve_balance: Amount,
        reserve_ratio: u32,
        sell_amount: Amount,
    ) -> Result<Amount, EvaluationError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Curve(#[from] CurveError),
}

/// Signing side of the converting account: approvals, orders and receipts.
#[async_trait]
pub trait ConversionGateway: Send + Sync {
    /// Collateral allowance `owner` has granted to `spender`.
    async fn allowance(&self, owner: Address, spender: Address) -> Result<Amount, ChainError>;

    async fn approve(&self, spender: Address, amount: Amount) -> Result<TxHash, ChainError>;

    async fn submit_order(
        &self,
        account: Address,
        amount: Amount,
        direction: ConversionDirection,
        minimum_return: Amount,
    ) -> Result<TxHash, ChainError>;

    /// `None` while the transaction is still pending.
    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, ChainError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
}

/// Static token metadata. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct TokenRegistry {
    collateral: TokenInfo,
    bonded: TokenInfo,
    by_symbol: HashMap<String, u8>,
}

impl TokenRegistry {
    pub fn new(collateral: TokenInfo, bonded: TokenInfo) -> Self {
        let by_symbol = [&collateral, &bonded]
            .iter()
            .map(|t| (t.symbol.to_uppercase(), t.decimals))
            .collect();
        Self {
            collateral,
            bonded,
            by_symbol,
        }
    }

    pub fn decimals(&self, symbol: &str) -> Option<u8> {
        self.by_symbol.get(&symbol.to_uppercase()).copied()
    }

    pub fn token(&self, kind: TokenKind) -> &TokenInfo {
        match kind {
            TokenKind::Collateral => &self.collateral,
            TokenKind::Bonded => &self.bonded,
        }
    }

    pub fn kind_of(&self, symbol: &str) -> Option<TokenKind> {
        let symbol = symbol.to_uppercase();
        if self.collateral.symbol.to_uppercase() == symbol {
            Some(TokenKind::Collateral)
        } else if self.bonded.symbol.to_uppercase() == symbol {
            Some(TokenKind::Bonded)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr: Address = "0x00000000000000000000000000000000000000ff".parse().unwrap();
        assert_eq!(addr[19], 0xff);
        assert!("0x1234".parse::<Address>().is_err());
        assert!("zz".parse::<Address>().is_err());
    }

    #[test]
    fn test_token_registry_lookup() {
        let registry = TokenRegistry::new(
            TokenInfo {
                symbol: "TESTDAI".into(),
                decimals: 18,
            },
            TokenInfo {
                symbol: "TEC".into(),
                decimals: 6,
            },
        );
        assert_eq!(registry.decimals("tec"), Some(6));
        assert_eq!(registry.decimals("TESTDAI"), Some(18));
        assert_eq!(registry.decimals("ETH"), None);
        assert_eq!(registry.kind_of("tec"), Some(TokenKind::Bonded));
    }

    #[test]
    fn test_direction_tokens() {
        let d = ConversionDirection::ToBonded;
        assert_eq!(d.source_token(), TokenKind::Collateral);
        assert_eq!(d.target_token(), TokenKind::Bonded);
        assert_eq!(d.inverted(), ConversionDirection::FromBonded);
        assert_eq!(
            serde_json::to_string(&ConversionDirection::FromBonded).unwrap(),
            "\"from_bonded\""
        );
    }
}
