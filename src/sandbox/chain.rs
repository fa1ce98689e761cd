//! In-memory chain for sandbox sessions
//!
//! Models the pieces a conversion touches: the collateral and bonded tokens, the
//! reserve treasury and the bonding-curve market maker. Transactions queue in a
//! FIFO pool and execute when mined, producing receipts with the same logs the
//! real contracts emit.

use async_trait::async_trait;
use alloy_primitives::keccak256;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::amount::Amount;
use crate::engine::chain::{
    Address, ConversionDirection, ConversionGateway, Log, MarketReader, TokenKind,
    TransactionReceipt, TxHash,
};
use crate::engine::curve::{BancorFormula, CurveParameters};
use crate::engine::error::{ChainError, CurveError};
use crate::engine::receipt::{order_log, transfer_log, OrderFill};
use crate::engine::tribute::{pct_base, tribute_of};

/// Deterministic address for a named sandbox actor or contract.
pub fn named_address(label: &str) -> Address {
    Address::from_word(keccak256(label.as_bytes()))
}

/// Contract addresses of a sandbox deployment.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Deployment {
    pub collateral_token: Address,
    pub bonded_token: Address,
    pub market_maker: Address,
    pub reserve: Address,
    /// Receives entry and exit tribute.
    pub beneficiary: Address,
}

impl Default for Deployment {
    fn default() -> Self {
        Self {
            collateral_token: named_address("collateral-token"),
            bonded_token: named_address("bonded-token"),
            market_maker: named_address("market-maker"),
            reserve: named_address("reserve"),
            beneficiary: named_address("beneficiary"),
        }
    }
}

/// Initial market state.
#[derive(Debug, Clone, Copy)]
pub struct MarketSetup {
    pub bonded_supply: Amount,
    pub reserve_balance: Amount,
    pub params: CurveParameters,
}

#[derive(Debug, Clone)]
enum PendingTx {
    Approve {
        hash: TxHash,
        owner: Address,
        spender: Address,
        amount: Amount,
    },
    Order {
        hash: TxHash,
        account: Address,
        amount: Amount,
        direction: ConversionDirection,
        minimum_return: Amount,
    },
}

impl PendingTx {
    fn hash(&self) -> TxHash {
        match self {
            PendingTx::Approve { hash, .. } | PendingTx::Order { hash, .. } => *hash,
        }
    }
}

/// Why a mined transaction reverted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
enum Revert {
    #[error("approve from non-zero to non-zero allowance")]
    ApprovalNotReset,
    #[error("insufficient {0:?} balance")]
    InsufficientBalance(TokenKind),
    #[error("insufficient allowance")]
    InsufficientAllowance,
    #[error("return below minimum")]
    Slippage,
    #[error(transparent)]
    Curve(#[from] CurveError),
}

#[derive(Debug, Default)]
struct Ledger {
    block_number: u64,
    nonce: u64,
    balances: HashMap<(TokenKind, Address), Amount>,
    /// Collateral allowances, `(owner, spender)`.
    allowances: HashMap<(Address, Address), Amount>,
    bonded_supply: Amount,
    params: Option<CurveParameters>,
    pending: VecDeque<PendingTx>,
    receipts: HashMap<TxHash, TransactionReceipt>,
    read_faults: usize,
    auto_mine: bool,
}

impl Ledger {
    fn balance(&self, token: TokenKind, owner: Address) -> Amount {
        self.balances.get(&(token, owner)).copied().unwrap_or_default()
    }

    fn credit(&mut self, token: TokenKind, owner: Address, amount: Amount) {
        let entry = self.balances.entry((token, owner)).or_default();
        *entry = entry.saturating_add(amount);
    }

    fn debit(&mut self, token: TokenKind, owner: Address, amount: Amount) -> Result<(), Revert> {
        let balance = self.balance(token, owner);
        let rest = balance
            .checked_sub(amount)
            .ok_or(Revert::InsufficientBalance(token))?;
        self.balances.insert((token, owner), rest);
        Ok(())
    }

    fn read(&mut self) -> Result<(), ChainError> {
        if self.read_faults > 0 {
            self.read_faults -= 1;
            return Err(ChainError::Read("sandbox node unavailable".into()));
        }
        Ok(())
    }

    fn next_hash(&mut self, sender: Address) -> TxHash {
        self.nonce += 1;
        keccak256([sender.as_slice(), &self.nonce.to_be_bytes()].concat())
    }
}

/// Shared handle to one sandbox chain.
#[derive(Clone)]
pub struct SandboxChain {
    ledger: Arc<Mutex<Ledger>>,
    deployment: Deployment,
}

impl SandboxChain {
    pub fn new(setup: MarketSetup) -> Self {
        let deployment = Deployment::default();
        let mut ledger = Ledger {
            bonded_supply: setup.bonded_supply,
            params: Some(setup.params),
            auto_mine: true,
            ..Ledger::default()
        };
        ledger.credit(TokenKind::Collateral, deployment.reserve, setup.reserve_balance);
        Self {
            ledger: Arc::new(Mutex::new(ledger)),
            deployment,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Signer for `account` on this chain.
    pub fn signer(&self, account: Address) -> SandboxSigner {
        SandboxSigner {
            chain: self.clone(),
            account,
        }
    }

    /// Mine every queued transaction as each one arrives.
    pub fn set_auto_mine(&self, enabled: bool) {
        self.ledger().auto_mine = enabled;
    }

    /// Fail the next `count` reads with a transient error.
    pub fn fail_next_reads(&self, count: usize) {
        self.ledger().read_faults = count;
    }

    pub fn set_curve_parameters(&self, params: CurveParameters) {
        self.ledger().params = Some(params);
    }

    pub fn block_number(&self) -> u64 {
        self.ledger().block_number
    }

    pub fn pending_count(&self) -> usize {
        self.ledger().pending.len()
    }

    /// Mint `amount` of `token` to `to`. Bonded mints grow the supply.
    pub fn faucet(&self, token: TokenKind, to: Address, amount: Amount) -> Amount {
        let mut ledger = self.ledger();
        ledger.credit(token, to, amount);
        if token == TokenKind::Bonded {
            ledger.bonded_supply = ledger.bonded_supply.saturating_add(amount);
        }
        tracing::debug!("Faucet minted {} {:?} to {}", amount, token, to);
        ledger.balance(token, to)
    }

    /// Balance without fault injection, for views.
    pub fn peek_balance(&self, token: TokenKind, owner: Address) -> Amount {
        self.ledger().balance(token, owner)
    }

    pub fn peek_allowance(&self, owner: Address, spender: Address) -> Amount {
        self.ledger()
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default()
    }

    fn enqueue(&self, tx: PendingTx) -> TxHash {
        let hash = tx.hash();
        let auto_mine = {
            let mut ledger = self.ledger();
            ledger.pending.push_back(tx);
            ledger.auto_mine
        };
        if auto_mine {
            self.mine_pending();
        }
        hash
    }

    /// Execute queued transactions in order, one block each. Returns how many were mined.
    pub fn mine_pending(&self) -> usize {
        let mut ledger = self.ledger();
        let mut mined = 0;
        while let Some(tx) = ledger.pending.pop_front() {
            ledger.block_number += 1;
            let hash = tx.hash();
            let (status, logs) = match self.execute(&mut ledger, &tx) {
                Ok(logs) => (true, logs),
                Err(revert) => {
                    tracing::info!("Sandbox transaction {} reverted: {}", hash, revert);
                    (false, Vec::new())
                }
            };
            let receipt = TransactionReceipt {
                transaction_hash: hash,
                block_number: ledger.block_number,
                status,
                logs,
            };
            ledger.receipts.insert(hash, receipt);
            mined += 1;
        }
        mined
    }

    fn execute(&self, ledger: &mut Ledger, tx: &PendingTx) -> Result<Vec<Log>, Revert> {
        match *tx {
            PendingTx::Approve {
                owner,
                spender,
                amount,
                ..
            } => {
                let current = ledger
                    .allowances
                    .get(&(owner, spender))
                    .copied()
                    .unwrap_or_default();
                if !current.is_zero() && !amount.is_zero() {
                    return Err(Revert::ApprovalNotReset);
                }
                ledger.allowances.insert((owner, spender), amount);
                Ok(Vec::new())
            }
            PendingTx::Order {
                account,
                amount,
                direction,
                minimum_return,
                ..
            } => match direction {
                ConversionDirection::ToBonded => self.buy(ledger, account, amount, minimum_return),
                ConversionDirection::FromBonded => self.sell(ledger, account, amount, minimum_return),
            },
        }
    }

    fn curve_inputs(&self, ledger: &Ledger) -> Result<(CurveParameters, Amount, Amount), Revert> {
        let params = ledger.params.ok_or(CurveError::InvalidParameters)?;
        params.validate()?;
        let supply = ledger
            .bonded_supply
            .checked_add(params.virtual_supply)
            .ok_or(CurveError::Overflow)?;
        let balance = ledger
            .balance(TokenKind::Collateral, self.deployment.reserve)
            .checked_add(params.virtual_balance)
            .ok_or(CurveError::Overflow)?;
        Ok((params, supply, balance))
    }

    fn transfer_log(&self, token: TokenKind, from: Address, to: Address, value: Amount) -> Log {
        let emitter = match token {
            TokenKind::Collateral => self.deployment.collateral_token,
            TokenKind::Bonded => self.deployment.bonded_token,
        };
        transfer_log(emitter, from, to, value)
    }

    fn buy(
        &self,
        ledger: &mut Ledger,
        account: Address,
        deposit: Amount,
        minimum_return: Amount,
    ) -> Result<Vec<Log>, Revert> {
        let d = self.deployment;
        let allowance = ledger
            .allowances
            .get(&(account, d.market_maker))
            .copied()
            .unwrap_or_default();
        if allowance < deposit {
            return Err(Revert::InsufficientAllowance);
        }

        // the entry tribute is pulled on top of the deposit, up to what the allowance covers
        let (params, supply, balance) = self.curve_inputs(ledger)?;
        let rate = params.buy_tribute_rate;
        let fee = deposit
            .mul_div(rate, pct_base().saturating_sub(rate))
            .unwrap_or_default()
            .min(allowance.saturating_sub(deposit));
        let pulled = deposit.checked_add(fee).ok_or(CurveError::Overflow)?;
        if ledger.balance(TokenKind::Collateral, account) < pulled {
            return Err(Revert::InsufficientBalance(TokenKind::Collateral));
        }

        let returned =
            BancorFormula::calculate_purchase_return(supply, balance, params.reserve_ratio, deposit)?;
        if returned < minimum_return {
            return Err(Revert::Slippage);
        }

        ledger.debit(TokenKind::Collateral, account, pulled)?;
        ledger.allowances.insert((account, d.market_maker), allowance.saturating_sub(pulled));
        ledger.credit(TokenKind::Collateral, d.reserve, deposit);
        ledger.credit(TokenKind::Collateral, d.beneficiary, fee);
        ledger.credit(TokenKind::Bonded, account, returned);
        ledger.bonded_supply = ledger.bonded_supply.saturating_add(returned);

        Ok(vec![
            self.transfer_log(TokenKind::Collateral, account, d.reserve, deposit),
            self.transfer_log(TokenKind::Collateral, account, d.beneficiary, fee),
            self.transfer_log(TokenKind::Bonded, Address::ZERO, account, returned),
            order_log(
                d.market_maker,
                ConversionDirection::ToBonded,
                &OrderFill {
                    trader: account,
                    collateral: d.collateral_token,
                    fee,
                    amount: deposit,
                    returned,
                    fee_pct: params.buy_tribute_rate,
                },
            ),
        ])
    }

    fn sell(
        &self,
        ledger: &mut Ledger,
        account: Address,
        amount: Amount,
        minimum_return: Amount,
    ) -> Result<Vec<Log>, Revert> {
        let d = self.deployment;
        if ledger.balance(TokenKind::Bonded, account) < amount {
            return Err(Revert::InsufficientBalance(TokenKind::Bonded));
        }

        let (params, supply, balance) = self.curve_inputs(ledger)?;
        let raw = BancorFormula::calculate_sale_return(supply, balance, params.reserve_ratio, amount)?;
        let fee = tribute_of(raw, params.sell_tribute_rate);
        let returned = raw.saturating_sub(fee);
        if returned < minimum_return {
            return Err(Revert::Slippage);
        }

        ledger.debit(TokenKind::Bonded, account, amount)?;
        ledger.bonded_supply = ledger.bonded_supply.saturating_sub(amount);
        ledger.debit(TokenKind::Collateral, d.reserve, raw)?;
        ledger.credit(TokenKind::Collateral, account, returned);
        ledger.credit(TokenKind::Collateral, d.beneficiary, fee);

        Ok(vec![
            self.transfer_log(TokenKind::Bonded, account, Address::ZERO, amount),
            self.transfer_log(TokenKind::Collateral, d.reserve, account, returned),
            order_log(
                d.market_maker,
                ConversionDirection::FromBonded,
                &OrderFill {
                    trader: account,
                    collateral: d.collateral_token,
                    fee,
                    amount,
                    returned,
                    fee_pct: params.sell_tribute_rate,
                },
            ),
        ])
    }
}

#[async_trait]
impl MarketReader for SandboxChain {
    async fn curve_parameters(&self) -> Result<CurveParameters, ChainError> {
        let mut ledger = self.ledger();
        ledger.read()?;
        ledger
            .params
            .ok_or_else(|| ChainError::Read("market maker not initialized".into()))
    }

    async fn bonded_total_supply(&self) -> Result<Amount, ChainError> {
        let mut ledger = self.ledger();
        ledger.read()?;
        Ok(ledger.bonded_supply)
    }

    async fn reserve_balance(&self) -> Result<Amount, ChainError> {
        let mut ledger = self.ledger();
        ledger.read()?;
        Ok(ledger.balance(TokenKind::Collateral, self.deployment.reserve))
    }

    async fn balance_of(&self, token: TokenKind, owner: Address) -> Result<Amount, ChainError> {
        let mut ledger = self.ledger();
        ledger.read()?;
        Ok(ledger.balance(token, owner))
    }
}

/// Signs for one account on a [`SandboxChain`].
#[derive(Clone)]
pub struct SandboxSigner {
    chain: SandboxChain,
    account: Address,
}

impl SandboxSigner {
    pub fn account(&self) -> Address {
        self.account
    }
}

#[async_trait]
impl ConversionGateway for SandboxSigner {
    async fn allowance(&self, owner: Address, spender: Address) -> Result<Amount, ChainError> {
        let mut ledger = self.chain.ledger();
        ledger.read()?;
        Ok(ledger
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn approve(&self, spender: Address, amount: Amount) -> Result<TxHash, ChainError> {
        let hash = self.chain.ledger().next_hash(self.account);
        tracing::debug!("Sandbox approve {} for {} as {}", amount, spender, hash);
        Ok(self.chain.enqueue(PendingTx::Approve {
            hash,
            owner: self.account,
            spender,
            amount,
        }))
    }

    async fn submit_order(
        &self,
        account: Address,
        amount: Amount,
        direction: ConversionDirection,
        minimum_return: Amount,
    ) -> Result<TxHash, ChainError> {
        if account != self.account {
            return Err(ChainError::Rejected(format!(
                "signer {} cannot order for {}",
                self.account, account
            )));
        }
        let hash = self.chain.ledger().next_hash(self.account);
        tracing::debug!("Sandbox {:?} order of {} as {}", direction, amount, hash);
        Ok(self.chain.enqueue(PendingTx::Order {
            hash,
            account,
            amount,
            direction,
            minimum_return,
        }))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        let mut ledger = self.chain.ledger();
        ledger.read()?;
        if let Some(receipt) = ledger.receipts.get(&hash) {
            return Ok(Some(receipt.clone()));
        }
        if ledger.pending.iter().any(|tx| tx.hash() == hash) {
            return Ok(None);
        }
        Err(ChainError::UnknownTransaction(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::receipt::converted_amount;
    use crate::engine::tribute::apply_tribute;

    fn tokens(n: u128) -> Amount {
        Amount::from_units(n, 18)
    }

    fn setup() -> MarketSetup {
        MarketSetup {
            bonded_supply: tokens(1_000_000),
            reserve_balance: tokens(250_000),
            params: CurveParameters {
                virtual_supply: Amount::ZERO,
                virtual_balance: Amount::ZERO,
                reserve_ratio: 250_000,
                buy_tribute_rate: Amount::from_units(2, 16),
                sell_tribute_rate: Amount::from_units(2, 16),
            },
        }
    }

    fn trader() -> Address {
        named_address("trader")
    }

    #[tokio::test]
    async fn test_approval_must_be_reset_first() {
        let chain = SandboxChain::new(setup());
        let signer = chain.signer(trader());
        let spender = chain.deployment().market_maker;

        let first = signer.approve(spender, tokens(50)).await.unwrap();
        let second = signer.approve(spender, tokens(100)).await.unwrap();

        assert!(signer.transaction_receipt(first).await.unwrap().unwrap().status);
        assert!(!signer.transaction_receipt(second).await.unwrap().unwrap().status);
        assert_eq!(chain.peek_allowance(trader(), spender), tokens(50));

        signer.approve(spender, Amount::ZERO).await.unwrap();
        signer.approve(spender, tokens(100)).await.unwrap();
        assert_eq!(chain.peek_allowance(trader(), spender), tokens(100));
    }

    #[tokio::test]
    async fn test_buy_order_settles() {
        let chain = SandboxChain::new(setup());
        let signer = chain.signer(trader());
        let spender = chain.deployment().market_maker;
        chain.faucet(TokenKind::Collateral, trader(), tokens(100));

        signer.approve(spender, tokens(100)).await.unwrap();
        let deposit = apply_tribute(tokens(100), Amount::from_units(2, 16));
        assert_eq!(deposit, tokens(98));
        let hash = signer
            .submit_order(trader(), deposit, ConversionDirection::ToBonded, Amount::ZERO)
            .await
            .unwrap();

        let receipt = signer.transaction_receipt(hash).await.unwrap().unwrap();
        let returned = converted_amount(&receipt, ConversionDirection::ToBonded).unwrap();
        assert!(!returned.is_zero());
        assert_eq!(chain.peek_balance(TokenKind::Bonded, trader()), returned);
        assert_eq!(chain.peek_balance(TokenKind::Collateral, trader()), Amount::ZERO);
        assert_eq!(chain.peek_allowance(trader(), spender), Amount::ZERO);
        assert_eq!(
            chain.peek_balance(TokenKind::Collateral, chain.deployment().beneficiary),
            tokens(2)
        );
        assert_eq!(
            chain.peek_balance(TokenKind::Collateral, chain.deployment().reserve),
            tokens(250_098)
        );
    }

    #[tokio::test]
    async fn test_buy_tribute_limited_by_allowance() {
        let chain = SandboxChain::new(setup());
        let signer = chain.signer(trader());
        let spender = chain.deployment().market_maker;
        chain.faucet(TokenKind::Collateral, trader(), tokens(100));

        signer.approve(spender, tokens(50)).await.unwrap();
        let hash = signer
            .submit_order(trader(), tokens(49), ConversionDirection::ToBonded, Amount::ZERO)
            .await
            .unwrap();
        assert!(signer.transaction_receipt(hash).await.unwrap().unwrap().status);
        assert_eq!(
            chain.peek_balance(TokenKind::Collateral, chain.deployment().beneficiary),
            tokens(1)
        );
        assert_eq!(chain.peek_balance(TokenKind::Collateral, trader()), tokens(50));

        let hash = signer
            .submit_order(trader(), tokens(1), ConversionDirection::ToBonded, Amount::ZERO)
            .await
            .unwrap();
        assert!(!signer.transaction_receipt(hash).await.unwrap().unwrap().status);
    }

    #[tokio::test]
    async fn test_order_below_minimum_reverts() {
        let chain = SandboxChain::new(setup());
        let signer = chain.signer(trader());
        chain.faucet(TokenKind::Bonded, trader(), tokens(10));

        let hash = signer
            .submit_order(trader(), tokens(10), ConversionDirection::FromBonded, tokens(1_000))
            .await
            .unwrap();
        let receipt = signer.transaction_receipt(hash).await.unwrap().unwrap();
        assert!(!receipt.status);
        assert_eq!(chain.peek_balance(TokenKind::Bonded, trader()), tokens(10));
    }

    #[tokio::test]
    async fn test_pending_until_mined() {
        let chain = SandboxChain::new(setup());
        chain.set_auto_mine(false);
        let signer = chain.signer(trader());

        let hash = signer.approve(chain.deployment().market_maker, tokens(1)).await.unwrap();
        assert!(signer.transaction_receipt(hash).await.unwrap().is_none());
        assert_eq!(chain.pending_count(), 1);

        assert_eq!(chain.mine_pending(), 1);
        assert!(signer.transaction_receipt(hash).await.unwrap().is_some());
        assert!(matches!(
            signer.transaction_receipt(TxHash::ZERO).await,
            Err(ChainError::UnknownTransaction(_))
        ));
    }

    #[tokio::test]
    async fn test_read_faults() {
        let chain = SandboxChain::new(setup());
        chain.fail_next_reads(2);
        assert!(chain.bonded_total_supply().await.is_err());
        assert!(chain.reserve_balance().await.is_err());
        assert_eq!(chain.reserve_balance().await.unwrap(), tokens(250_000));
    }
}
