//! Conversion sessions
//!
//! Each session owns a fresh sandbox chain with a funded account, plus the
//! quote feed and step planner that drive its conversion form.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use super::chain::{named_address, MarketSetup, SandboxChain};
use crate::config::ConverterConfig;
use crate::engine::amount::{format_units, Amount, FormatOptions};
use crate::engine::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::engine::chain::{Address, ConversionDirection, MarketReader, TokenKind, TokenRegistry};
use crate::engine::curve::{BancorFormula, CurveParameters};
use crate::engine::error::{ChainError, PlanError, QuoteError};
use crate::engine::oracle::PriceOracle;
use crate::engine::planner::{OrderReceipt, OrderRequest, StepPlanner};
use crate::engine::quote::{submit_blockers, QuoteFeed, SubmitBlocker};

// Initial balances for new sessions, in whole tokens
const INITIAL_COLLATERAL: u128 = 10_000;
const INITIAL_BONDED: u128 = 1_000;

// Market maker state every session starts from, in whole tokens
const GENESIS_SUPPLY: u128 = 1_000_000;
const GENESIS_RESERVE: u128 = 250_000;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("conversion blocked: {0:?}")]
    Blocked(Vec<SubmitBlocker>),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub bonded_supply: Amount,
    pub reserve_balance: Amount,
    pub params: CurveParameters,
    /// Collateral paid per bonded token, tribute included.
    pub buy_price_per_unit: Amount,
    /// Collateral received per bonded token, tribute included.
    pub sell_price_per_unit: Amount,
}

/// A sandbox account converting against its own market.
pub struct ConversionSession {
    pub created_at: std::time::Instant,
    pub account: Address,
    pub chain: SandboxChain,
    pub oracle: Arc<PriceOracle>,
    pub feed: QuoteFeed,
    pub planner: Arc<StepPlanner>,
    conversion: Option<CancelHandle>,
    history: Arc<Mutex<Vec<OrderReceipt>>>,
}

fn genesis(config: &ConverterConfig) -> MarketSetup {
    MarketSetup {
        bonded_supply: Amount::from_units(GENESIS_SUPPLY, config.bonded.decimals),
        reserve_balance: Amount::from_units(GENESIS_RESERVE, config.collateral.decimals),
        params: CurveParameters {
            virtual_supply: Amount::ZERO,
            virtual_balance: Amount::ZERO,
            reserve_ratio: config.connector_weight(),
            buy_tribute_rate: config.buy_tribute_rate,
            sell_tribute_rate: config.sell_tribute_rate,
        },
    }
}

impl ConversionSession {
    pub fn new(session_id: &str, config: &ConverterConfig) -> Self {
        let chain = SandboxChain::new(genesis(config));
        let account = named_address(&format!("session-{}", session_id));
        chain.faucet(
            TokenKind::Collateral,
            account,
            Amount::from_units(INITIAL_COLLATERAL, config.collateral.decimals),
        );
        chain.faucet(
            TokenKind::Bonded,
            account,
            Amount::from_units(INITIAL_BONDED, config.bonded.decimals),
        );

        let tokens = Arc::new(TokenRegistry::new(
            config.collateral.clone(),
            config.bonded.clone(),
        ));
        let oracle = Arc::new(
            PriceOracle::new(Arc::new(chain.clone()), Arc::new(BancorFormula), tokens)
                .with_retry_every(config.price_retry),
        );
        let planner = Arc::new(
            StepPlanner::new(Arc::new(chain.signer(account)))
                .with_reveal_delay(config.reveal_delay)
                .with_receipt_poll(config.receipt_poll),
        );

        Self {
            created_at: std::time::Instant::now(),
            account,
            feed: QuoteFeed::new(oracle.clone(), ConversionDirection::ToBonded),
            chain,
            oracle,
            planner,
            conversion: None,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn tokens(&self) -> &TokenRegistry {
        self.oracle.tokens()
    }

    pub async fn balance(&self, token: TokenKind) -> Result<Amount, ChainError> {
        self.chain.balance_of(token, self.account).await
    }

    pub async fn market(&self) -> Result<MarketSnapshot, QuoteError> {
        let buy = self.oracle.quote(Amount::ZERO, ConversionDirection::ToBonded).await?;
        let sell = self.oracle.quote(Amount::ZERO, ConversionDirection::FromBonded).await?;
        Ok(MarketSnapshot {
            bonded_supply: self.chain.bonded_total_supply().await?,
            reserve_balance: self.chain.reserve_balance().await?,
            params: self.chain.curve_parameters().await?,
            // one collateral unit buys `buy.price_per_unit / 1e18` bonded tokens
            buy_price_per_unit: invert(buy.price_per_unit),
            sell_price_per_unit: sell.price_per_unit,
        })
    }

    /// Reasons the current form cannot be submitted.
    pub async fn blockers(&self) -> Vec<SubmitBlocker> {
        let view = self.feed.snapshot();
        let source = view.direction.source_token();
        let balance = match self.balance(source).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!("Balance read failed, using last known ledger value: {}", e);
                self.chain.peek_balance(source, self.account)
            }
        };
        submit_blockers(Some(self.account), &view, balance)
    }

    /// Fill the source field with the whole spendable balance.
    pub async fn convert_all(&mut self) -> Result<bool, ChainError> {
        let direction = self.feed.direction();
        let balance = self.balance(direction.source_token()).await?;
        let decimals = self.tokens().token(direction.source_token()).decimals;
        let text = format_units(balance, decimals, FormatOptions::default());
        Ok(self.feed.on_source_input(&text))
    }

    /// Start executing the quoted conversion in the background.
    pub async fn start_conversion(&mut self) -> Result<OrderRequest, SessionError> {
        // one conversion per visit to the form; `return_home` clears it
        if self.conversion.is_some() || self.planner.is_running() {
            return Err(PlanError::Busy.into());
        }
        let blockers = self.blockers().await;
        if !blockers.is_empty() {
            return Err(SessionError::Blocked(blockers));
        }
        let quote = self
            .feed
            .snapshot()
            .quote
            .ok_or_else(|| SessionError::Blocked(vec![SubmitBlocker::QuoteLoading]))?;

        let order = OrderRequest::from_quote(self.account, self.chain.deployment().market_maker, &quote);
        tracing::info!(
            "Starting {:?} conversion of {} (minimum return {})",
            order.direction,
            order.amount,
            order.minimum_return
        );

        let (handle, token) = cancel_pair();
        let planner = self.planner.clone();
        let history = self.history.clone();
        tokio::spawn(async move {
            match planner.run(order, &token).await {
                Ok(receipt) => {
                    history
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(receipt);
                }
                Err(e) => tracing::warn!("Conversion ended without settling: {}", e),
            }
        });
        self.conversion = Some(handle);
        Ok(order)
    }

    /// Fires when the running conversion is cancelled. `None` when nothing
    /// was started since the form was last cleared.
    pub fn conversion_token(&self) -> Option<CancelToken> {
        self.conversion.as_ref().map(CancelHandle::token)
    }

    /// Stop at the next step boundary. Transactions already signed still land.
    pub fn cancel_conversion(&mut self) {
        if let Some(handle) = self.conversion.take() {
            handle.cancel();
        }
    }

    /// Back to an empty form once the last conversion has finished.
    pub fn return_home(&mut self) -> Result<(), PlanError> {
        self.planner.reset()?;
        self.conversion = None;
        self.feed.reset();
        Ok(())
    }

    pub fn history(&self) -> Vec<OrderReceipt> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// `10^36 / x`, i.e. the reciprocal of an 18-decimal price.
fn invert(price: Amount) -> Amount {
    if price.is_zero() {
        return Amount::ZERO;
    }
    let one = Amount::one_unit(18);
    one.mul_div(one, price).unwrap_or(Amount::ZERO)
}

/// Session store for managing multiple conversion sessions
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<RwLock<ConversionSession>>>>,
    config: ConverterConfig,
}

impl SessionManager {
    pub fn new(config: ConverterConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub async fn create_session(&self) -> Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = ConversionSession::new(&session_id, &self.config);
        tracing::info!("Created session {} for account {}", session_id, session.account);

        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.clone(), Arc::new(RwLock::new(session)));

        Ok(session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<RwLock<ConversionSession>>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Replace a session's chain and form with a fresh one.
    pub async fn reset_session(&self, session_id: &str) -> Option<Arc<RwLock<ConversionSession>>> {
        let session = self.get_session(session_id).await?;
        {
            let mut guard = session.write().await;
            guard.cancel_conversion();
            *guard = ConversionSession::new(session_id, &self.config);
        }
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::planner::PlannerState;
    use std::time::Duration;

    fn fast_config() -> ConverterConfig {
        ConverterConfig {
            price_retry: Duration::from_millis(5),
            reveal_delay: Duration::ZERO,
            receipt_poll: Duration::from_millis(1),
            ..ConverterConfig::default()
        }
    }

    async fn wait_settled(session: &ConversionSession) -> PlannerState {
        let mut rx = session.planner.subscribe();
        loop {
            let state = rx.borrow_and_update().state.clone();
            if matches!(state, PlannerState::Done { .. } | PlannerState::Failed { .. }) {
                return state;
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_new_session_is_funded() {
        let session = ConversionSession::new("a", &fast_config());
        assert_eq!(
            session.balance(TokenKind::Collateral).await.unwrap(),
            Amount::from_units(INITIAL_COLLATERAL, 18)
        );
        assert_eq!(
            session.balance(TokenKind::Bonded).await.unwrap(),
            Amount::from_units(INITIAL_BONDED, 18)
        );
    }

    #[tokio::test]
    async fn test_market_snapshot_prices() {
        let session = ConversionSession::new("m", &fast_config());
        let market = session.market().await.unwrap();
        assert_eq!(market.params.reserve_ratio, 250_000);
        // spot price is 1 collateral per bonded token; tribute makes buying dearer
        assert!(market.buy_price_per_unit > Amount::one_unit(18));
        assert!(market.sell_price_per_unit < Amount::one_unit(18));
    }

    #[tokio::test]
    async fn test_blocked_without_quote() {
        let mut session = ConversionSession::new("b", &fast_config());
        let err = session.start_conversion().await.unwrap_err();
        match err {
            SessionError::Blocked(blockers) => {
                assert!(blockers.contains(&SubmitBlocker::ZeroAmount));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_convert_all_then_buy() {
        let mut session = ConversionSession::new("c", &fast_config());
        assert!(session.convert_all().await.unwrap());
        let view = session.feed.settled().await;
        assert_eq!(view.source_amount, Amount::from_units(INITIAL_COLLATERAL, 18));

        let order = session.start_conversion().await.unwrap();
        let receipt = match wait_settled(&session).await {
            PlannerState::Done { receipt } => receipt,
            other => panic!("conversion failed: {:?}", other),
        };
        assert!(receipt.converted_amount >= order.minimum_return);

        // history is appended once the background task returns
        for _ in 0..100 {
            if !session.history().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.history(), vec![receipt]);
        assert_eq!(
            session.balance(TokenKind::Collateral).await.unwrap(),
            Amount::ZERO
        );

        session.return_home().unwrap();
        assert!(session.feed.snapshot().source_input.is_empty());
    }

    #[tokio::test]
    async fn test_manager_sessions_are_isolated() {
        let manager = SessionManager::new(fast_config());
        let a = manager.create_session().await.unwrap();
        let b = manager.create_session().await.unwrap();
        assert_ne!(a, b);

        let sa = manager.get_session(&a).await.unwrap();
        let sb = manager.get_session(&b).await.unwrap();
        let account = sa.read().await.account;
        sa.read()
            .await
            .chain
            .faucet(TokenKind::Collateral, account, Amount::from(1u64));
        assert_ne!(
            sa.read().await.balance(TokenKind::Collateral).await.unwrap(),
            sb.read().await.balance(TokenKind::Collateral).await.unwrap()
        );
        assert!(manager.get_session("missing").await.is_none());
    }
}
