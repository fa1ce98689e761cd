//! Price oracle
//!
//! Evaluates the bonding curve for a candidate input. Market state (bonded
//! supply, reserve balance, curve parameters) is read fresh on every attempt;
//! failed attempts are retried on a fixed interval until they succeed or the
//! caller cancels.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::amount::Amount;
use super::cancel::CancelToken;
use super::chain::{ConversionDirection, CurveEvaluator, MarketReader, TokenRegistry};
use super::error::{CurveError, QuoteError};
use super::tribute::apply_tribute;

pub const RETRY_EVERY: Duration = Duration::from_millis(5000);

/// Scale of `price_per_unit`.
const PRICE_SCALE: u128 = 1_000_000_000_000_000_000;

/// Tribute-adjusted curve output for one input amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub amount: Amount,
    pub direction: ConversionDirection,
    /// Output after tribute. Zero when `amount` is zero.
    pub price: Amount,
    /// `price * 10^18 / amount`; for a zero amount, taken from one whole source token.
    pub price_per_unit: Amount,
    pub tribute_retained: Amount,
    pub tribute_rate: Amount,
}

#[derive(Debug, Clone, Copy)]
struct Evaluation {
    output: Amount,
    tribute: Amount,
    rate: Amount,
}

pub struct PriceOracle {
    market: Arc<dyn MarketReader>,
    formula: Arc<dyn CurveEvaluator>,
    tokens: Arc<TokenRegistry>,
    retry_every: Duration,
}

impl PriceOracle {
    pub fn new(
        market: Arc<dyn MarketReader>,
        formula: Arc<dyn CurveEvaluator>,
        tokens: Arc<TokenRegistry>,
    ) -> Self {
        Self {
            market,
            formula,
            tokens,
            retry_every: RETRY_EVERY,
        }
    }

    pub fn with_retry_every(mut self, retry_every: Duration) -> Self {
        self.retry_every = retry_every;
        self
    }

    pub fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }

    /// One quote attempt.
    pub async fn quote(
        &self,
        amount: Amount,
        direction: ConversionDirection,
    ) -> Result<PriceQuote, QuoteError> {
        if amount.is_zero() {
            // the curve degenerates at zero; price one whole source token instead
            let decimals = self.tokens.token(direction.source_token()).decimals;
            let unit = Amount::checked_one_unit(decimals).ok_or(CurveError::Overflow)?;
            let sample = self.evaluate(unit, direction).await?;
            return Ok(PriceQuote {
                amount,
                direction,
                price: Amount::ZERO,
                price_per_unit: price_per_unit(sample.output, unit)?,
                tribute_retained: Amount::ZERO,
                tribute_rate: sample.rate,
            });
        }

        let evaluation = self.evaluate(amount, direction).await?;
        Ok(PriceQuote {
            amount,
            direction,
            price: evaluation.output,
            price_per_unit: price_per_unit(evaluation.output, amount)?,
            tribute_retained: evaluation.tribute,
            tribute_rate: evaluation.rate,
        })
    }

    /// Retry [`quote`](Self::quote) every `retry_every` until it succeeds.
    ///
    /// Returns `None` once `cancel` fires; a cancelled request never yields a
    /// result, even if its last attempt completed.
    pub async fn quote_until_ready(
        &self,
        amount: Amount,
        direction: ConversionDirection,
        cancel: &CancelToken,
    ) -> Option<PriceQuote> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            attempt += 1;

            match self.quote(amount, direction).await {
                Ok(quote) => {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    return Some(quote);
                }
                Err(e) => {
                    tracing::warn!(
                        "Price quote for {} ({:?}) failed on attempt {}: {} - retrying in {:?}",
                        amount,
                        direction,
                        attempt,
                        e,
                        self.retry_every
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_every) => {}
            }
        }
    }

    async fn evaluate(
        &self,
        amount: Amount,
        direction: ConversionDirection,
    ) -> Result<Evaluation, QuoteError> {
        let total_supply = self.market.bonded_total_supply().await?;
        let reserve_balance = self.market.reserve_balance().await?;
        let params = self.market.curve_parameters().await?;
        params.validate()?;

        let supply = total_supply
            .checked_add(params.virtual_supply)
            .ok_or(CurveError::Overflow)?;

        match direction {
            ConversionDirection::ToBonded => {
                let rate = params.buy_tribute_rate;
                let deposit = apply_tribute(amount, rate);
                let balance = reserve_balance
                    .checked_add(params.virtual_balance)
                    .ok_or(CurveError::Overflow)?;
                let output = self
                    .formula
                    .purchase_return(supply, balance, params.reserve_ratio, deposit)
                    .await?;
                Ok(Evaluation {
                    output,
                    tribute: amount.saturating_sub(deposit),
                    rate,
                })
            }
            ConversionDirection::FromBonded => {
                let rate = params.sell_tribute_rate;
                let balance = reserve_balance
                    .checked_add(params.virtual_balance)
                    .ok_or(CurveError::Overflow)?;
                let raw = self
                    .formula
                    .sale_return(supply, balance, params.reserve_ratio, amount)
                    .await?;
                let output = apply_tribute(raw, rate);
                Ok(Evaluation {
                    output,
                    tribute: raw.saturating_sub(output),
                    rate,
                })
            }
        }
    }
}

fn price_per_unit(price: Amount, amount: Amount) -> Result<Amount, CurveError> {
    price
        .mul_div(Amount::from_u128(PRICE_SCALE), amount)
        .ok_or(CurveError::Overflow)
}
