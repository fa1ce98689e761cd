//! Quote assembly and the reactive quote feed behind the conversion form.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::amount::{format_units, parse_units, Amount, FormatOptions};
use super::cancel::{cancel_pair, CancelHandle};
use super::chain::{Address, ConversionDirection};
use super::error::QuoteError;
use super::oracle::{PriceOracle, PriceQuote};
use super::tribute::rate_to_pct;

/// Maximum adverse move accepted between quote and execution, in percent.
pub const SLIPPAGE_PCT: u64 = 1;

/// Fractional digits shown in the derived field.
const DISPLAY_DECIMALS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub source_amount: Amount,
    pub direction: ConversionDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionQuote {
    pub request: ConversionRequest,
    pub estimated_received: Amount,
    pub minimum_received_with_slippage: Amount,
    pub price_per_unit: Amount,
    pub tribute_retained: Amount,
    /// Tribute rate as a percentage string, e.g. "2".
    pub tribute_pct: String,
}

/// Apply the slippage tolerance to a tribute-adjusted price quote.
pub fn assemble_quote(price: &PriceQuote, slippage_pct: u64) -> ConversionQuote {
    let slippage = slippage_pct.min(100);
    let minimum = price
        .price
        .mul_div(Amount::from(100 - slippage), Amount::from(100u64))
        .unwrap_or(Amount::ZERO);

    ConversionQuote {
        request: ConversionRequest {
            source_amount: price.amount,
            direction: price.direction,
        },
        estimated_received: price.price,
        minimum_received_with_slippage: minimum,
        price_per_unit: price.price_per_unit,
        tribute_retained: price.tribute_retained,
        tribute_pct: rate_to_pct(price.tribute_rate),
    }
}

/// One-shot quote for a request.
pub async fn build_quote(
    oracle: &PriceOracle,
    request: ConversionRequest,
    slippage_pct: u64,
) -> Result<ConversionQuote, QuoteError> {
    let price = oracle.quote(request.source_amount, request.direction).await?;
    Ok(assemble_quote(&price, slippage_pct))
}

/// Which input the user is currently typing into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditingField {
    None,
    Source,
    Recipient,
}

/// What the form shows right now.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteView {
    pub direction: ConversionDirection,
    pub source_amount: Amount,
    pub source_input: String,
    pub recipient_amount: Amount,
    pub recipient_input: String,
    pub editing: EditingField,
    pub loading: bool,
    /// Absent while a fetch is in flight.
    pub quote: Option<ConversionQuote>,
}

impl QuoteView {
    fn empty(direction: ConversionDirection) -> Self {
        Self {
            direction,
            source_amount: Amount::ZERO,
            source_input: String::new(),
            recipient_amount: Amount::ZERO,
            recipient_input: String::new(),
            editing: EditingField::None,
            loading: false,
            quote: None,
        }
    }
}

struct FeedState {
    view: QuoteView,
    generation: u64,
    /// Last quote for the current generation, kept while the recipient field
    /// is being edited so it can be applied afterwards.
    latest: Option<ConversionQuote>,
}

/// Reactive quote state for one conversion form.
///
/// Every input change supersedes the previous request: its polling task is
/// cancelled and its generation retired, so a late result can never land on
/// the new input. Methods that start a fetch must run inside a Tokio runtime.
pub struct QuoteFeed {
    oracle: Arc<PriceOracle>,
    slippage_pct: u64,
    state: Arc<Mutex<FeedState>>,
    changes: watch::Sender<u64>,
    in_flight: Option<CancelHandle>,
}

/// Follows a [`QuoteFeed`] from outside, e.g. after the owning session's
/// lock has been released.
#[derive(Clone)]
pub struct FeedWatcher {
    state: Arc<Mutex<FeedState>>,
    changes: watch::Receiver<u64>,
}

impl FeedWatcher {
    pub async fn settled(mut self) -> QuoteView {
        loop {
            let view = lock(&self.state).view.clone();
            if !view.loading {
                return view;
            }
            if self.changes.changed().await.is_err() {
                return view;
            }
        }
    }
}

fn lock(state: &Mutex<FeedState>) -> MutexGuard<'_, FeedState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QuoteFeed {
    pub fn new(oracle: Arc<PriceOracle>, direction: ConversionDirection) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            oracle,
            slippage_pct: SLIPPAGE_PCT,
            state: Arc::new(Mutex::new(FeedState {
                view: QuoteView::empty(direction),
                generation: 0,
                latest: None,
            })),
            changes,
            in_flight: None,
        }
    }

    pub fn with_slippage_pct(mut self, slippage_pct: u64) -> Self {
        self.slippage_pct = slippage_pct;
        self
    }

    pub fn snapshot(&self) -> QuoteView {
        lock(&self.state).view.clone()
    }

    pub fn direction(&self) -> ConversionDirection {
        lock(&self.state).view.direction
    }

    fn decimals_for(&self, direction: ConversionDirection, source: bool) -> u8 {
        let kind = if source {
            direction.source_token()
        } else {
            direction.target_token()
        };
        self.oracle.tokens().token(kind).decimals
    }

    /// Typed source amount. Returns `false` (and keeps the previous value) when
    /// the text does not parse.
    pub fn on_source_input(&mut self, text: &str) -> bool {
        let direction = self.direction();
        let Some(amount) = parse_units(text, self.decimals_for(direction, true)) else {
            tracing::debug!("Ignoring unparseable source input {:?}", text);
            return false;
        };
        {
            let mut state = lock(&self.state);
            state.view.source_input = text.trim().to_string();
            state.view.source_amount = amount;
        }
        self.on_input_changed();
        true
    }

    /// Typed into the derived field. It becomes authoritative and incoming
    /// quotes stop overwriting it.
    pub fn on_recipient_input(&mut self, text: &str) -> bool {
        let direction = self.direction();
        let Some(amount) = parse_units(text, self.decimals_for(direction, false)) else {
            return false;
        };
        let mut state = lock(&self.state);
        state.view.editing = EditingField::Recipient;
        state.view.recipient_input = text.trim().to_string();
        state.view.recipient_amount = amount;
        drop(state);
        self.notify();
        true
    }

    /// Focus changes. Focused fields show raw digits, blurred ones get
    /// thousands separators. Leaving the recipient field hands authority back
    /// to the source amount and applies the latest quote.
    pub fn set_editing(&mut self, field: EditingField) {
        let direction = self.direction();
        let source_decimals = self.decimals_for(direction, true);
        let target_decimals = self.decimals_for(direction, false);

        let mut state = lock(&self.state);
        let was_recipient = state.view.editing == EditingField::Recipient;
        state.view.editing = field;
        state.view.source_input = format_units(
            state.view.source_amount,
            source_decimals,
            FormatOptions {
                truncate_to: None,
                commas: field != EditingField::Source,
            },
        );
        if field == EditingField::Recipient {
            state.view.recipient_input = format_units(
                state.view.recipient_amount,
                target_decimals,
                FormatOptions::default(),
            );
        }
        if was_recipient && field != EditingField::Recipient {
            if let Some(quote) = state.latest.clone() {
                apply_quote(&mut state.view, quote, target_decimals);
            }
        }
        drop(state);
        self.notify();
    }

    /// Switching the asset pair drops every derived value.
    pub fn on_pair_changed(&mut self, direction: ConversionDirection) {
        self.cancel_in_flight();
        let mut state = lock(&self.state);
        state.generation += 1;
        state.view = QuoteView::empty(direction);
        state.latest = None;
        drop(state);
        self.notify();
    }

    /// Recompute against freshly read curve parameters.
    pub fn on_tick(&mut self) {
        self.on_input_changed();
    }

    /// Clear inputs, keeping the direction ("return home").
    pub fn reset(&mut self) {
        let direction = self.direction();
        self.on_pair_changed(direction);
    }

    /// Wait until the current request has published (or nothing is loading).
    pub async fn settled(&self) -> QuoteView {
        self.watcher().settled().await
    }

    /// A handle that can wait for the feed to settle without borrowing it.
    pub fn watcher(&self) -> FeedWatcher {
        FeedWatcher {
            state: self.state.clone(),
            changes: self.changes.subscribe(),
        }
    }

    fn notify(&self) {
        let generation = lock(&self.state).generation;
        self.changes.send_replace(generation);
    }

    fn cancel_in_flight(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.cancel();
        }
    }

    fn on_input_changed(&mut self) {
        self.cancel_in_flight();

        let (generation, request) = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.view.loading = true;
            state.view.quote = None;
            state.latest = None;
            (
                state.generation,
                ConversionRequest {
                    source_amount: state.view.source_amount,
                    direction: state.view.direction,
                },
            )
        };
        self.notify();

        let (handle, token) = cancel_pair();
        let oracle = self.oracle.clone();
        let state = self.state.clone();
        let changes = self.changes.clone();
        let slippage_pct = self.slippage_pct;
        let target_decimals = self.decimals_for(request.direction, false);

        tokio::spawn(async move {
            let Some(price) = oracle
                .quote_until_ready(request.source_amount, request.direction, &token)
                .await
            else {
                return;
            };

            let mut guard = lock(&state);
            // superseded while the last read was in flight
            if guard.generation != generation || token.is_cancelled() {
                return;
            }
            let quote = assemble_quote(&price, slippage_pct);
            guard.view.loading = false;
            guard.latest = Some(quote.clone());
            if guard.view.editing == EditingField::Recipient {
                guard.view.quote = Some(quote);
            } else {
                apply_quote(&mut guard.view, quote, target_decimals);
            }
            drop(guard);
            changes.send_replace(generation);
        });

        self.in_flight = Some(handle);
    }
}

fn apply_quote(view: &mut QuoteView, quote: ConversionQuote, target_decimals: u8) {
    view.recipient_amount = quote.estimated_received;
    view.recipient_input = format_units(
        quote.estimated_received,
        target_decimals,
        FormatOptions {
            truncate_to: Some(DISPLAY_DECIMALS),
            commas: false,
        },
    );
    view.quote = Some(quote);
}

impl Drop for QuoteFeed {
    fn drop(&mut self) {
        self.cancel_in_flight();
    }
}

/// Reasons the convert button stays disabled. Not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmitBlocker {
    NoAccount,
    QuoteLoading,
    ZeroAmount,
    InsufficientBalance { balance: Amount, required: Amount },
}

pub fn submit_blockers(
    account: Option<Address>,
    view: &QuoteView,
    source_balance: Amount,
) -> Vec<SubmitBlocker> {
    let mut blockers = Vec::new();
    if account.is_none() {
        blockers.push(SubmitBlocker::NoAccount);
    }
    if view.loading || view.quote.is_none() {
        blockers.push(SubmitBlocker::QuoteLoading);
    }
    if view.source_amount.is_zero() {
        blockers.push(SubmitBlocker::ZeroAmount);
    }
    if source_balance < view.source_amount {
        blockers.push(SubmitBlocker::InsufficientBalance {
            balance: source_balance,
            required: view.source_amount,
        });
    }
    blockers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::chain::{CurveEvaluator, EvaluationError};
    use crate::engine::curve::BancorFormula;
    use crate::engine::oracle::tests::{params, pct, registry, tokens, FixedCurve, StaticMarket};
    use async_trait::async_trait;
    use std::time::Duration;

    fn price(amount: Amount, direction: ConversionDirection, out: Amount) -> PriceQuote {
        PriceQuote {
            amount,
            direction,
            price: out,
            price_per_unit: Amount::ZERO,
            tribute_retained: Amount::ZERO,
            tribute_rate: Amount::ZERO,
        }
    }

    fn oracle_with(curve: Arc<dyn CurveEvaluator>, buy: Amount, sell: Amount) -> Arc<PriceOracle> {
        let market = Arc::new(StaticMarket::new(params(buy, sell)));
        Arc::new(PriceOracle::new(market, curve, registry()).with_retry_every(Duration::from_millis(5)))
    }

    #[test]
    fn test_minimum_never_exceeds_estimate() {
        for raw in [0u64, 1, 99, 100, 101, 12_345, u64::MAX] {
            let p = price(Amount::from(1u64), ConversionDirection::ToBonded, Amount::from(raw));
            let q = assemble_quote(&p, SLIPPAGE_PCT);
            assert!(q.minimum_received_with_slippage <= q.estimated_received);
            if raw >= 100 {
                assert!(q.minimum_received_with_slippage < q.estimated_received);
            }
            let exact = assemble_quote(&p, 0);
            assert_eq!(exact.minimum_received_with_slippage, exact.estimated_received);
        }
    }

    #[test]
    fn test_slippage_floors() {
        let p = price(Amount::from(1u64), ConversionDirection::ToBonded, Amount::from(1001u64));
        assert_eq!(assemble_quote(&p, 1).minimum_received_with_slippage, Amount::from(990u64));
    }

    #[tokio::test]
    async fn test_exit_tribute_then_slippage() {
        let oracle = oracle_with(Arc::new(FixedCurve::new(tokens(1000))), pct(0), pct(2));
        let request = ConversionRequest {
            source_amount: tokens(10),
            direction: ConversionDirection::FromBonded,
        };
        let quote = build_quote(&oracle, request, SLIPPAGE_PCT).await.unwrap();

        assert_eq!(quote.estimated_received, tokens(980));
        // 970.2 tokens
        let expected_min = Amount::from_units(9702, 17);
        assert_eq!(quote.minimum_received_with_slippage, expected_min);
        assert_eq!(quote.tribute_retained, tokens(20));
        assert_eq!(quote.tribute_pct, "2");
    }

    #[tokio::test]
    async fn test_tribute_applied_before_slippage() {
        // raw 150: tribute first -> 147 -> floor(145.53) = 145
        //          slippage first -> 148 -> 148 - 2 = 146
        let oracle = oracle_with(Arc::new(FixedCurve::new(Amount::from(150u64))), pct(0), pct(2));
        let request = ConversionRequest {
            source_amount: Amount::from(5u64),
            direction: ConversionDirection::FromBonded,
        };
        let quote = build_quote(&oracle, request, SLIPPAGE_PCT).await.unwrap();
        assert_eq!(quote.estimated_received, Amount::from(147u64));
        assert_eq!(quote.minimum_received_with_slippage, Amount::from(145u64));
    }

    #[tokio::test]
    async fn test_estimate_monotonic_in_source_amount() {
        let oracle = oracle_with(Arc::new(BancorFormula), pct(1), pct(1));
        for direction in [ConversionDirection::ToBonded, ConversionDirection::FromBonded] {
            let mut last = Amount::ZERO;
            for n in [1u128, 5, 50, 500, 5_000, 50_000] {
                let request = ConversionRequest {
                    source_amount: tokens(n),
                    direction,
                };
                let quote = build_quote(&oracle, request, SLIPPAGE_PCT).await.unwrap();
                assert!(quote.estimated_received >= last);
                last = quote.estimated_received;
            }
        }
    }

    #[tokio::test]
    async fn test_feed_publishes_recipient_amount() {
        let oracle = oracle_with(Arc::new(FixedCurve::new(tokens(42))), pct(0), pct(0));
        let mut feed = QuoteFeed::new(oracle, ConversionDirection::ToBonded);

        assert!(feed.on_source_input("10"));
        assert!(feed.snapshot().loading);
        let view = feed.settled().await;
        assert!(!view.loading);
        assert_eq!(view.source_amount, tokens(10));
        assert_eq!(view.recipient_amount, tokens(42));
        assert_eq!(view.recipient_input, "42");
        assert_eq!(view.quote.unwrap().estimated_received, tokens(42));
    }

    #[tokio::test]
    async fn test_feed_keeps_previous_value_on_bad_input() {
        let oracle = oracle_with(Arc::new(FixedCurve::new(tokens(1))), pct(0), pct(0));
        let mut feed = QuoteFeed::new(oracle, ConversionDirection::ToBonded);

        assert!(feed.on_source_input("2.5"));
        feed.settled().await;
        assert!(!feed.on_source_input("-3"));
        assert!(!feed.on_source_input("abc"));
        assert!(!feed.on_source_input("1.0000000000000000001"));
        let view = feed.snapshot();
        assert_eq!(view.source_input, "2.5");
        assert_eq!(view.source_amount, Amount::from_units(25, 17));
    }

    #[tokio::test]
    async fn test_feed_does_not_overwrite_edited_recipient() {
        let oracle = oracle_with(Arc::new(FixedCurve::new(tokens(42))), pct(0), pct(0));
        let mut feed = QuoteFeed::new(oracle, ConversionDirection::ToBonded);

        assert!(feed.on_recipient_input("7"));
        assert!(feed.on_source_input("10"));
        let view = feed.settled().await;
        assert_eq!(view.editing, EditingField::Recipient);
        assert_eq!(view.recipient_amount, tokens(7));
        assert!(view.quote.is_some());

        feed.set_editing(EditingField::None);
        assert_eq!(feed.snapshot().recipient_amount, tokens(42));
    }

    #[tokio::test]
    async fn test_pair_change_resets_derived_values() {
        let oracle = oracle_with(Arc::new(FixedCurve::new(tokens(42))), pct(0), pct(0));
        let mut feed = QuoteFeed::new(oracle, ConversionDirection::ToBonded);

        feed.on_source_input("10");
        feed.settled().await;
        feed.on_pair_changed(ConversionDirection::FromBonded);

        let view = feed.snapshot();
        assert_eq!(view.direction, ConversionDirection::FromBonded);
        assert_eq!(view.source_amount, Amount::ZERO);
        assert_eq!(view.recipient_amount, Amount::ZERO);
        assert!(view.source_input.is_empty());
        assert!(view.recipient_input.is_empty());
        assert!(view.quote.is_none());
    }

    /// Doubles its input; the first deposit it sees is answered slowly.
    struct SlowFirstCurve {
        slow: Amount,
    }

    #[async_trait]
    impl CurveEvaluator for SlowFirstCurve {
        async fn purchase_return(
            &self,
            _supply: Amount,
            _balance: Amount,
            _ratio: u32,
            deposit: Amount,
        ) -> Result<Amount, EvaluationError> {
            if deposit == self.slow {
                tokio::time::sleep(Duration::from_millis(80)).await;
            }
            Ok(deposit.checked_mul(Amount::from(2u64)).unwrap_or(Amount::MAX))
        }

        async fn sale_return(
            &self,
            _supply: Amount,
            _balance: Amount,
            _ratio: u32,
            amount: Amount,
        ) -> Result<Amount, EvaluationError> {
            Ok(amount)
        }
    }

    #[tokio::test]
    async fn test_superseded_request_never_publishes() {
        let curve = Arc::new(SlowFirstCurve { slow: tokens(1) });
        let oracle = oracle_with(curve, pct(0), pct(0));
        let mut feed = QuoteFeed::new(oracle, ConversionDirection::ToBonded);

        feed.on_source_input("1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.on_source_input("3");
        let view = feed.settled().await;
        assert_eq!(view.recipient_amount, tokens(6));

        // the slow first request would have finished by now
        tokio::time::sleep(Duration::from_millis(120)).await;
        let view = feed.snapshot();
        assert_eq!(view.recipient_amount, tokens(6));
        assert_eq!(view.quote.unwrap().request.source_amount, tokens(3));
    }

    #[test]
    fn test_submit_blockers() {
        let mut view = QuoteView::empty(ConversionDirection::ToBonded);
        let blockers = submit_blockers(None, &view, Amount::ZERO);
        assert!(blockers.contains(&SubmitBlocker::NoAccount));
        assert!(blockers.contains(&SubmitBlocker::ZeroAmount));
        assert!(blockers.contains(&SubmitBlocker::QuoteLoading));

        view.source_amount = tokens(5);
        view.quote = Some(assemble_quote(
            &price(tokens(5), ConversionDirection::ToBonded, tokens(1)),
            SLIPPAGE_PCT,
        ));
        let blockers = submit_blockers(Some(Address::ZERO), &view, tokens(4));
        assert_eq!(
            blockers,
            vec![SubmitBlocker::InsufficientBalance {
                balance: tokens(4),
                required: tokens(5)
            }]
        );
        assert!(submit_blockers(Some(Address::ZERO), &view, tokens(5)).is_empty());
    }
}
