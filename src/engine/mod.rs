//! Conversion engine
//!
//! Pure quote and planning logic for a bonding-curve market maker. Everything
//! that touches a chain goes through the traits in [`chain`].

pub mod amount;
pub mod cancel;
pub mod chain;
pub mod curve;
pub mod error;
pub mod oracle;
pub mod planner;
pub mod quote;
pub mod receipt;
pub mod tribute;

pub use amount::{format_units, parse_units, Amount, FormatOptions};
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use chain::{
    Address, ConversionDirection, ConversionGateway, CurveEvaluator, MarketReader, TokenInfo,
    TokenKind, TokenRegistry, TransactionReceipt, TxHash,
};
pub use curve::{BancorFormula, CurveParameters};
pub use error::{ChainError, CurveError, PlanError, QuoteError, ReceiptError};
pub use oracle::{PriceOracle, PriceQuote};
pub use planner::{build_plan, OrderReceipt, OrderRequest, PlanProgress, StepPlan, StepPlanner};
pub use quote::{
    assemble_quote, build_quote, submit_blockers, ConversionQuote, ConversionRequest,
    EditingField, FeedWatcher, QuoteFeed, QuoteView, SubmitBlocker,
};
pub use receipt::extract_converted_amount;
