//! Engine error types

use super::chain::{EvaluationError, TxHash};

/// Failure reported by an external chain collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// Read call failed (node unreachable, rate limited, ...). Transient.
    #[error("read failed: {0}")]
    Read(String),

    /// Transaction refused before broadcast (signature rejected, estimation failed).
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxHash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CurveError {
    #[error("invalid curve parameters")]
    InvalidParameters,

    #[error("curve arithmetic overflow")]
    Overflow,

    #[error("sell amount exceeds supply")]
    ExceedsSupply,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QuoteError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Curve(#[from] CurveError),

    #[error("no decimals registered for {0}")]
    UnknownToken(String),
}

impl From<EvaluationError> for QuoteError {
    fn from(err: EvaluationError) -> Self {
        match err {
            EvaluationError::Chain(e) => QuoteError::Chain(e),
            EvaluationError::Curve(e) => QuoteError::Curve(e),
        }
    }
}

/// An order log whose topics or data do not fit the event's ABI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("cannot decode {event}: {reason}")]
    Decode { event: &'static str, reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReceiptError {
    #[error("could not fetch receipt: {0}")]
    Fetch(#[from] ChainError),

    #[error("transaction {0} reverted")]
    Reverted(TxHash),

    #[error("no {event} log in receipt of {hash}")]
    MissingEvent { event: &'static str, hash: TxHash },

    #[error("malformed order log: {0}")]
    Malformed(#[from] AbiError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    #[error("could not read allowance: {0}")]
    Allowance(ChainError),

    #[error("step {index} ({label}) failed: {source}")]
    Submission {
        index: usize,
        label: String,
        #[source]
        source: ChainError,
    },

    /// The order may already have settled; surfaced apart from submission failures.
    #[error("order receipt could not be decoded: {0}")]
    Receipt(#[from] ReceiptError),

    #[error("a conversion is already in progress")]
    Busy,

    #[error("no plan to execute")]
    NotPlanned,

    #[error("conversion cancelled")]
    Cancelled,
}
