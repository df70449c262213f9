//! Trading error taxonomy.
//!
//! Validation and precondition errors are returned to the caller verbatim
//! and produce no state change. `Conflict` is retried internally before
//! surfacing; `PersistenceFailure` aborts the whole submission.

use uuid::Uuid;

use crate::db::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum TradingError {
    #[error("unknown bond: {0}")]
    UnknownInstrument(Uuid),

    #[error("bond {0} is not open for trading")]
    InstrumentNotTradable(Uuid),

    #[error("unknown user: {0}")]
    UnknownUser(Uuid),

    #[error("invalid price: {0}")]
    BadPrice(String),

    #[error("invalid quantity: {0}")]
    BadQuantity(String),

    #[error("insufficient holdings for sell order")]
    InsufficientHoldings,

    #[error("order is not cancellable")]
    NotCancellable,

    #[error("order belongs to another user")]
    NotOwner,

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("write conflict on ledger rows")]
    Conflict,

    #[error("internal error: {0}")]
    InternalError(String),
}

impl TradingError {
    /// Stable wire code surfaced in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TradingError::UnknownInstrument(_) => "UNKNOWN_INSTRUMENT",
            TradingError::InstrumentNotTradable(_) => "INSTRUMENT_NOT_TRADABLE",
            TradingError::UnknownUser(_) => "UNKNOWN_USER",
            TradingError::BadPrice(_) => "BAD_PRICE",
            TradingError::BadQuantity(_) => "BAD_QUANTITY",
            TradingError::InsufficientHoldings => "INSUFFICIENT_HOLDINGS",
            TradingError::NotCancellable => "NOT_CANCELLABLE",
            TradingError::NotOwner => "NOT_OWNER",
            TradingError::PersistenceFailure(_) => "PERSISTENCE_FAILURE",
            TradingError::Conflict => "CONFLICT",
            TradingError::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<StoreError> for TradingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => TradingError::Conflict,
            other => TradingError::PersistenceFailure(other.to_string()),
        }
    }
}
