//! Order Matching Module
//!
//! Continuous limit order book matching with price-time priority.
//!
//! # Architecture
//!
//! ```text
//! API Handler
//!   ↓
//! MatchingEngine (one serializer per bond)
//!   ├→ OrderBook (per bond, plan → commit → apply)
//!   ├→ HoldingsLedger (per-(user, bond) balances)
//!   ├→ TradingStore (one transaction per submission)
//!   └→ Broadcaster (post-commit event batch)
//! ```
//!
//! Matching is serialized per bond and purely in-memory; persistence commit
//! and the broadcaster hand-off are the only blocking operations on the hot
//! path. Events are only published after the commit succeeds.

pub mod book;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod types;

pub use book::OrderBook;
pub use engine::{MatchingEngine, SubmitOutcome};
pub use error::TradingError;
pub use ledger::HoldingsLedger;
pub use types::*;
