//! Realtime tick and top-of-book models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade_context::TradeContext;

/// A single trade print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeTickData {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub volume: Decimal,
    pub context: TradeContext,
}

/// Best bid and ask at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeBidAskData {
    pub timestamp: DateTime<Utc>,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
}

/// Kind of realtime data a subscription delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Trades,
    BidAsk,
}

impl DataKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::BidAsk => "bid_ask",
        }
    }
}

/// A decoded realtime record addressed to one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeRecord {
    Trade {
        symbol: String,
        tick: RealtimeTickData,
    },
    Quote {
        symbol: String,
        bid_ask: RealtimeBidAskData,
    },
}

impl RealtimeRecord {
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade { symbol, .. } | Self::Quote { symbol, .. } => symbol,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Trade { tick, .. } => tick.timestamp,
            Self::Quote { bid_ask, .. } => bid_ask.timestamp,
        }
    }
}
