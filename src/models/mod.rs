//! Broker-independent data model.
//!
//! Every provider's wire format is normalized into these types. Prices and
//! quantities are [`rust_decimal::Decimal`] throughout; timestamps are UTC.

pub mod asset;
pub mod candle;
pub mod order;
pub mod quote;
pub mod realtime;
pub mod requests;
pub mod trade_context;

pub use asset::AssetData;
pub use candle::CandleData;
pub use order::{OrderData, OrderSide, OrderType, TimeInForce};
pub use quote::QuoteData;
pub use realtime::{DataKind, RealtimeBidAskData, RealtimeRecord, RealtimeTickData};
pub use requests::{
    CandleRequest, CandleResponse, FindAssetRequest, FindAssetResponse, QuoteRequest,
    QuoteResponse, RealtimeStream, SearchMode, SubscriptionAction, SubscriptionRequest,
    SubscriptionResponse, TradeRequest, TradeResponse,
};
pub use trade_context::{ConditionTable, TradeContext};
