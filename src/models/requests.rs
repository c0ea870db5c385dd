//! Request/response pairs exchanged with broker workers.
//!
//! Every worker answers each request with exactly one response that echoes
//! the request's asset, so consumers can correlate them even when several
//! requests are in flight.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::asset::AssetData;
use super::candle::CandleData;
use super::order::{OrderData, OrderSide, OrderType, TimeInForce};
use super::quote::QuoteData;
use super::realtime::{DataKind, RealtimeBidAskData, RealtimeTickData};
use crate::ChartfeedError;
use crate::realtime::RealtimeReceiver;
use crate::resolution::CandleResolution;

/// How a search query must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Every asset whose symbol or name matches.
    Any,
    /// Exactly one asset with this symbol; anything else is an error.
    Unambiguous,
}

#[derive(Debug, Clone)]
pub struct FindAssetRequest {
    pub query: String,
    pub mode: SearchMode,
}

#[derive(Debug)]
pub struct FindAssetResponse {
    pub query: String,
    pub assets: Vec<AssetData>,
    pub error: Option<ChartfeedError>,
}

#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub asset: AssetData,
}

#[derive(Debug)]
pub struct QuoteResponse {
    pub asset: AssetData,
    pub quote: Option<QuoteData>,
    pub error: Option<ChartfeedError>,
}

#[derive(Debug, Clone)]
pub struct CandleRequest {
    pub asset: AssetData,
    pub resolution: CandleResolution,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CandleResponse {
    pub asset: AssetData,
    pub resolution: CandleResolution,
    /// Chronologically ordered bars.
    pub candles: Vec<CandleData>,
    pub error: Option<ChartfeedError>,
}

/// Whether a subscription request opens or closes a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub asset: AssetData,
    pub kind: DataKind,
    pub action: SubscriptionAction,
}

/// Receiving end of a realtime subscription.
#[derive(Debug)]
pub enum RealtimeStream {
    Trades(RealtimeReceiver<RealtimeTickData>),
    BidAsk(RealtimeReceiver<RealtimeBidAskData>),
}

#[derive(Debug)]
pub struct SubscriptionResponse {
    pub asset: AssetData,
    pub kind: DataKind,
    pub action: SubscriptionAction,
    /// Set for successful subscribe requests.
    pub stream: Option<RealtimeStream>,
    pub error: Option<ChartfeedError>,
}

#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub asset: AssetData,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub time_in_force: TimeInForce,
    /// Route to the broker's simulated (paper) account.
    pub paper: bool,
}

#[derive(Debug)]
pub struct TradeResponse {
    pub asset: AssetData,
    pub order: Option<OrderData>,
    pub error: Option<ChartfeedError>,
}
