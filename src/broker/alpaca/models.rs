//! Alpaca wire formats (REST v2 and the market-data stream).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{
    AssetData, CandleData, OrderData, OrderSide, OrderType, RealtimeBidAskData, TimeInForce,
};

/// An entry of `GET /assets`.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaAsset {
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub tradable: bool,
}

impl AlpacaAsset {
    /// Alpaca carries no Figi; it is filled in by the asset resolver.
    #[must_use]
    pub fn into_asset(self) -> AssetData {
        let mic = exchange_mic(&self.exchange);
        AssetData::new(self.symbol, self.name, mic, "USD", "", self.tradable)
    }
}

/// Maps Alpaca's exchange names to ISO 10383 market identifier codes.
#[must_use]
pub fn exchange_mic(exchange: &str) -> String {
    match exchange {
        "NASDAQ" => "XNAS",
        "NYSE" => "XNYS",
        "ARCA" => "ARCX",
        "AMEX" => "XASE",
        "BATS" => "BATS",
        "OTC" => "OTCM",
        other => other,
    }
    .to_string()
}

/// A bar as returned by the snapshot and bars endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaBar {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
}

impl From<AlpacaBar> for CandleData {
    fn from(bar: AlpacaBar) -> Self {
        Self {
            timestamp: bar.timestamp,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

/// `GET /stocks/{symbol}/snapshot`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub daily_bar: Option<AlpacaBar>,
    pub prev_daily_bar: Option<AlpacaBar>,
}

/// One page of `GET /stocks/{symbol}/bars`.
#[derive(Debug, Clone, Deserialize)]
pub struct BarsPage {
    /// `null` when the range holds no bars.
    #[serde(default)]
    pub bars: Option<Vec<AlpacaBar>>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub time_in_force: TimeInForce,
    #[serde(
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub limit_price: Option<Decimal>,
}

impl OrderRequest {
    #[must_use]
    pub fn new(
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty: quantity,
            side,
            order_type: order_type.as_str(),
            time_in_force,
            limit_price: order_type.limit_price(),
        }
    }
}

/// Answer to `POST /orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub filled_qty: Option<Decimal>,
}

impl From<OrderResponse> for OrderData {
    fn from(order: OrderResponse) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            filled_quantity: order.filled_qty.unwrap_or_default(),
        }
    }
}

/// One element of a stream frame. Frames are JSON arrays of these.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "T")]
pub enum StreamMessage {
    #[serde(rename = "success")]
    Success { msg: String },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: i64,
        #[serde(default)]
        msg: String,
    },
    #[serde(rename = "subscription")]
    Subscription {
        #[serde(default)]
        trades: Vec<String>,
        #[serde(default)]
        quotes: Vec<String>,
    },
    #[serde(rename = "t")]
    Trade(StreamTrade),
    #[serde(rename = "q")]
    Quote(StreamQuote),
    /// Bars, statuses and anything else not consumed here.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamTrade {
    #[serde(rename = "S")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "s")]
    pub size: Decimal,
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "c", default)]
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamQuote {
    #[serde(rename = "S")]
    pub symbol: String,
    #[serde(rename = "bp")]
    pub bid_price: Decimal,
    #[serde(rename = "bs")]
    pub bid_size: Decimal,
    #[serde(rename = "ap")]
    pub ask_price: Decimal,
    #[serde(rename = "as")]
    pub ask_size: Decimal,
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
}

impl From<StreamQuote> for RealtimeBidAskData {
    fn from(quote: StreamQuote) -> Self {
        Self {
            timestamp: quote.timestamp,
            bid_price: quote.bid_price,
            bid_size: quote.bid_size,
            ask_price: quote.ask_price,
            ask_size: quote.ask_size,
        }
    }
}
