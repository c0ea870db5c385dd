//! Multi-broker market data core for candlestick charting.
//!
//! Brokers (Alpaca, Finnhub) are driven through one [`broker::Broker`]
//! contract of request/response channel workers. Realtime trades and quotes
//! fan out per symbol through bounded drop-oldest channels, and
//! [`aggregation`] folds them into candle series at a
//! [`resolution::CandleResolution`].

pub mod aggregation;
pub mod broker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod figi;
pub mod models;
pub mod rate_limit;
pub mod realtime;
pub mod resolution;
pub mod websocket;

pub use error::{ChartfeedError, Result};
