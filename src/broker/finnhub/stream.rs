//! Finnhub trade stream protocol.
//!
//! The token travels in the URL, so there is no handshake beyond the
//! WebSocket upgrade. Only trades are published.

use serde_json::json;
use tracing::{debug, warn};

use super::models::StreamMessage;
use crate::models::{ConditionTable, DataKind, RealtimeRecord, RealtimeTickData, TradeContext};
use crate::websocket::StreamProtocol;
use crate::Result;

#[derive(Debug, Clone)]
pub struct FinnhubStream {
    websocket_url: String,
    token: String,
}

impl FinnhubStream {
    #[must_use]
    pub fn new(websocket_url: &str, token: &str) -> Self {
        Self {
            websocket_url: websocket_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

impl StreamProtocol for FinnhubStream {
    fn name(&self) -> &'static str {
        "finnhub"
    }

    fn url(&self) -> String {
        format!("{}/?token={}", self.websocket_url, self.token)
    }

    fn subscribe_frames(&self, symbol: &str, kind: DataKind) -> Vec<serde_json::Value> {
        match kind {
            DataKind::Trades => vec![json!({ "type": "subscribe", "symbol": symbol })],
            DataKind::BidAsk => Vec::new(),
        }
    }

    fn unsubscribe_frames(&self, symbol: &str, kind: DataKind) -> Vec<serde_json::Value> {
        match kind {
            DataKind::Trades => vec![json!({ "type": "unsubscribe", "symbol": symbol })],
            DataKind::BidAsk => Vec::new(),
        }
    }

    fn decode(&self, frame: &str) -> Result<Vec<RealtimeRecord>> {
        match serde_json::from_str::<StreamMessage>(frame)? {
            StreamMessage::Trade { data } => Ok(data
                .into_iter()
                .filter_map(|trade| {
                    let Some(timestamp) = trade.timestamp() else {
                        warn!(symbol = %trade.symbol, ms = trade.timestamp_ms, "Dropping trade with invalid timestamp");
                        return None;
                    };
                    let context = TradeContext::from_conditions(
                        ConditionTable::Finnhub,
                        trade.conditions.unwrap_or_default(),
                    );
                    Some(RealtimeRecord::Trade {
                        symbol: trade.symbol,
                        tick: RealtimeTickData {
                            timestamp,
                            price: trade.price,
                            volume: trade.volume,
                            context,
                        },
                    })
                })
                .collect()),
            StreamMessage::Ping => Ok(Vec::new()),
            StreamMessage::Error { msg } => {
                warn!(%msg, "Finnhub stream error");
                Ok(Vec::new())
            }
            StreamMessage::Other => {
                debug!(frame, "Ignoring Finnhub frame");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stream() -> FinnhubStream {
        FinnhubStream::new("wss://ws.finnhub.io/", "tok")
    }

    #[test]
    fn token_goes_into_url() {
        assert_eq!(stream().url(), "wss://ws.finnhub.io/?token=tok");
        assert!(stream().auth_frame().is_none());
    }

    #[test]
    fn only_trades_have_control_frames() {
        assert_eq!(
            stream().subscribe_frames("AAPL", DataKind::Trades),
            vec![json!({"type": "subscribe", "symbol": "AAPL"})]
        );
        assert!(stream().subscribe_frames("AAPL", DataKind::BidAsk).is_empty());
    }

    #[test]
    fn decodes_trade_batch() {
        let frame = r#"{"data":[{"c":["1","12"],"p":7296.89,"s":"AAPL","t":1575526691134,"v":0.011467},
                                {"p":7291.2,"s":"MSFT","t":1575526691200,"v":3}],"type":"trade"}"#;
        let records = stream().decode(frame).unwrap();
        assert_eq!(records.len(), 2);

        let RealtimeRecord::Trade { symbol, tick } = &records[0] else {
            panic!("expected trade");
        };
        assert_eq!(symbol, "AAPL");
        assert_eq!(tick.price, dec!(7296.89));
        assert_eq!(tick.timestamp.timestamp_millis(), 1_575_526_691_134);
        assert_eq!(records[1].symbol(), "MSFT");
    }

    #[test]
    fn pings_and_errors_carry_nothing() {
        assert!(stream().decode(r#"{"type":"ping"}"#).unwrap().is_empty());
        assert!(
            stream()
                .decode(r#"{"type":"error","msg":"Invalid symbol"}"#)
                .unwrap()
                .is_empty()
        );
    }
}
