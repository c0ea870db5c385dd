//! Alpaca market-data stream protocol.
//!
//! Frames are JSON arrays. The server acknowledges the connection and the
//! `auth` action with `success` messages before any subscription is
//! accepted.

use serde_json::json;
use tracing::{debug, warn};

use super::models::StreamMessage;
use crate::models::{ConditionTable, DataKind, RealtimeRecord, RealtimeTickData, TradeContext};
use crate::websocket::StreamProtocol;
use crate::{ChartfeedError, Result};

/// The IEX feed is available on every Alpaca plan.
const FEED: &str = "iex";

#[derive(Debug, Clone)]
pub struct AlpacaStream {
    websocket_url: String,
    api_key: String,
    api_secret: String,
}

impl AlpacaStream {
    #[must_use]
    pub fn new(websocket_url: &str, api_key: &str, api_secret: &str) -> Self {
        Self {
            websocket_url: websocket_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    fn control_frame(action: &str, symbol: &str, kind: DataKind) -> serde_json::Value {
        match kind {
            DataKind::Trades => json!({ "action": action, "trades": [symbol] }),
            DataKind::BidAsk => json!({ "action": action, "quotes": [symbol] }),
        }
    }
}

impl StreamProtocol for AlpacaStream {
    fn name(&self) -> &'static str {
        "alpaca"
    }

    fn url(&self) -> String {
        format!("{}/{FEED}", self.websocket_url)
    }

    fn connected_ack(&self) -> Option<&'static str> {
        Some("connected")
    }

    fn auth_frame(&self) -> Option<serde_json::Value> {
        Some(json!({
            "action": "auth",
            "key": self.api_key,
            "secret": self.api_secret,
        }))
    }

    fn authenticated_ack(&self) -> Option<&'static str> {
        Some("authenticated")
    }

    fn verify_ack(&self, frame: &str, expected: &str) -> Result<()> {
        let messages: Vec<StreamMessage> = serde_json::from_str(frame)
            .map_err(|e| ChartfeedError::Handshake(format!("unreadable acknowledgement: {e}")))?;
        match messages.as_slice() {
            [StreamMessage::Success { msg }] if msg == expected => Ok(()),
            [StreamMessage::Error { code, msg }] => Err(ChartfeedError::Handshake(format!(
                "alpaca refused {expected}: {code} {msg}"
            ))),
            _ => Err(ChartfeedError::Handshake(format!(
                "expected {expected} acknowledgement, got {frame}"
            ))),
        }
    }

    fn subscribe_frames(&self, symbol: &str, kind: DataKind) -> Vec<serde_json::Value> {
        vec![Self::control_frame("subscribe", symbol, kind)]
    }

    fn unsubscribe_frames(&self, symbol: &str, kind: DataKind) -> Vec<serde_json::Value> {
        vec![Self::control_frame("unsubscribe", symbol, kind)]
    }

    fn decode(&self, frame: &str) -> Result<Vec<RealtimeRecord>> {
        let messages: Vec<StreamMessage> = serde_json::from_str(frame)?;
        let mut records = Vec::with_capacity(messages.len());

        for message in messages {
            match message {
                StreamMessage::Trade(trade) => {
                    let context =
                        TradeContext::from_conditions(ConditionTable::Alpaca, &trade.conditions);
                    records.push(RealtimeRecord::Trade {
                        symbol: trade.symbol,
                        tick: RealtimeTickData {
                            timestamp: trade.timestamp,
                            price: trade.price,
                            volume: trade.size,
                            context,
                        },
                    });
                }
                StreamMessage::Quote(quote) => records.push(RealtimeRecord::Quote {
                    symbol: quote.symbol.clone(),
                    bid_ask: quote.into(),
                }),
                StreamMessage::Subscription { trades, quotes } => {
                    debug!(?trades, ?quotes, "Alpaca subscription state");
                }
                StreamMessage::Error { code, msg } => {
                    warn!(code, %msg, "Alpaca stream error");
                }
                StreamMessage::Success { msg } => debug!(%msg, "Alpaca stream status"),
                StreamMessage::Other => {}
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stream() -> AlpacaStream {
        AlpacaStream::new("wss://stream.data.alpaca.markets/v2/", "key", "secret")
    }

    #[test]
    fn url_targets_iex_feed() {
        assert_eq!(stream().url(), "wss://stream.data.alpaca.markets/v2/iex");
    }

    #[test]
    fn handshake_acknowledgements() {
        let s = stream();
        assert!(
            s.verify_ack(r#"[{"T":"success","msg":"connected"}]"#, "connected")
                .is_ok()
        );
        assert!(
            s.verify_ack(r#"[{"T":"success","msg":"connected"}]"#, "authenticated")
                .is_err()
        );
        let err = s
            .verify_ack(r#"[{"T":"error","code":402,"msg":"auth failed"}]"#, "authenticated")
            .unwrap_err();
        assert!(err.to_string().contains("402"));
        assert!(s.verify_ack("not json", "connected").is_err());
    }

    #[test]
    fn control_frames() {
        let frames = stream().subscribe_frames("AAPL", DataKind::BidAsk);
        assert_eq!(frames, vec![json!({"action": "subscribe", "quotes": ["AAPL"]})]);
        let frames = stream().unsubscribe_frames("AAPL", DataKind::Trades);
        assert_eq!(frames, vec![json!({"action": "unsubscribe", "trades": ["AAPL"]})]);
    }

    #[test]
    fn decodes_trade_with_conditions() {
        let frame = r#"[{"T":"t","S":"AAPL","p":126.55,"s":1,"c":["@","I"],"t":"2021-02-22T15:51:44.208Z"},
                        {"T":"error","code":405,"msg":"symbol limit exceeded"}]"#;
        let records = stream().decode(frame).unwrap();
        assert_eq!(records.len(), 1);

        let RealtimeRecord::Trade { symbol, tick } = &records[0] else {
            panic!("expected trade");
        };
        assert_eq!(symbol, "AAPL");
        assert_eq!(tick.price, dec!(126.55));
        assert!(tick.context.is_odd_lot());
        assert!(!tick.context.updates_last());
        assert!(tick.context.updates_volume());
    }

    #[test]
    fn rejects_non_array_frames() {
        assert!(stream().decode(r#"{"T":"t"}"#).is_err());
    }
}
