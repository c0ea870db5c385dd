//! Finnhub wire formats.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::{AssetData, CandleData, QuoteData};
use crate::{ChartfeedError, Result};

/// An entry of `GET /stock/symbol`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinnhubSymbol {
    pub symbol: String,
    #[serde(default)]
    pub display_symbol: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub figi: String,
    #[serde(default)]
    pub mic: String,
}

impl FinnhubSymbol {
    /// Finnhub lists only what it can serve, so every symbol counts as
    /// tradable.
    #[must_use]
    pub fn into_asset(self) -> AssetData {
        let symbol = if self.display_symbol.is_empty() {
            self.symbol
        } else {
            self.display_symbol
        };
        AssetData::new(symbol, self.description, self.mic, self.currency, self.figi, true)
    }
}

/// `GET /quote`. Unknown symbols come back with every field zero.
#[derive(Debug, Clone, Deserialize)]
pub struct FinnhubQuote {
    #[serde(rename = "c", default)]
    pub current: Decimal,
    #[serde(rename = "pc", default)]
    pub previous_close: Decimal,
    #[serde(rename = "dp", default)]
    pub delta_percentage: Option<Decimal>,
}

impl FinnhubQuote {
    /// Converts to a [`QuoteData`], keeping Finnhub's own percentage when
    /// it sends one.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::MissingData`] if both prices are zero.
    pub fn into_quote(self, symbol: &str) -> Result<QuoteData> {
        if self.current.is_zero() && self.previous_close.is_zero() {
            return Err(ChartfeedError::MissingData(format!("{symbol}: no quote")));
        }
        let mut quote = QuoteData::from_prices(self.current, self.previous_close);
        if let Some(delta) = self.delta_percentage {
            quote.delta_percentage = delta;
        }
        Ok(quote)
    }
}

/// `GET /stock/candle`: parallel arrays plus a status.
#[derive(Debug, Clone, Deserialize)]
pub struct FinnhubCandles {
    #[serde(rename = "s")]
    pub status: String,
    #[serde(rename = "t", default)]
    pub timestamps: Vec<i64>,
    #[serde(rename = "o", default)]
    pub open: Vec<Decimal>,
    #[serde(rename = "h", default)]
    pub high: Vec<Decimal>,
    #[serde(rename = "l", default)]
    pub low: Vec<Decimal>,
    #[serde(rename = "c", default)]
    pub close: Vec<Decimal>,
    #[serde(rename = "v", default)]
    pub volume: Vec<Decimal>,
}

impl FinnhubCandles {
    /// Zips the arrays into candles.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Provider`] for an unknown status and
    /// [`ChartfeedError::MalformedMessage`] if the arrays disagree in length
    /// or carry an out-of-range timestamp.
    pub fn into_candles(self) -> Result<Vec<CandleData>> {
        match self.status.as_str() {
            "no_data" => return Ok(Vec::new()),
            "ok" => {}
            other => {
                return Err(ChartfeedError::Provider(format!(
                    "finnhub candle status {other}"
                )));
            }
        }

        let len = self.timestamps.len();
        if [&self.open, &self.high, &self.low, &self.close, &self.volume]
            .iter()
            .any(|column| column.len() != len)
        {
            return Err(ChartfeedError::MalformedMessage(
                "finnhub candle arrays differ in length".to_string(),
            ));
        }

        (0..len)
            .map(|i| {
                let timestamp = DateTime::<Utc>::from_timestamp(self.timestamps[i], 0).ok_or_else(
                    || {
                        ChartfeedError::MalformedMessage(format!(
                            "candle timestamp {} out of range",
                            self.timestamps[i]
                        ))
                    },
                )?;
                Ok(CandleData {
                    timestamp,
                    open: self.open[i],
                    high: self.high[i],
                    low: self.low[i],
                    close: self.close[i],
                    volume: self.volume[i],
                })
            })
            .collect()
    }
}

/// One stream frame. Finnhub sends objects tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    Trade {
        #[serde(default)]
        data: Vec<StreamTrade>,
    },
    Ping,
    Error {
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamTrade {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "v", default)]
    pub volume: Decimal,
    /// Milliseconds since the epoch.
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "c", default)]
    pub conditions: Option<Vec<String>>,
}

impl StreamTrade {
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quote_keeps_reported_percentage() {
        let quote: FinnhubQuote =
            serde_json::from_str(r#"{"c":261.74,"d":-1.1,"dp":-0.4185,"h":263.31,"l":260.68,"o":261.07,"pc":262.84,"t":1582641000}"#)
                .unwrap();
        let quote = quote.into_quote("AAPL").unwrap();
        assert_eq!(quote.current_price, dec!(261.74));
        assert_eq!(quote.previous_close_price, dec!(262.84));
        assert_eq!(quote.delta_percentage, dec!(-0.4185));
    }

    #[test]
    fn quote_without_prices_is_missing() {
        let quote: FinnhubQuote =
            serde_json::from_str(r#"{"c":0,"d":null,"dp":null,"h":0,"l":0,"o":0,"pc":0,"t":0}"#)
                .unwrap();
        assert!(matches!(
            quote.into_quote("NOPE"),
            Err(ChartfeedError::MissingData(_))
        ));
    }

    #[test]
    fn candles_zip_parallel_arrays() {
        let raw: FinnhubCandles = serde_json::from_str(
            r#"{"c":[217.68,221.03],"h":[222.49,221.5],"l":[217.19,217.1402],"o":[221.03,218.55],"s":"ok","t":[1569297600,1569384000],"v":[33463820,24018876]}"#,
        )
        .unwrap();
        let candles = raw.into_candles().unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].timestamp.timestamp(), 1_569_384_000);
        assert_eq!(candles[1].low, dec!(217.1402));
        assert_eq!(candles[0].volume, dec!(33463820));
    }

    #[test]
    fn candles_no_data_is_empty() {
        let raw: FinnhubCandles = serde_json::from_str(r#"{"s":"no_data"}"#).unwrap();
        assert!(raw.into_candles().unwrap().is_empty());
    }

    #[test]
    fn candles_with_mismatched_arrays_are_rejected() {
        let raw: FinnhubCandles = serde_json::from_str(
            r#"{"c":[1],"h":[1],"l":[1],"o":[1,2],"s":"ok","t":[1569297600],"v":[1]}"#,
        )
        .unwrap();
        assert!(raw.into_candles().is_err());
    }

    #[test]
    fn symbol_prefers_display_symbol() {
        let raw: FinnhubSymbol = serde_json::from_str(
            r#"{"currency":"USD","description":"APPLE INC","displaySymbol":"AAPL","figi":"BBG000B9XRY4","mic":"XNAS","symbol":"AAPL","type":"Common Stock"}"#,
        )
        .unwrap();
        let asset = raw.into_asset();
        assert_eq!(asset.symbol, "AAPL");
        assert_eq!(asset.figi, "BBG000B9XRY4");
        assert_eq!(asset.mic, "XNAS");
    }
}
