//! Finnhub adapter tests against local mock REST and stream servers.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use chrono::{TimeDelta, TimeZone, Utc};
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chartfeed::ChartfeedError;
use chartfeed::broker::finnhub::FinnhubBroker;
use chartfeed::broker::{Broker, BrokerKind};
use chartfeed::models::{
    CandleRequest, DataKind, FindAssetRequest, OrderSide, OrderType, QuoteRequest, RealtimeStream,
    SearchMode, SubscriptionAction, SubscriptionRequest, TimeInForce, TradeRequest,
};
use chartfeed::resolution::CandleResolution;

use common::{TEST_TIMEOUT, apple, finnhub_config, next_json, round_trip, send_text};

const QUOTE_JSON: &str = include_str!("fixtures/finnhub_quote.json");
const CANDLES_JSON: &str = include_str!("fixtures/finnhub_candles.json");
const SYMBOLS_JSON: &str = include_str!("fixtures/finnhub_symbols.json");

type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

fn broker(http: &str, ws: &str) -> FinnhubBroker {
    FinnhubBroker::new(
        finnhub_config(http, ws),
        Duration::from_secs(5),
        common::resolver(),
    )
    .expect("Failed to build Finnhub broker")
}

#[test]
fn test_capabilities_are_data_only() {
    let broker = broker("http://127.0.0.1:9", "ws://127.0.0.1:9");
    assert_eq!(broker.kind(), BrokerKind::Finnhub);
    let caps = broker.capabilities();
    assert!(!caps.realtime_bid_ask);
    assert!(!caps.paper_trading);
    assert!(!caps.live_trading);
}

#[tokio::test]
async fn test_quote_keeps_provider_delta() {
    async fn quote(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> &'static str {
        assert_eq!(
            headers.get("X-Finnhub-Token").and_then(|v| v.to_str().ok()),
            Some("test-token")
        );
        seen.lock().unwrap().push(query);
        QUOTE_JSON
    }
    let seen: Seen = Arc::default();
    let http = common::spawn_http(
        Router::new()
            .route("/quote", get(quote))
            .with_state(Arc::clone(&seen)),
    )
    .await;
    let broker = broker(&http, "ws://unused");

    let cancel = CancellationToken::new();
    let response = round_trip(
        |rx, tx| broker.query_quote(cancel.clone(), rx, tx),
        QuoteRequest { asset: apple() },
    )
    .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    let quote = response.quote.expect("Missing quote");
    assert_eq!(quote.current_price, dec!(261.74));
    assert_eq!(quote.previous_close_price, dec!(262.84));
    assert_eq!(quote.delta_percentage, dec!(-0.4185));
    assert_eq!(seen.lock().unwrap()[0]["symbol"], "AAPL");
}

#[tokio::test]
async fn test_unknown_symbol_quote_is_missing_data() {
    let http = common::spawn_http(Router::new().route(
        "/quote",
        get(|| async { r#"{"c":0,"d":null,"dp":null,"h":0,"l":0,"o":0,"pc":0,"t":0}"# }),
    ))
    .await;
    let broker = broker(&http, "ws://unused");

    let cancel = CancellationToken::new();
    let response = round_trip(
        |rx, tx| broker.query_quote(cancel.clone(), rx, tx),
        QuoteRequest { asset: apple() },
    )
    .await;

    assert!(response.quote.is_none());
    assert!(matches!(response.error, Some(ChartfeedError::MissingData(_))));
}

#[tokio::test]
async fn test_candles_use_unix_seconds_and_resolution_code() {
    async fn candles(
        State(seen): State<Seen>,
        Query(query): Query<HashMap<String, String>>,
    ) -> &'static str {
        seen.lock().unwrap().push(query);
        CANDLES_JSON
    }
    let seen: Seen = Arc::default();
    let http = common::spawn_http(
        Router::new()
            .route("/stock/candle", get(candles))
            .with_state(Arc::clone(&seen)),
    )
    .await;
    let broker = broker(&http, "ws://unused");

    let from = Utc.with_ymd_and_hms(2019, 9, 24, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2019, 9, 27, 0, 0, 0).unwrap();
    let cancel = CancellationToken::new();
    let response = round_trip(
        |rx, tx| broker.query_candles(cancel.clone(), rx, tx),
        CandleRequest {
            asset: apple(),
            resolution: CandleResolution::Day,
            from,
            to,
        },
    )
    .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    assert_eq!(response.candles.len(), 3);
    assert_eq!(
        response.candles[0].timestamp,
        Utc.with_ymd_and_hms(2019, 9, 24, 4, 0, 0).unwrap()
    );
    assert_eq!(response.candles[2].close, dec!(219.89));

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0]["symbol"], "AAPL");
    assert_eq!(seen[0]["resolution"], "D");
    assert_eq!(seen[0]["from"], from.timestamp().to_string());
    assert_eq!(seen[0]["to"], to.timestamp().to_string());
}

#[tokio::test]
async fn test_candle_end_is_clamped_to_now() {
    async fn candles(
        State(seen): State<Seen>,
        Query(query): Query<HashMap<String, String>>,
    ) -> &'static str {
        seen.lock().unwrap().push(query);
        r#"{"s":"no_data"}"#
    }
    let seen: Seen = Arc::default();
    let http = common::spawn_http(
        Router::new()
            .route("/stock/candle", get(candles))
            .with_state(Arc::clone(&seen)),
    )
    .await;
    let broker = broker(&http, "ws://unused");

    let before = Utc::now();
    let cancel = CancellationToken::new();
    let response = round_trip(
        |rx, tx| broker.query_candles(cancel.clone(), rx, tx),
        CandleRequest {
            asset: apple(),
            resolution: CandleResolution::Minute60,
            from: before - TimeDelta::days(1),
            to: before + TimeDelta::days(7),
        },
    )
    .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    assert!(response.candles.is_empty());
    let to: i64 = seen.lock().unwrap()[0]["to"].parse().unwrap();
    assert!(to <= Utc::now().timestamp());
    assert!(to >= before.timestamp());
}

#[tokio::test]
async fn test_find_asset_searches_symbol_list() {
    async fn symbols(Query(query): Query<HashMap<String, String>>) -> &'static str {
        assert_eq!(query.get("exchange").map(String::as_str), Some("US"));
        SYMBOLS_JSON
    }
    let http = common::spawn_http(Router::new().route("/stock/symbol", get(symbols))).await;
    let broker = broker(&http, "ws://unused");

    let cancel = CancellationToken::new();
    let response = round_trip(
        |rx, tx| broker.find_asset(cancel.clone(), rx, tx),
        FindAssetRequest {
            query: "microsoft".to_string(),
            mode: SearchMode::Any,
        },
    )
    .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    assert_eq!(response.assets.len(), 1);
    assert_eq!(response.assets[0].symbol, "MSFT");
    assert_eq!(response.assets[0].figi, "BBG000BPH459");
}

#[tokio::test]
async fn test_orders_are_not_supported() {
    let broker = broker("http://127.0.0.1:9", "ws://unused");

    let cancel = CancellationToken::new();
    let response = round_trip(
        |rx, tx| broker.trade_asset(cancel.clone(), rx, tx),
        TradeRequest {
            asset: apple(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            quantity: dec!(1),
            time_in_force: TimeInForce::Day,
            paper: true,
        },
    )
    .await;

    assert_eq!(response.asset.symbol, "AAPL");
    assert!(response.order.is_none());
    assert!(matches!(response.error, Some(ChartfeedError::NotSupported(_))));
}

#[tokio::test]
async fn test_bid_ask_is_rejected_without_connecting() {
    // Nothing listens on port 9; a connection attempt would surface as a
    // connection error instead.
    let broker = broker("http://127.0.0.1:9", "ws://127.0.0.1:9");

    let cancel = CancellationToken::new();
    let response = round_trip(
        |rx, tx| broker.subscribe_data(cancel.clone(), rx, tx),
        SubscriptionRequest {
            asset: apple(),
            kind: DataKind::BidAsk,
            action: SubscriptionAction::Subscribe,
        },
    )
    .await;

    assert!(matches!(response.error, Some(ChartfeedError::NotSupported(_))));
}

#[tokio::test]
async fn test_stream_delivers_trades_and_unsubscribes() {
    let ws = common::spawn_ws(|mut ws| async move {
        let subscribe = next_json(&mut ws).await;
        assert_eq!(subscribe, serde_json::json!({"type": "subscribe", "symbol": "AAPL"}));
        send_text(&mut ws, r#"{"type":"ping"}"#).await;
        send_text(
            &mut ws,
            r#"{"data":[{"c":["1"],"p":189.5,"s":"AAPL","t":1700000000123,"v":25},{"p":1.0,"s":"TSLA","t":1700000000124,"v":1}],"type":"trade"}"#,
        )
        .await;

        let unsubscribe = next_json(&mut ws).await;
        assert_eq!(unsubscribe, serde_json::json!({"type": "unsubscribe", "symbol": "AAPL"}));
        // The next batch lets the reader close the released channel.
        send_text(&mut ws, r#"{"type":"ping"}"#).await;

        while let Some(Ok(msg)) = futures_util::StreamExt::next(&mut ws).await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    let broker = Arc::new(broker("http://127.0.0.1:9", &ws));

    let (req_tx, req_rx) = mpsc::channel(4);
    let (resp_tx, mut resp_rx) = mpsc::channel(4);
    let worker = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .subscribe_data(CancellationToken::new(), req_rx, resp_tx)
                .await;
        })
    };

    req_tx
        .send(SubscriptionRequest {
            asset: apple(),
            kind: DataKind::Trades,
            action: SubscriptionAction::Subscribe,
        })
        .await
        .unwrap();
    let response = resp_rx.recv().await.expect("Missing response");
    assert!(response.error.is_none(), "{:?}", response.error);
    let Some(RealtimeStream::Trades(mut ticks)) = response.stream else {
        panic!("expected a trade stream");
    };

    let tick = tokio::time::timeout(TEST_TIMEOUT, ticks.recv())
        .await
        .expect("Timed out waiting for trade")
        .expect("Trade stream closed");
    assert_eq!(tick.price, dec!(189.5));
    assert_eq!(tick.volume, dec!(25));
    assert_eq!(tick.timestamp.timestamp_millis(), 1_700_000_000_123);

    req_tx
        .send(SubscriptionRequest {
            asset: apple(),
            kind: DataKind::Trades,
            action: SubscriptionAction::Unsubscribe,
        })
        .await
        .unwrap();
    let response = resp_rx.recv().await.expect("Missing response");
    assert!(response.error.is_none(), "{:?}", response.error);
    assert!(response.stream.is_none());

    let closed = tokio::time::timeout(TEST_TIMEOUT, ticks.recv())
        .await
        .expect("Channel was not closed");
    assert!(closed.is_none());

    drop(req_tx);
    tokio::time::timeout(TEST_TIMEOUT, worker)
        .await
        .expect("Worker did not stop")
        .expect("Worker panicked");
}
