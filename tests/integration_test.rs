//! Live API integration tests.
//!
//! These tests talk to the real provider endpoints and require network
//! access plus credentials in the environment (or keychain). Brokers without
//! credentials are skipped.
//! Run with: `cargo test --features integration-tests`

#![cfg(feature = "integration-tests")]

mod common;

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use chartfeed::broker::{Broker, BrokerKind, BrokerRegistry};
use chartfeed::config::read_config;
use chartfeed::credentials::Keychain;
use chartfeed::figi::StaticResolver;
use chartfeed::models::{CandleRequest, FindAssetRequest, QuoteRequest, SearchMode};
use chartfeed::resolution::CandleResolution;

use common::{apple, round_trip};

fn registry() -> BrokerRegistry {
    Keychain::default().export_to_env();
    let config = read_config().expect("Failed to read config");
    BrokerRegistry::from_config(&config, Arc::new(StaticResolver::default()))
        .expect("Failed to build brokers")
}

async fn for_each_broker<F, Fut>(mut check: F)
where
    F: FnMut(BrokerKind, Arc<dyn Broker>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let registry = registry();
    for kind in BrokerKind::ALL {
        match registry.get(kind) {
            Some(broker) => check(kind, broker).await,
            None => eprintln!("skipping {kind}: not configured"),
        }
    }
}

#[tokio::test]
async fn test_live_find_apple() {
    for_each_broker(|kind, broker| async move {
        let cancel = CancellationToken::new();
        let response = round_trip(
            |rx, tx| broker.find_asset(cancel.clone(), rx, tx),
            FindAssetRequest {
                query: "AAPL".to_string(),
                mode: SearchMode::Unambiguous,
            },
        )
        .await;
        assert!(response.error.is_none(), "{kind}: {:?}", response.error);
        assert_eq!(response.assets[0].symbol, "AAPL");
    })
    .await;
}

#[tokio::test]
async fn test_live_quote() {
    for_each_broker(|kind, broker| async move {
        let cancel = CancellationToken::new();
        let response = round_trip(
            |rx, tx| broker.query_quote(cancel.clone(), rx, tx),
            QuoteRequest { asset: apple() },
        )
        .await;
        let quote = response
            .quote
            .unwrap_or_else(|| panic!("{kind}: {:?}", response.error));
        assert!(quote.current_price > rust_decimal::Decimal::ZERO);
    })
    .await;
}

#[tokio::test]
async fn test_live_daily_candles() {
    for_each_broker(|kind, broker| async move {
        let now = Utc::now();
        let cancel = CancellationToken::new();
        let response = round_trip(
            |rx, tx| broker.query_candles(cancel.clone(), rx, tx),
            CandleRequest {
                asset: apple(),
                resolution: CandleResolution::Day,
                from: now - TimeDelta::days(30),
                to: now,
            },
        )
        .await;
        assert!(response.error.is_none(), "{kind}: {:?}", response.error);
        assert!(!response.candles.is_empty(), "{kind}: no candles");
        assert!(
            response
                .candles
                .windows(2)
                .all(|pair| pair[0].timestamp < pair[1].timestamp)
        );
    })
    .await;
}
