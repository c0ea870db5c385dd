//! Finnhub adapter.
//!
//! Finnhub serves US listings, quotes, candles and a trade stream. It does
//! not stream bid/ask and does not take orders. Two quotas apply: a hard
//! per-second cap enforced locally and the plan's per-minute quota reported
//! in `X-Ratelimit-*` headers.

pub mod models;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use self::models::{FinnhubCandles, FinnhubQuote, FinnhubSymbol};
use self::stream::FinnhubStream;
use super::http::RestClient;
use super::{
    Broker, BrokerKind, Capabilities, into_response_parts, log_request_error, search_assets, serve,
};
use crate::config::{AppConfig, FinnhubConfig};
use crate::figi::AssetResolver;
use crate::models::{
    AssetData, CandleData, CandleRequest, CandleResponse, FindAssetRequest, FindAssetResponse,
    QuoteData, QuoteRequest, QuoteResponse, SubscriptionRequest, SubscriptionResponse,
    TradeRequest, TradeResponse,
};
use crate::rate_limit::{FINNHUB_HEADERS, RateLimiter, RateLimiters};
use crate::resolution::CandleResolution;
use crate::websocket::RealtimeConnection;
use crate::{ChartfeedError, Result};

/// Free-plan per-minute quota, assumed until headers report otherwise.
const INITIAL_BUDGET: u32 = 60;

const CAPABILITIES: Capabilities = Capabilities {
    realtime_bid_ask: false,
    paper_trading: false,
    live_trading: false,
};

/// Builds the Finnhub adapter when the configuration carries a token.
///
/// # Errors
///
/// Returns an error if the adapter cannot be constructed.
pub fn factory(
    config: &AppConfig,
    resolver: Arc<dyn AssetResolver>,
) -> Result<Option<Arc<dyn Broker>>> {
    config
        .finnhub
        .as_ref()
        .map(|finnhub| {
            FinnhubBroker::new(finnhub.clone(), config.http_timeout, resolver)
                .map(|broker| Arc::new(broker) as Arc<dyn Broker>)
        })
        .transpose()
}

pub struct FinnhubBroker {
    config: FinnhubConfig,
    rest: RestClient,
    resolver: Arc<dyn AssetResolver>,
    assets: OnceCell<Vec<AssetData>>,
}

impl std::fmt::Debug for FinnhubBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinnhubBroker")
            .field("rest_url", &self.config.rest_url)
            .field("remaining", &self.rest.remaining())
            .finish_non_exhaustive()
    }
}

impl FinnhubBroker {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Config`] if the token cannot be sent as a
    /// header, or [`ChartfeedError::Http`] if the client cannot be built.
    pub fn new(
        config: FinnhubConfig,
        timeout: Duration,
        resolver: Arc<dyn AssetResolver>,
    ) -> Result<Self> {
        let mut token = HeaderValue::from_str(&config.api_key).map_err(|e| {
            ChartfeedError::Config(format!("FINNHUB_API_KEY is not a valid header value: {e}"))
        })?;
        token.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert("X-Finnhub-Token", token);

        let limiters = RateLimiters::new(vec![
            RateLimiter::per_second("finnhub-per-second", config.requests_per_second),
            RateLimiter::from_headers("finnhub", FINNHUB_HEADERS, INITIAL_BUDGET),
        ]);
        let rest = RestClient::new("finnhub", timeout, headers, limiters)?;

        Ok(Self {
            config,
            rest,
            resolver,
            assets: OnceCell::new(),
        })
    }

    async fn assets(&self, cancel: &CancellationToken) -> Result<&[AssetData]> {
        let assets = self
            .assets
            .get_or_try_init(|| async {
                let url = format!("{}/stock/symbol", self.config.rest_url);
                let raw: Vec<FinnhubSymbol> =
                    self.rest.get_json(cancel, &url, &[("exchange", "US")]).await?;
                info!(count = raw.len(), "Loaded Finnhub symbol list");
                Ok::<_, ChartfeedError>(raw.into_iter().map(FinnhubSymbol::into_asset).collect())
            })
            .await?;
        Ok(assets.as_slice())
    }

    /// Current price and previous close.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::MissingData`] for symbols Finnhub does not
    /// price.
    pub async fn fetch_quote(&self, cancel: &CancellationToken, symbol: &str) -> Result<QuoteData> {
        let url = format!("{}/quote", self.config.rest_url);
        let quote: FinnhubQuote = self.rest.get_json(cancel, &url, &[("symbol", symbol)]).await?;
        quote.into_quote(symbol)
    }

    /// Candles between `from` and `to`. The end is clamped to now; a start
    /// in the future yields no candles.
    ///
    /// # Errors
    ///
    /// Returns any REST or decoding error, or
    /// [`ChartfeedError::MalformedMessage`] for inconsistent arrays.
    pub async fn fetch_candles(
        &self,
        cancel: &CancellationToken,
        symbol: &str,
        resolution: CandleResolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CandleData>> {
        let now = Utc::now();
        if from > now {
            debug!(symbol, %from, "Candle range starts in the future");
            return Ok(Vec::new());
        }
        let to = to.min(now);

        let url = format!("{}/stock/candle", self.config.rest_url);
        let query = [
            ("symbol", symbol.to_string()),
            ("resolution", resolution.finnhub_resolution().to_string()),
            ("from", from.timestamp().to_string()),
            ("to", to.timestamp().to_string()),
        ];
        let raw: FinnhubCandles = self.rest.get_json(cancel, &url, &query).await?;
        let candles = raw.into_candles()?;

        debug!(
            symbol,
            resolution = resolution.as_str(),
            count = candles.len(),
            "Fetched Finnhub candles"
        );
        Ok(candles)
    }

    async fn answer_find(
        &self,
        cancel: &CancellationToken,
        request: FindAssetRequest,
    ) -> FindAssetResponse {
        let result = match self.assets(cancel).await {
            Ok(assets) => {
                search_assets(self.resolver.as_ref(), assets, &request.query, request.mode).await
            }
            Err(e) => Err(e),
        };
        let (assets, error) = into_response_parts(self.kind(), "find_asset", &request.query, result);
        FindAssetResponse {
            query: request.query,
            assets: assets.unwrap_or_default(),
            error,
        }
    }

    async fn answer_quote(&self, cancel: &CancellationToken, request: QuoteRequest) -> QuoteResponse {
        let result = self.fetch_quote(cancel, &request.asset.symbol).await;
        let (quote, error) =
            into_response_parts(self.kind(), "query_quote", &request.asset.symbol, result);
        QuoteResponse {
            asset: request.asset,
            quote,
            error,
        }
    }

    async fn answer_candles(
        &self,
        cancel: &CancellationToken,
        request: CandleRequest,
    ) -> CandleResponse {
        let result = self
            .fetch_candles(
                cancel,
                &request.asset.symbol,
                request.resolution,
                request.from,
                request.to,
            )
            .await;
        let (candles, error) =
            into_response_parts(self.kind(), "query_candles", &request.asset.symbol, result);
        CandleResponse {
            asset: request.asset,
            resolution: request.resolution,
            candles: candles.unwrap_or_default(),
            error,
        }
    }
}

#[async_trait]
impl Broker for FinnhubBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Finnhub
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn remaining_api_limit(&self) -> u32 {
        self.rest.remaining()
    }

    async fn find_asset(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<FindAssetRequest>,
        responses: mpsc::Sender<FindAssetResponse>,
    ) {
        let cancel = &cancel;
        serve("find_asset", self.kind(), cancel, requests, responses, move |request| {
            self.answer_find(cancel, request)
        })
        .await;
    }

    async fn query_quote(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<QuoteRequest>,
        responses: mpsc::Sender<QuoteResponse>,
    ) {
        let cancel = &cancel;
        serve("query_quote", self.kind(), cancel, requests, responses, move |request| {
            self.answer_quote(cancel, request)
        })
        .await;
    }

    async fn query_candles(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<CandleRequest>,
        responses: mpsc::Sender<CandleResponse>,
    ) {
        let cancel = &cancel;
        serve("query_candles", self.kind(), cancel, requests, responses, move |request| {
            self.answer_candles(cancel, request)
        })
        .await;
    }

    async fn subscribe_data(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<SubscriptionRequest>,
        responses: mpsc::Sender<SubscriptionResponse>,
    ) {
        let protocol = FinnhubStream::new(&self.config.websocket_url, &self.config.api_key);
        RealtimeConnection::new(protocol)
            .serve(
                self.kind(),
                CAPABILITIES.realtime_bid_ask,
                cancel,
                requests,
                responses,
            )
            .await;
    }

    /// Finnhub is data-only; every order is answered with
    /// [`ChartfeedError::NotSupported`].
    async fn trade_asset(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<TradeRequest>,
        responses: mpsc::Sender<TradeResponse>,
    ) {
        let kind = self.kind();
        serve("trade_asset", kind, &cancel, requests, responses, |request| async move {
            let e = ChartfeedError::NotSupported("finnhub does not accept orders".to_string());
            log_request_error(kind, "trade_asset", &request.asset.symbol, &e);
            TradeResponse {
                asset: request.asset,
                order: None,
                error: Some(e),
            }
        })
        .await;
    }
}
