//! Alpaca adapter.
//!
//! REST market data comes from the data API (`/stocks/...`), the asset list
//! and order entry from the trading API (live or paper). Realtime trades and
//! quotes stream from the IEX feed. Alpaca reports its per-minute quota in
//! `X-RateLimit-*` response headers.

pub mod models;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use self::models::{AlpacaAsset, BarsPage, OrderRequest, OrderResponse, Snapshot};
use self::stream::AlpacaStream;
use super::http::RestClient;
use super::{Broker, BrokerKind, Capabilities, into_response_parts, search_assets, serve};
use crate::config::{AlpacaConfig, AppConfig};
use crate::figi::AssetResolver;
use crate::models::{
    AssetData, CandleData, CandleRequest, CandleResponse, FindAssetRequest, FindAssetResponse,
    OrderData, QuoteData, QuoteRequest, QuoteResponse, SubscriptionRequest, SubscriptionResponse,
    TradeRequest, TradeResponse,
};
use crate::rate_limit::{ALPACA_HEADERS, RateLimiter, RateLimiters};
use crate::resolution::CandleResolution;
use crate::websocket::RealtimeConnection;
use crate::{ChartfeedError, Result};

/// Free-plan quota, assumed until the first response reports the real one.
const INITIAL_BUDGET: u32 = 200;

/// Largest page the bars endpoint serves.
const BARS_PAGE_LIMIT: &str = "10000";

const CAPABILITIES: Capabilities = Capabilities {
    realtime_bid_ask: true,
    paper_trading: true,
    live_trading: true,
};

/// Builds the Alpaca adapter when the configuration carries credentials.
///
/// # Errors
///
/// Returns an error if the adapter cannot be constructed.
pub fn factory(
    config: &AppConfig,
    resolver: Arc<dyn AssetResolver>,
) -> Result<Option<Arc<dyn Broker>>> {
    config
        .alpaca
        .as_ref()
        .map(|alpaca| {
            AlpacaBroker::new(alpaca.clone(), config.http_timeout, resolver)
                .map(|broker| Arc::new(broker) as Arc<dyn Broker>)
        })
        .transpose()
}

pub struct AlpacaBroker {
    config: AlpacaConfig,
    rest: RestClient,
    resolver: Arc<dyn AssetResolver>,
    assets: OnceCell<Vec<AssetData>>,
}

impl std::fmt::Debug for AlpacaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaBroker")
            .field("data_url", &self.config.data_url)
            .field("remaining", &self.rest.remaining())
            .finish_non_exhaustive()
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| ChartfeedError::Config(format!("{name} is not a valid header value: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl AlpacaBroker {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Config`] if the credentials cannot be sent
    /// as headers, or [`ChartfeedError::Http`] if the client cannot be built.
    pub fn new(
        config: AlpacaConfig,
        timeout: Duration,
        resolver: Arc<dyn AssetResolver>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("APCA-API-KEY-ID", header_value("ALPACA_API_KEY", &config.api_key)?);
        headers.insert(
            "APCA-API-SECRET-KEY",
            header_value("ALPACA_API_SECRET", &config.api_secret)?,
        );

        let limiters = RateLimiters::new(vec![RateLimiter::from_headers(
            "alpaca",
            ALPACA_HEADERS,
            INITIAL_BUDGET,
        )]);
        let rest = RestClient::new("alpaca", timeout, headers, limiters)?;

        Ok(Self {
            config,
            rest,
            resolver,
            assets: OnceCell::new(),
        })
    }

    /// Active US equities, fetched once and cached.
    async fn assets(&self, cancel: &CancellationToken) -> Result<&[AssetData]> {
        let assets = self
            .assets
            .get_or_try_init(|| async {
                let url = format!("{}/assets", self.config.trading_url);
                let raw: Vec<AlpacaAsset> = self
                    .rest
                    .get_json(cancel, &url, &[("status", "active"), ("asset_class", "us_equity")])
                    .await?;
                info!(count = raw.len(), "Loaded Alpaca asset list");
                Ok::<_, ChartfeedError>(raw.into_iter().map(AlpacaAsset::into_asset).collect())
            })
            .await?;
        Ok(assets.as_slice())
    }

    /// Current price and previous close from the symbol's snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::MissingData`] if either daily bar is absent.
    pub async fn fetch_quote(&self, cancel: &CancellationToken, symbol: &str) -> Result<QuoteData> {
        let url = format!("{}/stocks/{symbol}/snapshot", self.config.data_url);
        let snapshot: Snapshot = self.rest.get_json(cancel, &url, &[] as &[(&str, &str)]).await?;

        let current = snapshot
            .daily_bar
            .map(|bar| bar.close)
            .ok_or_else(|| ChartfeedError::MissingData(format!("{symbol}: no daily bar")))?;
        let previous = snapshot
            .prev_daily_bar
            .map(|bar| bar.close)
            .ok_or_else(|| ChartfeedError::MissingData(format!("{symbol}: no previous daily bar")))?;

        Ok(QuoteData::from_prices(current, previous))
    }

    /// Bars between `from` and `to`, following `next_page_token` until the
    /// range is exhausted.
    ///
    /// An end on or after the current UTC day is left open so the request
    /// does not reach into data the plan cannot serve; a start in the future
    /// yields no bars.
    ///
    /// # Errors
    ///
    /// Returns any REST or decoding error of the underlying pages.
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

        let url = format!("{}/stocks/{symbol}/bars", self.config.data_url);
        let mut query = vec![
            ("timeframe", resolution.alpaca_timeframe().to_string()),
            ("start", rfc3339(from)),
            ("adjustment", "all".to_string()),
            ("limit", BARS_PAGE_LIMIT.to_string()),
        ];
        if to.date_naive() < now.date_naive() {
            query.push(("end", rfc3339(to)));
        }

        let mut candles = Vec::new();
        let mut pages = 0u32;
        let mut page_token: Option<String> = None;
        loop {
            let mut page_query = query.clone();
            if let Some(token) = &page_token {
                page_query.push(("page_token", token.clone()));
            }

            let page: BarsPage = self.rest.get_json(cancel, &url, &page_query).await?;
            pages += 1;
            candles.extend(page.bars.unwrap_or_default().into_iter().map(CandleData::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(
            symbol,
            resolution = resolution.as_str(),
            pages,
            count = candles.len(),
            "Fetched Alpaca bars"
        );
        Ok(candles)
    }

    /// Places an order on the paper or live account.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Provider`] if Alpaca rejects the order.
    pub async fn submit_order(
        &self,
        cancel: &CancellationToken,
        request: &TradeRequest,
    ) -> Result<OrderData> {
        let base = if request.paper {
            &self.config.paper_url
        } else {
            &self.config.trading_url
        };
        let body = OrderRequest::new(
            &request.asset.symbol,
            request.side,
            request.order_type,
            request.quantity,
            request.time_in_force,
        );

        let order: OrderResponse = self
            .rest
            .post_json(cancel, &format!("{base}/orders"), &body)
            .await?;
        info!(
            symbol = %request.asset.symbol,
            order_id = %order.id,
            status = %order.status,
            paper = request.paper,
            "Order accepted"
        );
        Ok(order.into())
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

    async fn answer_trade(&self, cancel: &CancellationToken, request: TradeRequest) -> TradeResponse {
        let result = self.submit_order(cancel, &request).await;
        let (order, error) =
            into_response_parts(self.kind(), "trade_asset", &request.asset.symbol, result);
        TradeResponse {
            asset: request.asset,
            order,
            error,
        }
    }
}

#[async_trait]
impl Broker for AlpacaBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Alpaca
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
        let protocol = AlpacaStream::new(
            &self.config.websocket_url,
            &self.config.api_key,
            &self.config.api_secret,
        );
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

    async fn trade_asset(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<TradeRequest>,
        responses: mpsc::Sender<TradeResponse>,
    ) {
        let cancel = &cancel;
        serve("trade_asset", self.kind(), cancel, requests, responses, move |request| {
            self.answer_trade(cancel, request)
        })
        .await;
    }
}
