//! Uniform broker contract.
//!
//! Every provider adapter implements [`Broker`]. Its operations are
//! long-running workers with one shape: consume a request channel until it
//! closes or the cancellation token fires, answer every request with exactly
//! one response (in order, echoing the request's asset or query), and drop
//! the response sender on exit. Per-request failures travel in the
//! response's `error` field and never stop a worker.
//!
//! Adapters are constructed from configuration through [`BrokerRegistry`].

pub mod alpaca;
pub mod finnhub;
pub mod http;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::figi::{AssetResolver, is_isin};
use crate::models::{
    AssetData, CandleRequest, CandleResponse, FindAssetRequest, FindAssetResponse, QuoteRequest,
    QuoteResponse, SearchMode, SubscriptionRequest, SubscriptionResponse, TradeRequest,
    TradeResponse,
};
use crate::{ChartfeedError, Result};

/// Supported data providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BrokerKind {
    Alpaca,
    Finnhub,
}

impl BrokerKind {
    pub const ALL: [BrokerKind; 2] = [BrokerKind::Alpaca, BrokerKind::Finnhub];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alpaca => "alpaca",
            Self::Finnhub => "finnhub",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = ChartfeedError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ChartfeedError::Config(format!("unknown broker: {s}")))
    }
}

/// Optional features a broker offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Streams best bid/ask in addition to trades.
    pub realtime_bid_ask: bool,
    /// Accepts orders against a simulated account.
    pub paper_trading: bool,
    /// Accepts orders against a funded account.
    pub live_trading: bool,
}

/// A market data provider.
///
/// The trait is object safe; adapters are shared as `Arc<dyn Broker>` and
/// each worker is typically driven by its own task.
#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> BrokerKind;

    fn capabilities(&self) -> Capabilities;

    /// Smallest remaining request budget across the adapter's limiters.
    fn remaining_api_limit(&self) -> u32;

    /// Searches the broker's tradable assets.
    async fn find_asset(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<FindAssetRequest>,
        responses: mpsc::Sender<FindAssetResponse>,
    );

    /// Answers current/previous-close price queries.
    async fn query_quote(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<QuoteRequest>,
        responses: mpsc::Sender<QuoteResponse>,
    );

    /// Answers historical candle queries.
    async fn query_candles(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<CandleRequest>,
        responses: mpsc::Sender<CandleResponse>,
    );

    /// Opens and closes realtime streams. The realtime connection is
    /// established on the first subscription and torn down when the
    /// request stream ends.
    async fn subscribe_data(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<SubscriptionRequest>,
        responses: mpsc::Sender<SubscriptionResponse>,
    );

    /// Submits orders.
    async fn trade_asset(
        &self,
        cancel: CancellationToken,
        requests: mpsc::Receiver<TradeRequest>,
        responses: mpsc::Sender<TradeResponse>,
    );
}

/// Drives one worker: answers each request with `handle` until the request
/// channel closes, the consumer goes away, or `cancel` fires.
pub(crate) async fn serve<Req, Resp, F, Fut>(
    worker: &'static str,
    broker: BrokerKind,
    cancel: &CancellationToken,
    mut requests: mpsc::Receiver<Req>,
    responses: mpsc::Sender<Resp>,
    mut handle: F,
) where
    F: FnMut(Req) -> Fut,
    Fut: Future<Output = Resp>,
{
    debug!(%broker, worker, "Worker started");
    loop {
        let request = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let response = handle(request).await;
        if responses.send(response).await.is_err() {
            warn!(%broker, worker, "Response receiver dropped, stopping worker");
            break;
        }
    }
    debug!(%broker, worker, "Worker stopped");
}

/// Logs a per-request failure before it is put into a response.
pub(crate) fn log_request_error(
    broker: BrokerKind,
    worker: &'static str,
    subject: &str,
    e: &ChartfeedError,
) {
    warn!(%broker, worker, subject, error = %e, "Request failed");
}

/// Splits a request outcome into the `(value, error)` pair responses carry.
pub(crate) fn into_response_parts<T>(
    broker: BrokerKind,
    worker: &'static str,
    subject: &str,
    result: Result<T>,
) -> (Option<T>, Option<ChartfeedError>) {
    match result {
        Ok(value) => (Some(value), None),
        Err(e) => {
            log_request_error(broker, worker, subject, &e);
            (None, Some(e))
        }
    }
}

/// Matches `query` against a broker's asset list.
///
/// ISINs are translated through `resolver` first, since brokers only know
/// their own symbols. Unambiguous searches must hit exactly one symbol; the
/// winner's Figi is then re-resolved so the asset can be correlated across
/// brokers.
///
/// # Errors
///
/// Returns [`ChartfeedError::AmbiguousOrNotFound`] for unambiguous searches
/// without exactly one match, or the resolver's error for ISIN queries.
pub(crate) async fn search_assets(
    resolver: &dyn AssetResolver,
    assets: &[AssetData],
    query: &str,
    mode: SearchMode,
) -> Result<Vec<AssetData>> {
    let query = query.trim();

    let mut found: Vec<AssetData> = if is_isin(query) {
        let resolved = resolver.find_asset(query, SearchMode::Any).await?;
        debug!(isin = query, resolved = resolved.len(), "Resolved ISIN");
        assets
            .iter()
            .filter(|asset| {
                resolved.iter().any(|r| {
                    asset.same_instrument(r) || asset.symbol.eq_ignore_ascii_case(&r.symbol)
                })
            })
            .cloned()
            .collect()
    } else {
        match mode {
            SearchMode::Any => assets.iter().filter(|a| a.matches(query)).cloned().collect(),
            SearchMode::Unambiguous => assets
                .iter()
                .filter(|a| a.symbol.eq_ignore_ascii_case(query))
                .cloned()
                .collect(),
        }
    };

    if mode == SearchMode::Any {
        return Ok(found);
    }

    if found.len() != 1 {
        return Err(ChartfeedError::AmbiguousOrNotFound(format!(
            "{query} matched {} assets",
            found.len()
        )));
    }

    let mut asset = found.remove(0);
    match resolver.find_asset(&asset.symbol, SearchMode::Unambiguous).await {
        Ok(resolved) => match resolved.as_slice() {
            [only] if !only.figi.is_empty() => asset.figi.clone_from(&only.figi),
            _ => debug!(symbol = %asset.symbol, candidates = resolved.len(), "Figi not re-resolved"),
        },
        Err(e) => warn!(symbol = %asset.symbol, error = %e, "Figi lookup failed"),
    }
    Ok(vec![asset])
}

/// Builds one adapter from configuration; `Ok(None)` when not configured.
pub type BrokerFactory = fn(&AppConfig, Arc<dyn AssetResolver>) -> Result<Option<Arc<dyn Broker>>>;

/// The adapters available to the application, keyed by kind.
pub struct BrokerRegistry {
    brokers: HashMap<BrokerKind, Arc<dyn Broker>>,
}

impl fmt::Debug for BrokerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerRegistry")
            .field("brokers", &self.kinds())
            .finish()
    }
}

impl BrokerRegistry {
    /// The factory for every supported provider.
    #[must_use]
    pub fn factories() -> [(BrokerKind, BrokerFactory); 2] {
        [
            (BrokerKind::Alpaca, alpaca::factory),
            (BrokerKind::Finnhub, finnhub::factory),
        ]
    }

    /// Constructs every broker the configuration enables.
    ///
    /// # Errors
    ///
    /// Returns the first factory error (e.g. an HTTP client that cannot be
    /// built).
    pub fn from_config(config: &AppConfig, resolver: Arc<dyn AssetResolver>) -> Result<Self> {
        let mut brokers = HashMap::new();
        for (kind, factory) in Self::factories() {
            match factory(config, Arc::clone(&resolver))? {
                Some(broker) => {
                    info!(broker = %kind, "Broker enabled");
                    brokers.insert(kind, broker);
                }
                None => debug!(broker = %kind, "Broker not configured"),
            }
        }
        Ok(Self { brokers })
    }

    #[must_use]
    pub fn get(&self, kind: BrokerKind) -> Option<Arc<dyn Broker>> {
        self.brokers.get(&kind).cloned()
    }

    /// Configured kinds in a stable order.
    #[must_use]
    pub fn kinds(&self) -> Vec<BrokerKind> {
        let mut kinds: Vec<BrokerKind> = self.brokers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
