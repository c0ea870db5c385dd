use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chartfeed::aggregation::{CandleSeries, IndicatorKind, IndicatorRegistry};
use chartfeed::broker::{Broker, BrokerKind, BrokerRegistry};
use chartfeed::config::{is_valid_config, read_config};
use chartfeed::credentials::Keychain;
use chartfeed::figi::StaticResolver;
use chartfeed::models::{
    AssetData, CandleData, CandleRequest, DataKind, FindAssetRequest, RealtimeStream, SearchMode,
    SubscriptionAction, SubscriptionRequest,
};
use chartfeed::resolution::CandleResolution;
use chartfeed::{ChartfeedError, Result};

const RESOLUTION: CandleResolution = CandleResolution::Minute5;
const SMA_PERIOD: usize = 20;

/// Usage: `chartfeed [SYMBOL] [BROKER]` or `chartfeed login`
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if std::env::args().nth(1).as_deref() == Some("login") {
        return store_credentials();
    }

    // Environment writes must happen before the runtime starts its threads.
    Keychain::default().export_to_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ChartfeedError::Config(format!("cannot start runtime: {e}")))?;
    runtime.block_on(run())
}

/// Prompts for every broker secret found in neither the environment nor
/// the keychain. An empty line skips the key.
fn store_credentials() -> Result<()> {
    let keychain = Keychain::default();
    let stdin = std::io::stdin();
    for broker in BrokerKind::ALL {
        let missing = keychain.missing(broker);
        if missing.is_empty() {
            info!(%broker, "Credentials already available");
            continue;
        }
        for key in missing {
            eprint!("{}: ", key.env_var());
            let mut line = zeroize::Zeroizing::new(String::new());
            stdin
                .read_line(&mut line)
                .map_err(|e| ChartfeedError::Config(format!("cannot read stdin: {e}")))?;
            let secret = line.trim();
            if !secret.is_empty() {
                keychain.save(key, secret)?;
                info!(key = key.env_var(), "Stored in keychain");
            }
        }
    }
    Ok(())
}

async fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let symbol = args.next().unwrap_or_else(|| "AAPL".to_string());
    let requested = args.next().map(|name| name.parse::<BrokerKind>()).transpose()?;

    let config = read_config()?;
    if !is_valid_config(&config) {
        return Err(ChartfeedError::Config(
            "no broker configured; set ALPACA_API_KEY/ALPACA_API_SECRET or FINNHUB_API_KEY"
                .to_string(),
        ));
    }

    let registry = BrokerRegistry::from_config(&config, Arc::new(StaticResolver::default()))?;
    let kind = match requested {
        Some(kind) => kind,
        None => registry
            .kinds()
            .first()
            .copied()
            .ok_or_else(|| ChartfeedError::Config("no broker available".to_string()))?,
    };
    let broker = registry
        .get(kind)
        .ok_or_else(|| ChartfeedError::Config(format!("{kind} is not configured")))?;

    let cancel = CancellationToken::new();
    let asset = find_asset(&broker, &cancel, &symbol).await?;
    info!(broker = %kind, symbol = %asset.symbol, name = %asset.name, figi = %asset.figi, "Asset found");

    let mut series = CandleSeries::new(asset.symbol.clone(), RESOLUTION);
    let now = Utc::now();
    series.merge(load_candles(&broker, &cancel, &asset, now - TimeDelta::days(2), now).await?);

    let mut sma = IndicatorRegistry::with_builtin().create(IndicatorKind::Sma, SMA_PERIOD)?;
    sma.update(series.candles(), 0);
    info!(candles = series.len(), "History loaded");

    let (sub_tx, sub_rx) = mpsc::channel(8);
    let (resp_tx, mut resp_rx) = mpsc::channel(8);
    let worker = {
        let broker = Arc::clone(&broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { broker.subscribe_data(cancel, sub_rx, resp_tx).await })
    };

    sub_tx
        .send(SubscriptionRequest {
            asset: asset.clone(),
            kind: DataKind::Trades,
            action: SubscriptionAction::Subscribe,
        })
        .await
        .map_err(|_| ChartfeedError::Connection("subscription worker stopped".to_string()))?;

    let response = resp_rx
        .recv()
        .await
        .ok_or_else(|| ChartfeedError::Connection("subscription worker stopped".to_string()))?;
    if let Some(e) = response.error {
        return Err(e);
    }
    let Some(RealtimeStream::Trades(mut ticks)) = response.stream else {
        return Err(ChartfeedError::MissingData("no trade stream returned".to_string()));
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            tick = ticks.recv() => match tick {
                Some(tick) => {
                    let Some(changed) = series.apply_tick(&tick) else {
                        continue;
                    };
                    sma.update(series.candles(), changed);
                    if let Some(candle) = series.last() {
                        info!(
                            symbol = %asset.symbol,
                            price = %tick.price,
                            open = %candle.open,
                            high = %candle.high,
                            low = %candle.low,
                            close = %candle.close,
                            volume = %candle.volume,
                            sma = ?sma.values().last().copied().flatten(),
                            "Tick"
                        );
                    }
                }
                None => {
                    warn!(symbol = %asset.symbol, evicted = ticks.evicted(), "Trade stream closed");
                    break;
                }
            },
        }
    }

    drop(sub_tx);
    cancel.cancel();
    if let Err(e) = worker.await {
        error!(error = %e, "Subscription worker panicked");
    }
    Ok(())
}

async fn find_asset(
    broker: &Arc<dyn Broker>,
    cancel: &CancellationToken,
    symbol: &str,
) -> Result<AssetData> {
    let (req_tx, req_rx) = mpsc::channel(1);
    let (resp_tx, mut resp_rx) = mpsc::channel(1);
    let worker = {
        let broker = Arc::clone(broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { broker.find_asset(cancel, req_rx, resp_tx).await })
    };

    req_tx
        .send(FindAssetRequest {
            query: symbol.to_string(),
            mode: SearchMode::Unambiguous,
        })
        .await
        .map_err(|_| ChartfeedError::Connection("find_asset worker stopped".to_string()))?;
    drop(req_tx);

    let response = resp_rx
        .recv()
        .await
        .ok_or_else(|| ChartfeedError::Connection("find_asset worker stopped".to_string()))?;
    let _ = worker.await;

    if let Some(e) = response.error {
        return Err(e);
    }
    response
        .assets
        .into_iter()
        .next()
        .ok_or_else(|| ChartfeedError::AmbiguousOrNotFound(symbol.to_string()))
}

async fn load_candles(
    broker: &Arc<dyn Broker>,
    cancel: &CancellationToken,
    asset: &AssetData,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<CandleData>> {
    let (req_tx, req_rx) = mpsc::channel(1);
    let (resp_tx, mut resp_rx) = mpsc::channel(1);
    let worker = {
        let broker = Arc::clone(broker);
        let cancel = cancel.clone();
        tokio::spawn(async move { broker.query_candles(cancel, req_rx, resp_tx).await })
    };

    req_tx
        .send(CandleRequest {
            asset: asset.clone(),
            resolution: RESOLUTION,
            from,
            to,
        })
        .await
        .map_err(|_| ChartfeedError::Connection("query_candles worker stopped".to_string()))?;
    drop(req_tx);

    let response = resp_rx
        .recv()
        .await
        .ok_or_else(|| ChartfeedError::Connection("query_candles worker stopped".to_string()))?;
    let _ = worker.await;

    match response.error {
        Some(e) => Err(e),
        None => Ok(response.candles),
    }
}
