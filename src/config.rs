//! Application configuration loaded from environment variables.
//!
//! Each broker is configured independently and is enabled only when its
//! credentials are present:
//! - `ALPACA_API_KEY` / `ALPACA_API_SECRET`: Alpaca key pair (both or neither)
//! - `FINNHUB_API_KEY`: Finnhub token
//!
//! Endpoint variables (`ALPACA_TRADING_URL`, `ALPACA_PAPER_URL`,
//! `ALPACA_DATA_URL`, `ALPACA_WEBSOCKET_URL`, `FINNHUB_REST_URL`,
//! `FINNHUB_WEBSOCKET_URL`) override the public defaults.
//! `FINNHUB_REQUESTS_PER_SECOND` caps Finnhub's per-second budget and
//! `CHARTFEED_HTTP_TIMEOUT_SECS` sets the REST timeout.

use std::time::Duration;

const DEFAULT_ALPACA_TRADING_URL: &str = "https://api.alpaca.markets/v2";
const DEFAULT_ALPACA_PAPER_URL: &str = "https://paper-api.alpaca.markets/v2";
const DEFAULT_ALPACA_DATA_URL: &str = "https://data.alpaca.markets/v2";
const DEFAULT_ALPACA_WEBSOCKET_URL: &str = "wss://stream.data.alpaca.markets/v2";

const DEFAULT_FINNHUB_REST_URL: &str = "https://finnhub.io/api/v1";
const DEFAULT_FINNHUB_WEBSOCKET_URL: &str = "wss://ws.finnhub.io";

/// Finnhub documents a hard cap of 30 calls per second on top of the
/// per-minute plan quota.
const DEFAULT_FINNHUB_REQUESTS_PER_SECOND: u32 = 30;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub alpaca: Option<AlpacaConfig>,
    pub finnhub: Option<FinnhubConfig>,
    pub http_timeout: Duration,
}

/// Alpaca-specific configuration values.
#[derive(Debug, Clone)]
pub struct AlpacaConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Live trading REST base.
    pub trading_url: String,
    /// Paper trading REST base.
    pub paper_url: String,
    pub data_url: String,
    pub websocket_url: String,
}

/// Finnhub-specific configuration values.
#[derive(Debug, Clone)]
pub struct FinnhubConfig {
    pub api_key: String,
    pub rest_url: String,
    pub websocket_url: String,
    pub requests_per_second: u32,
}

impl AlpacaConfig {
    /// Creates a configuration pointing at the public Alpaca endpoints.
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            trading_url: DEFAULT_ALPACA_TRADING_URL.to_string(),
            paper_url: DEFAULT_ALPACA_PAPER_URL.to_string(),
            data_url: DEFAULT_ALPACA_DATA_URL.to_string(),
            websocket_url: DEFAULT_ALPACA_WEBSOCKET_URL.to_string(),
        }
    }
}

impl FinnhubConfig {
    /// Creates a configuration pointing at the public Finnhub endpoints.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            rest_url: DEFAULT_FINNHUB_REST_URL.to_string(),
            websocket_url: DEFAULT_FINNHUB_WEBSOCKET_URL.to_string(),
            requests_per_second: DEFAULT_FINNHUB_REQUESTS_PER_SECOND,
        }
    }
}

/// Loads the application configuration from environment variables.
///
/// # Errors
///
/// Returns [`ChartfeedError::Config`](crate::ChartfeedError::Config) if only
/// one of the two Alpaca credential variables is set, or if a numeric
/// variable cannot be parsed.
pub fn read_config() -> crate::Result<AppConfig> {
    let alpaca = match (
        non_empty_var("ALPACA_API_KEY"),
        non_empty_var("ALPACA_API_SECRET"),
    ) {
        (Some(api_key), Some(api_secret)) => Some(AlpacaConfig {
            api_key,
            api_secret,
            trading_url: var_or("ALPACA_TRADING_URL", DEFAULT_ALPACA_TRADING_URL),
            paper_url: var_or("ALPACA_PAPER_URL", DEFAULT_ALPACA_PAPER_URL),
            data_url: var_or("ALPACA_DATA_URL", DEFAULT_ALPACA_DATA_URL),
            websocket_url: var_or("ALPACA_WEBSOCKET_URL", DEFAULT_ALPACA_WEBSOCKET_URL),
        }),
        (Some(_), None) => {
            return Err(crate::ChartfeedError::Config(
                "ALPACA_API_KEY is set but ALPACA_API_SECRET is missing".to_string(),
            ));
        }
        (None, Some(_)) => {
            return Err(crate::ChartfeedError::Config(
                "ALPACA_API_SECRET is set but ALPACA_API_KEY is missing".to_string(),
            ));
        }
        (None, None) => None,
    };

    let finnhub = match non_empty_var("FINNHUB_API_KEY") {
        Some(api_key) => Some(FinnhubConfig {
            api_key,
            rest_url: var_or("FINNHUB_REST_URL", DEFAULT_FINNHUB_REST_URL),
            websocket_url: var_or("FINNHUB_WEBSOCKET_URL", DEFAULT_FINNHUB_WEBSOCKET_URL),
            requests_per_second: parse_var(
                "FINNHUB_REQUESTS_PER_SECOND",
                DEFAULT_FINNHUB_REQUESTS_PER_SECOND,
            )?,
        }),
        None => None,
    };

    let http_timeout = parse_var("CHARTFEED_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT.as_secs())
        .map(Duration::from_secs)?;

    Ok(AppConfig {
        alpaca,
        finnhub,
        http_timeout,
    })
}

/// Returns `true` if at least one broker is usable with this configuration.
#[must_use]
pub fn is_valid_config(config: &AppConfig) -> bool {
    let alpaca_ok = config
        .alpaca
        .as_ref()
        .is_some_and(|a| !a.api_key.is_empty() && !a.api_secret.is_empty());
    let finnhub_ok = config
        .finnhub
        .as_ref()
        .is_some_and(|f| !f.api_key.is_empty() && f.requests_per_second > 0);

    (alpaca_ok || finnhub_ok) && !config.http_timeout.is_zero()
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    non_empty_var(name).unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| crate::ChartfeedError::Config(format!("{name} is invalid: {e}"))),
        None => Ok(default),
    }
}
