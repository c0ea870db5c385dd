//! Instrument identity resolution.
//!
//! Brokers know their own symbols but not the cross-broker Figi, and they
//! cannot search by ISIN. Both gaps are filled by an external lookup
//! service reached through [`AssetResolver`].

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::models::{AssetData, FindAssetRequest, FindAssetResponse, SearchMode};
use crate::{ChartfeedError, Result};

static ISIN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}[A-Z0-9]{9}[0-9]$").expect("Invalid regex pattern"));

/// Returns `true` if `query` is shaped like an ISIN (country prefix, nine
/// alphanumerics, check digit).
#[must_use]
pub fn is_isin(query: &str) -> bool {
    ISIN_PATTERN.is_match(query)
}

/// Looks up instruments in an external reference database.
#[async_trait]
pub trait AssetResolver: Send + Sync {
    /// Returns every instrument matching `query` (symbol, ISIN or name).
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup service fails or rejects the query.
    async fn find_asset(&self, query: &str, mode: SearchMode) -> Result<Vec<AssetData>>;
}

/// Client for a lookup service exposed as a request/response channel pair.
///
/// The channels are used strictly one request at a time so responses can
/// never be attributed to the wrong caller.
#[derive(Debug)]
pub struct ChannelResolver {
    inner: Mutex<(mpsc::Sender<FindAssetRequest>, mpsc::Receiver<FindAssetResponse>)>,
}

impl ChannelResolver {
    #[must_use]
    pub fn new(
        requests: mpsc::Sender<FindAssetRequest>,
        responses: mpsc::Receiver<FindAssetResponse>,
    ) -> Self {
        Self {
            inner: Mutex::new((requests, responses)),
        }
    }
}

#[async_trait]
impl AssetResolver for ChannelResolver {
    async fn find_asset(&self, query: &str, mode: SearchMode) -> Result<Vec<AssetData>> {
        let mut guard = self.inner.lock().await;
        let (requests, responses) = &mut *guard;

        requests
            .send(FindAssetRequest {
                query: query.to_string(),
                mode,
            })
            .await
            .map_err(|_| ChartfeedError::Connection("asset lookup service stopped".into()))?;

        let response = responses
            .recv()
            .await
            .ok_or_else(|| ChartfeedError::Connection("asset lookup service stopped".into()))?;

        debug!(query, results = response.assets.len(), "Asset lookup answered");
        match response.error {
            Some(e) => Err(e),
            None => Ok(response.assets),
        }
    }
}

/// In-memory resolver over a fixed reference list.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    assets: Vec<AssetData>,
}

impl StaticResolver {
    #[must_use]
    pub fn new(assets: Vec<AssetData>) -> Self {
        Self { assets }
    }
}

#[async_trait]
impl AssetResolver for StaticResolver {
    async fn find_asset(&self, query: &str, mode: SearchMode) -> Result<Vec<AssetData>> {
        let found: Vec<AssetData> = self
            .assets
            .iter()
            .filter(|a| match mode {
                SearchMode::Any => a.matches(query) || a.figi == query,
                SearchMode::Unambiguous => a.symbol.eq_ignore_ascii_case(query),
            })
            .cloned()
            .collect();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apple() -> AssetData {
        AssetData::new("AAPL", "Apple Inc.", "XNAS", "USD", "BBG000B9XRY4", true)
    }

    #[test]
    fn recognises_isins() {
        assert!(is_isin("US0378331005"));
        assert!(is_isin("DE0007164600"));
        assert!(!is_isin("AAPL"));
        assert!(!is_isin("us0378331005"));
        assert!(!is_isin("US037833100X"));
    }

    #[tokio::test]
    async fn static_resolver_modes() {
        let resolver = StaticResolver::new(vec![apple()]);
        assert_eq!(
            resolver.find_asset("apple", SearchMode::Any).await.unwrap().len(),
            1
        );
        assert!(
            resolver
                .find_asset("apple", SearchMode::Unambiguous)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn channel_resolver_round_trip() {
        let (req_tx, mut req_rx) = mpsc::channel::<FindAssetRequest>(1);
        let (resp_tx, resp_rx) = mpsc::channel(1);
        let resolver = ChannelResolver::new(req_tx, resp_rx);

        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                let error = (request.query == "bad")
                    .then(|| ChartfeedError::Provider("rejected".into()));
                let assets = if error.is_none() { vec![apple()] } else { Vec::new() };
                let _ = resp_tx
                    .send(FindAssetResponse {
                        query: request.query,
                        assets,
                        error,
                    })
                    .await;
            }
        });

        let found = resolver.find_asset("AAPL", SearchMode::Any).await.unwrap();
        assert_eq!(found, vec![apple()]);

        let err = resolver.find_asset("bad", SearchMode::Any).await.unwrap_err();
        assert!(matches!(err, ChartfeedError::Provider(_)));
    }

    #[tokio::test]
    async fn channel_resolver_reports_stopped_service() {
        let (req_tx, req_rx) = mpsc::channel::<FindAssetRequest>(1);
        let (_resp_tx, resp_rx) = mpsc::channel(1);
        drop(req_rx);
        let resolver = ChannelResolver::new(req_tx, resp_rx);

        let err = resolver.find_asset("AAPL", SearchMode::Any).await.unwrap_err();
        assert!(matches!(err, ChartfeedError::Connection(_)));
    }
}
