//! REST plumbing shared by the adapters.
//!
//! [`RestClient::run_request`] is the retry loop every REST call goes
//! through: wait for budget on all limiters, send, feed the response
//! headers back into the limiters and resubmit while they ask for a retry.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rate_limit::{RateLimiters, RetryDecision};
use crate::{ChartfeedError, Result};

/// Consecutive 429 answers tolerated for one request.
const MAX_RATE_LIMITED_ATTEMPTS: u32 = 3;

/// HTTP client bound to one provider's credentials and quotas.
#[derive(Debug)]
pub struct RestClient {
    name: &'static str,
    client: Client,
    limiters: RateLimiters,
}

impl RestClient {
    /// Builds a client sending `default_headers` (credentials) with every
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Http`] if the TLS backend cannot be
    /// initialised.
    pub fn new(
        name: &'static str,
        timeout: Duration,
        default_headers: HeaderMap,
        limiters: RateLimiters,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            name,
            client,
            limiters,
        })
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.limiters.remaining()
    }

    /// Sends the request produced by `build`, retrying it for as long as the
    /// limiters report quota exhaustion.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Cancelled`] if `cancel` fires,
    /// [`ChartfeedError::RateLimited`] once the provider has refused the same
    /// request [`MAX_RATE_LIMITED_ATTEMPTS`] times, or
    /// [`ChartfeedError::Http`] on transport failure.
    pub async fn run_request<F>(&self, cancel: &CancellationToken, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 1u32;
        loop {
            self.limiters.wait(cancel).await?;
            self.limiters.handle_manual_timer();

            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ChartfeedError::Cancelled),
                response = build(&self.client).send() => response?,
            };

            let decision = self
                .limiters
                .handle_response_headers_with_wait(cancel, response.status(), response.headers())
                .await?;
            match decision {
                RetryDecision::Proceed => return Ok(response),
                RetryDecision::Retry if attempt >= MAX_RATE_LIMITED_ATTEMPTS => {
                    warn!(provider = self.name, attempt, "Giving up on rate-limited request");
                    return Err(ChartfeedError::RateLimited);
                }
                RetryDecision::Retry => {
                    debug!(provider = self.name, attempt, "Resubmitting rate-limited request");
                    attempt += 1;
                }
            }
        }
    }

    /// GETs `url` and decodes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Provider`] for non-success statuses,
    /// [`ChartfeedError::Json`] if the body does not decode, and whatever
    /// [`run_request`](Self::run_request) returns.
    pub async fn get_json<T, Q>(&self, cancel: &CancellationToken, url: &str, query: &Q) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        debug!(provider = self.name, url, "GET");
        let response = self
            .run_request(cancel, |client| client.get(url).query(query))
            .await?;
        self.decode(response).await
    }

    /// POSTs `body` as JSON to `url` and decodes the JSON answer.
    ///
    /// # Errors
    ///
    /// Same as [`get_json`](Self::get_json).
    pub async fn post_json<T, B>(&self, cancel: &CancellationToken, url: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        debug!(provider = self.name, url, "POST");
        let response = self
            .run_request(cancel, |client| client.post(url).json(body))
            .await?;
        self.decode(response).await
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(provider = self.name, %status, "Provider returned an error status");
            return Err(ChartfeedError::Provider(format!(
                "{} returned {status}: {}",
                self.name,
                body.trim()
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }
}
