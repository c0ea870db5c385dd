//! Outbound request throttling.
//!
//! Providers reset their quotas on windows a generic token bucket cannot
//! model, so [`RateLimiter`] is driven by live response metadata instead of
//! a rate configured up front. Two flavours share the type:
//!
//! - header-driven limiters read the remaining quota and the reset epoch
//!   from each response's headers;
//! - manual per-second limiters count requests locally against a fixed cap
//!   whose window restarts independently of anything the server reports.
//!
//! A broker composes its limiters in a [`RateLimiters`] set.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ChartfeedError, Result};

/// Wait applied after a 429 that carried no usable reset header.
const FALLBACK_RETRY_DELAY: Duration = Duration::from_secs(1);

const MANUAL_WINDOW: Duration = Duration::from_secs(1);

/// Response header names carrying a provider's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderNames {
    pub remaining: &'static str,
    pub reset: &'static str,
    pub limit: Option<&'static str>,
}

/// Alpaca reports its per-minute quota as `X-RateLimit-*`.
pub const ALPACA_HEADERS: HeaderNames = HeaderNames {
    remaining: "X-RateLimit-Remaining",
    reset: "X-RateLimit-Reset",
    limit: Some("X-RateLimit-Limit"),
};

/// Finnhub spells the same headers `X-Ratelimit-*`. Header lookup is
/// case-insensitive, the distinct constant documents the provider.
pub const FINNHUB_HEADERS: HeaderNames = HeaderNames {
    remaining: "X-Ratelimit-Remaining",
    reset: "X-Ratelimit-Reset",
    limit: Some("X-Ratelimit-Limit"),
};

/// What the caller of
/// [`handle_response_headers_with_wait`](RateLimiter::handle_response_headers_with_wait)
/// should do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The response is final; hand it to the caller.
    Proceed,
    /// The quota was exhausted; the budget has been waited out, so resubmit
    /// the same request.
    Retry,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Headers(HeaderNames),
    Manual { cap: u32 },
}

#[derive(Debug)]
struct State {
    remaining: u32,
    /// Budget assumed after a reset the server did not describe.
    refill: u32,
    reset_at: Option<Instant>,
}

/// One throttled quota.
#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    mode: Mode,
    state: Mutex<State>,
}

impl RateLimiter {
    /// Creates a limiter fed from response headers. `initial_budget` is
    /// assumed until the first response reports the real quota.
    #[must_use]
    pub fn from_headers(name: &'static str, headers: HeaderNames, initial_budget: u32) -> Self {
        Self {
            name,
            mode: Mode::Headers(headers),
            state: Mutex::new(State {
                remaining: initial_budget,
                refill: initial_budget,
                reset_at: None,
            }),
        }
    }

    /// Creates a limiter allowing `cap` requests per second.
    #[must_use]
    pub fn per_second(name: &'static str, cap: u32) -> Self {
        Self {
            name,
            mode: Mode::Manual { cap },
            state: Mutex::new(State {
                remaining: cap,
                refill: cap,
                reset_at: None,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(limiter = self.name, "Rate limiter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Current budget. A manual window that has run out reports the full
    /// cap again.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        let mut state = self.lock();
        self.refill_if_due(&mut state, Instant::now());
        state.remaining
    }

    fn refill_if_due(&self, state: &mut State, now: Instant) {
        match self.mode {
            Mode::Manual { cap } => {
                if state.reset_at.is_some_and(|at| at <= now) {
                    state.remaining = cap;
                    state.reset_at = None;
                }
            }
            Mode::Headers(_) => {
                if let Some(at) = state.reset_at
                    && at <= now
                    && state.remaining == 0
                {
                    state.remaining = state.refill;
                    state.reset_at = None;
                }
            }
        }
    }

    /// Returns once the budget is positive. Does not consume budget: header
    /// limiters learn consumption from the server, manual limiters from
    /// [`handle_manual_timer`](Self::handle_manual_timer).
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Cancelled`] if `cancel` fires while the
    /// budget is exhausted.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let deadline = {
                let mut state = self.lock();
                let now = Instant::now();
                self.refill_if_due(&mut state, now);
                if state.remaining > 0 {
                    return Ok(());
                }
                state.reset_at.unwrap_or(now + FALLBACK_RETRY_DELAY)
            };

            debug!(
                limiter = self.name,
                wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Rate limit budget exhausted, waiting for reset"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ChartfeedError::Cancelled),
                () = tokio::time::sleep_until(deadline) => {
                    let mut state = self.lock();
                    if state.remaining == 0 && state.reset_at.is_none_or(|at| at <= Instant::now()) {
                        state.remaining = state.refill;
                        state.reset_at = None;
                    }
                }
            }
        }
    }

    /// Applies a response's quota headers. On HTTP 429 the budget is marked
    /// exhausted, the reset is waited out and [`RetryDecision::Retry`] is
    /// returned. Manual limiters ignore headers.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Cancelled`] if `cancel` fires while waiting.
    pub async fn handle_response_headers_with_wait(
        &self,
        cancel: &CancellationToken,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<RetryDecision> {
        let Mode::Headers(names) = self.mode else {
            return Ok(RetryDecision::Proceed);
        };

        let remaining = header_number::<i64>(headers, names.remaining);
        let reset = header_number::<i64>(headers, names.reset);
        let limit = names.limit.and_then(|name| header_number::<u32>(headers, name));
        let exhausted = status == StatusCode::TOO_MANY_REQUESTS;

        {
            let mut state = self.lock();
            let now = Instant::now();
            if let Some(remaining) = remaining {
                state.remaining = u32::try_from(remaining.max(0)).unwrap_or(u32::MAX);
            }
            if let Some(limit) = limit {
                state.refill = limit;
            }
            if let Some(reset) = reset {
                state.reset_at = Some(instant_from_epoch(reset, now));
            }
            if exhausted {
                state.remaining = 0;
                if state.reset_at.is_none_or(|at| at <= now) {
                    state.reset_at = Some(now + FALLBACK_RETRY_DELAY);
                }
            }
        }

        if !exhausted {
            return Ok(RetryDecision::Proceed);
        }

        warn!(limiter = self.name, "Provider rate limit hit, retrying after reset");
        self.wait(cancel).await?;
        Ok(RetryDecision::Retry)
    }

    /// Counts one request against a manual limiter, restarting the window
    /// at the cap once it has elapsed. Header limiters are unaffected.
    pub fn handle_manual_timer(&self) {
        let Mode::Manual { cap } = self.mode else {
            return;
        };
        let mut state = self.lock();
        let now = Instant::now();
        if state.reset_at.is_none_or(|at| at <= now) {
            state.remaining = cap;
            state.reset_at = Some(now + MANUAL_WINDOW);
        }
        state.remaining = state.remaining.saturating_sub(1);
    }
}

fn header_number<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Maps a reset given in Unix seconds onto the tokio clock.
fn instant_from_epoch(epoch_secs: i64, now: Instant) -> Instant {
    let delta = epoch_secs - Utc::now().timestamp();
    if delta <= 0 {
        now
    } else {
        now + Duration::from_secs(delta.unsigned_abs())
    }
}

/// An ordered set of limiters that must all have budget before a request.
#[derive(Debug, Default)]
pub struct RateLimiters {
    limiters: Vec<RateLimiter>,
}

impl RateLimiters {
    /// Limiters are waited on in the given order; pass the per-second
    /// limiter before the global one.
    #[must_use]
    pub fn new(limiters: Vec<RateLimiter>) -> Self {
        Self { limiters }
    }

    /// Waits on each limiter in turn.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Cancelled`] if `cancel` fires while waiting.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        for limiter in &self.limiters {
            limiter.wait(cancel).await?;
        }
        Ok(())
    }

    pub fn handle_manual_timer(&self) {
        for limiter in &self.limiters {
            limiter.handle_manual_timer();
        }
    }

    /// Applies the response to every limiter; retry if any asks for it.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Cancelled`] if `cancel` fires while waiting.
    pub async fn handle_response_headers_with_wait(
        &self,
        cancel: &CancellationToken,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<RetryDecision> {
        let mut decision = RetryDecision::Proceed;
        for limiter in &self.limiters {
            if limiter
                .handle_response_headers_with_wait(cancel, status, headers)
                .await?
                == RetryDecision::Retry
            {
                decision = RetryDecision::Retry;
            }
        }
        Ok(decision)
    }

    /// Smallest budget across the set, `u32::MAX` when empty.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.limiters
            .iter()
            .map(RateLimiter::remaining)
            .min()
            .unwrap_or(u32::MAX)
    }
}
