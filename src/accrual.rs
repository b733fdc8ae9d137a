// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Client for the external accrual service.
//!
//! [`AccrualSource`] performs a single query; [`fetch_accrual`] wraps it in
//! the retry loop described by a [`RetryPolicy`]:
//!
//! - `RateLimited`: wait for the server's `Retry-After` (or the fallback) and
//!   try again without spending an attempt.
//! - `TransientFailure`: wait `backoff(attempt)` and try again, until
//!   `max_attempts` calls have failed.
//!
//! The policy is a plain `Copy` value handed to each call, so concurrent
//! reconciliations share no retry state.

use crate::base::OrderNumber;
use crate::order::{AccrualReport, AccrualStatus};
use crate::LedgerError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one accrual query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualResult {
    Report(AccrualReport),
    /// HTTP 429. Carries the server's wait hint when it sent one.
    RateLimited(Option<Duration>),
    TransientFailure(String),
}

/// One accrual query, no retries.
#[async_trait]
pub trait AccrualSource: Send + Sync {
    async fn query(&self, number: &OrderNumber) -> AccrualResult;
}

/// Delay after the `attempt`-th failed call (1-based): 1s, 3s, 5s, ...
pub fn linear_backoff(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt.max(1)) * 2 - 1)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total calls allowed to fail transiently before giving up.
    pub max_attempts: u32,
    pub backoff: fn(u32) -> Duration,
    /// Wait used for a 429 without `Retry-After`.
    pub rate_limit_fallback: Duration,
    /// Upper bound on any single wait.
    pub max_wait: Duration,
    /// Upper bound on rate-limit waits within one call.
    pub max_rate_limited: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: linear_backoff,
            rate_limit_fallback: Duration::from_secs(60),
            max_wait: Duration::from_secs(60),
            max_rate_limited: 10,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: fn(u32) -> Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_limit_fallback(mut self, fallback: Duration) -> Self {
        self.rate_limit_fallback = fallback;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_max_rate_limited(mut self, max_rate_limited: u32) -> Self {
        self.max_rate_limited = max_rate_limited;
        self
    }

    fn rate_limit_wait(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.rate_limit_fallback).min(self.max_wait)
    }

    fn failure_wait(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt).min(self.max_wait)
    }
}

/// Queries `source` for `number` until it yields a report, the policy is
/// exhausted, or `cancel` fires.
///
/// # Errors
///
/// - [`LedgerError::Transient`] once `max_attempts` transient failures (or
///   `max_rate_limited` rate-limit waits) have accumulated.
/// - [`LedgerError::Cancelled`] as soon as `cancel` fires, including mid-wait.
pub async fn fetch_accrual(
    source: &dyn AccrualSource,
    number: &OrderNumber,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<AccrualReport, LedgerError> {
    let mut failures = 0u32;
    let mut throttled = 0u32;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
            result = source.query(number) => result,
        };

        let wait = match result {
            AccrualResult::Report(report) => return Ok(report),
            AccrualResult::RateLimited(hint) => {
                throttled += 1;
                if throttled > policy.max_rate_limited {
                    return Err(LedgerError::Transient(format!(
                        "accrual service kept rate limiting order {number}"
                    )));
                }
                let wait = policy.rate_limit_wait(hint);
                warn!(
                    order = %number,
                    wait_ms = wait.as_millis() as u64,
                    "accrual service rate limited"
                );
                wait
            }
            AccrualResult::TransientFailure(reason) => {
                failures += 1;
                if failures >= policy.max_attempts {
                    return Err(LedgerError::Transient(format!(
                        "order {number}: gave up after {failures} attempts: {reason}"
                    )));
                }
                let wait = policy.failure_wait(failures);
                debug!(
                    order = %number,
                    attempt = failures,
                    wait_ms = wait.as_millis() as u64,
                    reason = %reason,
                    "accrual query failed, backing off"
                );
                wait
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LedgerError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// HTTP accrual client configuration.
#[derive(Debug, Clone)]
pub struct AccrualClientConfig {
    /// Service root, e.g. `http://localhost:8081`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for AccrualClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl AccrualClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// [`AccrualSource`] over `POST {base}/orders/{number}`.
#[derive(Debug, Clone)]
pub struct HttpAccrualClient {
    client: Client,
    base_url: String,
}

impl HttpAccrualClient {
    pub fn new(config: AccrualClientConfig) -> Result<Self, LedgerError> {
        if config.base_url.is_empty() {
            return Err(LedgerError::Malformed(
                "accrual service address not configured".to_string(),
            ));
        }

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn order_url(&self, number: &OrderNumber) -> String {
        format!("{}/orders/{}", self.base_url, number)
    }

    /// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
    fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
        headers
            .get(header::RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl AccrualSource for HttpAccrualClient {
    async fn query(&self, number: &OrderNumber) -> AccrualResult {
        let response = match self.client.post(self.order_url(number)).send().await {
            Ok(response) => response,
            Err(e) => return AccrualResult::TransientFailure(e.to_string()),
        };

        match response.status() {
            StatusCode::OK => match response.json::<AccrualReport>().await {
                Ok(report) => AccrualResult::Report(report),
                Err(e) => AccrualResult::TransientFailure(format!("undecodable body: {e}")),
            },
            // Not known to the accrual service yet; same as REGISTERED.
            StatusCode::NO_CONTENT => AccrualResult::Report(AccrualReport {
                order: number.to_string(),
                status: AccrualStatus::Registered,
                accrual: 0,
            }),
            StatusCode::TOO_MANY_REQUESTS => {
                AccrualResult::RateLimited(Self::retry_after(response.headers()))
            }
            status => AccrualResult::TransientFailure(format!("HTTP {status}")),
        }
    }
}
