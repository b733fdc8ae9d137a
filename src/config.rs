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

//! Process configuration. Every flag falls back to an environment variable.

use crate::accrual::{AccrualClientConfig, RetryPolicy};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Loyalty Ledger - Points accrual and withdrawal service
///
/// Tracks uploaded orders, reconciles them with an external accrual service
/// and keeps per-user point balances.
#[derive(Parser, Debug, Clone)]
#[command(name = "loyalty-ledger-rs")]
#[command(about = "A loyalty points ledger backed by an accrual service", long_about = None)]
pub struct Config {
    /// Address the HTTP server listens on
    #[arg(short = 'a', long, env = "RUN_ADDRESS", default_value = "127.0.0.1:8080")]
    pub run_address: SocketAddr,

    /// PostgreSQL connection string; in-memory storage when absent
    #[arg(short = 'd', long, env = "DATABASE_URI")]
    pub database_uri: Option<String>,

    /// Root URL of the accrual service
    #[arg(
        short = 'r',
        long,
        env = "ACCRUAL_SYSTEM_ADDRESS",
        default_value = "http://127.0.0.1:8081"
    )]
    pub accrual_system_address: String,

    /// Log filter used when RUST_LOG is not set
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Timeout of a single accrual request, in seconds
    #[arg(long, env = "ACCRUAL_TIMEOUT_SECS", default_value_t = 10)]
    pub accrual_timeout_secs: u64,

    /// Failed accrual requests per order before giving up for this read
    #[arg(long, env = "ACCRUAL_MAX_ATTEMPTS", default_value_t = 4,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub accrual_max_attempts: u32,

    /// Wait after a 429 without a usable Retry-After header, in seconds
    #[arg(long, env = "RATE_LIMIT_FALLBACK_SECS", default_value_t = 60)]
    pub rate_limit_fallback_secs: u64,

    /// Orders of one user reconciled at the same time
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 8,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub reconcile_concurrency: u64,

    /// Session lifetime, in hours
    #[arg(long, env = "SESSION_TTL_HOURS", default_value_t = 24,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub session_ttl_hours: u32,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        let fallback = Duration::from_secs(self.rate_limit_fallback_secs);
        let policy = RetryPolicy::default()
            .with_max_attempts(self.accrual_max_attempts)
            .with_rate_limit_fallback(fallback);
        if fallback > policy.max_wait {
            policy.with_max_wait(fallback)
        } else {
            policy
        }
    }

    pub fn accrual_client_config(&self) -> AccrualClientConfig {
        AccrualClientConfig::default()
            .with_base_url(self.accrual_system_address.clone())
            .with_timeout(Duration::from_secs(self.accrual_timeout_secs))
    }

    pub fn reconcile_concurrency(&self) -> usize {
        usize::try_from(self.reconcile_concurrency).unwrap_or(usize::MAX)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.session_ttl_hours))
    }
}
