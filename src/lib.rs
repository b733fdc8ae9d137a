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

//! # Loyalty Ledger
//!
//! This library keeps loyalty point balances for users who upload purchase
//! order numbers. Points are granted by an external accrual service; each
//! order is reconciled with that service until it reaches a final status, and
//! its accrual is credited to the owner's balance exactly once. Users may then
//! spend points through withdrawals.
//!
//! ## Core Components
//!
//! - [`LoyaltyService`]: User-facing operations (register, upload, balance, withdraw)
//! - [`Reconciler`]: Brings a user's pending orders up to date, one task per order
//! - [`fetch_accrual`]: Accrual lookup with retry, backoff and rate-limit handling
//! - [`next_transition`]: Order state machine deciding what a report changes
//! - [`BalanceLedger`]: Sole writer of balances (credits and withdrawals)
//! - [`Repository`]: Storage seam, with [`MemoryRepository`] and a PostgreSQL
//!   implementation behind the `postgres` feature
//!
//! ## Example
//!
//! ```
//! use loyalty_ledger_rs::{AccrualStatus, AccrualReport, OrderStatus, Transition, next_transition};
//!
//! let report = AccrualReport {
//!     order: "79927398713".to_string(),
//!     status: AccrualStatus::Processed,
//!     accrual: 500,
//! };
//!
//! assert_eq!(next_transition(OrderStatus::New, &report), Transition::Credit(500));
//! assert_eq!(next_transition(OrderStatus::Processed, &report), Transition::Unchanged);
//! ```
//!
//! ## Thread Safety
//!
//! All components are `Send + Sync` and cheap to clone. Credits and
//! withdrawals are serialized per order and per user by the repository, so
//! any number of reconciliations may run for the same user at once.

pub mod accrual;
pub mod auth;
pub mod balance;
mod base;
pub mod config;
pub mod error;
pub mod ledger;
mod memory;
pub mod order;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod reconcile;
pub mod repository;
pub mod server;
pub mod service;

pub use accrual::{
    AccrualClientConfig, AccrualResult, AccrualSource, HttpAccrualClient, RetryPolicy,
    fetch_accrual,
};
pub use auth::{Credentials, Session, SessionGrant};
pub use balance::{Balance, Wallet, Withdrawal};
pub use base::{OrderNumber, SessionToken, UserLogin, luhn_valid};
pub use config::Config;
pub use error::{AuthFailure, Conflict, ErrorKind, LedgerError};
pub use ledger::BalanceLedger;
pub use memory::MemoryRepository;
pub use order::{AccrualReport, AccrualStatus, Order, OrderStatus, Transition, next_transition};
#[cfg(feature = "postgres")]
pub use postgres::PgRepository;
pub use reconcile::{ReconcileReport, Reconciler};
pub use repository::{CreditOutcome, Repository};
pub use server::router;
pub use service::{LoyaltyService, UploadOutcome};
