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

//! Storage contract for users, sessions, orders, balances and withdrawals.
//!
//! Implementations:
//! - [`MemoryRepository`](crate::MemoryRepository): in-process, always available.
//! - `PgRepository` (feature `postgres`): PostgreSQL via sqlx.

use crate::auth::Session;
use crate::balance::{Balance, Withdrawal};
use crate::base::{OrderNumber, SessionToken, UserLogin};
use crate::order::{Order, OrderStatus};
use crate::LedgerError;
use async_trait::async_trait;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Outcome of [`Repository::top_up_balance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Order moved to `PROCESSED` and `amount` was added to `user`'s balance.
    Applied { user: UserLogin, amount: u64 },
    /// Order was already terminal; nothing changed.
    AlreadyFinal,
}

/// Durable storage used by the ledger.
///
/// # Atomicity
///
/// - [`top_up_balance`](Repository::top_up_balance) moves the order from a
///   non-terminal status to `PROCESSED` and credits its owner in one unit of
///   work. Of any number of concurrent calls for the same order, exactly one
///   reports [`CreditOutcome::Applied`].
/// - [`withdraw`](Repository::withdraw) checks funds, debits `current`,
///   credits `withdrawn` and appends the record in one unit of work with
///   exclusive access to the user's balance.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Stored password hash. [`LedgerError::NotFound`] for unknown logins.
    async fn get_user_password(&self, login: &UserLogin) -> Result<String>;

    /// Creates a user with a zero balance.
    /// [`Conflict::LoginTaken`](crate::Conflict::LoginTaken) on duplicates.
    async fn create_user(&self, login: &UserLogin, password_hash: &str) -> Result<()>;

    /// [`Conflict::SessionToken`](crate::Conflict::SessionToken) if the token
    /// is already in use.
    async fn create_session(&self, session: &Session) -> Result<()>;

    /// [`LedgerError::NotFound`] for unknown tokens. Expiry is not checked here.
    async fn get_session(&self, token: &SessionToken) -> Result<Session>;

    /// All orders of `login`, oldest upload first.
    async fn get_user_orders(&self, login: &UserLogin) -> Result<Vec<Order>>;

    async fn get_balance(&self, login: &UserLogin) -> Result<Balance>;

    /// Marks the order `PROCESSED` with `accrual` and credits its owner.
    async fn top_up_balance(&self, number: &OrderNumber, accrual: u64) -> Result<CreditOutcome>;

    /// Withdrawals of `login`, oldest first.
    async fn get_withdrawals_info(&self, login: &UserLogin) -> Result<Vec<Withdrawal>>;

    /// [`LedgerError::InsufficientFunds`] leaves everything unchanged.
    async fn withdraw(&self, login: &UserLogin, withdrawal: &Withdrawal) -> Result<()>;

    /// Registers a `NEW` order owned by `login`.
    ///
    /// [`Conflict::OrderOwnedBySelf`](crate::Conflict::OrderOwnedBySelf) or
    /// [`Conflict::OrderOwnedByOther`](crate::Conflict::OrderOwnedByOther)
    /// when the number is already taken; the original owner is kept.
    async fn add_order(&self, login: &UserLogin, number: &OrderNumber) -> Result<Order>;

    /// Stores a non-crediting status. Only applies while the stored status is
    /// non-terminal; returns whether a row changed. `PROCESSED` must go through
    /// [`top_up_balance`](Repository::top_up_balance) and is rejected.
    async fn update_order(&self, number: &OrderNumber, status: OrderStatus) -> Result<bool>;

    /// Orders of `login` still in `NEW` or `PROCESSING`.
    async fn get_not_processed_orders(&self, login: &UserLogin) -> Result<Vec<Order>>;
}

pub(crate) fn reject_processed_update(number: &OrderNumber) -> LedgerError {
    LedgerError::Storage(format!(
        "order {number}: PROCESSED can only be set together with its credit"
    ))
}
