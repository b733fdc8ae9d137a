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

//! In-memory repository.
//!
//! # Thread Safety
//!
//! Users, sessions and orders live in [`DashMap`]s so requests for different
//! users proceed in parallel. Each user's balance sits in its own [`Wallet`]
//! behind a mutex.
//!
//! Lock order is always order entry, then wallet. A credit holds the order's
//! shard lock while it re-checks the status, credits the wallet and flips the
//! status, which serializes concurrent credits of the same order. No guard is
//! ever held across an `.await`.
//!
//! Each user's order numbers are also indexed in upload order, so listing a
//! user's orders touches only that user's entries. Uploads take the order
//! entry, then the index entry; readers copy the index before looking up any
//! order and never hold both.

use crate::auth::Session;
use crate::balance::{Balance, Wallet, Withdrawal};
use crate::base::{OrderNumber, SessionToken, UserLogin};
use crate::order::{Order, OrderStatus};
use crate::repository::{CreditOutcome, Repository, Result, reject_processed_update};
use crate::{Conflict, LedgerError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

#[derive(Debug)]
struct UserRecord {
    password_hash: String,
    wallet: Arc<Wallet>,
}

/// Repository backed by process memory. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    users: DashMap<UserLogin, UserRecord>,
    sessions: DashMap<SessionToken, Session>,
    orders: DashMap<OrderNumber, Order>,
    user_orders: DashMap<UserLogin, Vec<OrderNumber>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn wallet(&self, login: &UserLogin) -> Result<Arc<Wallet>> {
        self.users
            .get(login)
            .map(|user| Arc::clone(&user.wallet))
            .ok_or(LedgerError::NotFound("user"))
    }

    fn orders_of(&self, login: &UserLogin, keep: impl Fn(&Order) -> bool) -> Vec<Order> {
        let numbers = self
            .user_orders
            .get(login)
            .map(|numbers| numbers.clone())
            .unwrap_or_default();
        let mut orders: Vec<Order> = numbers
            .iter()
            .filter_map(|number| self.orders.get(number))
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| a.number.cmp(&b.number))
        });
        orders
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_user_password(&self, login: &UserLogin) -> Result<String> {
        self.users
            .get(login)
            .map(|user| user.password_hash.clone())
            .ok_or(LedgerError::NotFound("user"))
    }

    async fn create_user(&self, login: &UserLogin, password_hash: &str) -> Result<()> {
        match self.users.entry(login.clone()) {
            Entry::Occupied(_) => Err(Conflict::LoginTaken.into()),
            Entry::Vacant(entry) => {
                entry.insert(UserRecord {
                    password_hash: password_hash.to_string(),
                    wallet: Arc::new(Wallet::new()),
                });
                Ok(())
            }
        }
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        if !self.users.contains_key(&session.user) {
            return Err(LedgerError::NotFound("user"));
        }
        match self.sessions.entry(session.token.clone()) {
            Entry::Occupied(_) => Err(Conflict::SessionToken.into()),
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn get_session(&self, token: &SessionToken) -> Result<Session> {
        self.sessions
            .get(token)
            .map(|session| session.clone())
            .ok_or(LedgerError::NotFound("session"))
    }

    async fn get_user_orders(&self, login: &UserLogin) -> Result<Vec<Order>> {
        Ok(self.orders_of(login, |_| true))
    }

    async fn get_balance(&self, login: &UserLogin) -> Result<Balance> {
        Ok(self.wallet(login)?.balance())
    }

    async fn top_up_balance(&self, number: &OrderNumber, accrual: u64) -> Result<CreditOutcome> {
        let mut order = self
            .orders
            .get_mut(number)
            .ok_or(LedgerError::NotFound("order"))?;

        if order.is_terminal() {
            return Ok(CreditOutcome::AlreadyFinal);
        }

        let owner = order
            .user
            .clone()
            .ok_or_else(|| LedgerError::Storage(format!("order {number} has no owner")))?;
        // Resolve the wallet before touching anything so a missing owner
        // leaves the order as it was.
        let wallet = self.wallet(&owner)?;

        wallet.credit(accrual)?;
        order.status = OrderStatus::Processed;
        order.accrual = accrual;

        Ok(CreditOutcome::Applied {
            user: owner,
            amount: accrual,
        })
    }

    async fn get_withdrawals_info(&self, login: &UserLogin) -> Result<Vec<Withdrawal>> {
        Ok(self.wallet(login)?.withdrawals())
    }

    async fn withdraw(&self, login: &UserLogin, withdrawal: &Withdrawal) -> Result<()> {
        self.wallet(login)?.withdraw(withdrawal.clone())
    }

    async fn add_order(&self, login: &UserLogin, number: &OrderNumber) -> Result<Order> {
        if !self.users.contains_key(login) {
            return Err(LedgerError::NotFound("user"));
        }
        match self.orders.entry(number.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().user.as_ref() == Some(login) {
                    Err(Conflict::OrderOwnedBySelf.into())
                } else {
                    Err(Conflict::OrderOwnedByOther.into())
                }
            }
            Entry::Vacant(entry) => {
                let order = Order::new(number.clone(), login.clone(), Utc::now());
                entry.insert(order.clone());
                self.user_orders
                    .entry(login.clone())
                    .or_default()
                    .push(number.clone());
                Ok(order)
            }
        }
    }

    async fn update_order(&self, number: &OrderNumber, status: OrderStatus) -> Result<bool> {
        if status == OrderStatus::Processed {
            return Err(reject_processed_update(number));
        }
        let mut order = self
            .orders
            .get_mut(number)
            .ok_or(LedgerError::NotFound("order"))?;
        if order.is_terminal() || order.status == status {
            return Ok(false);
        }
        order.status = status;
        Ok(true)
    }

    async fn get_not_processed_orders(&self, login: &UserLogin) -> Result<Vec<Order>> {
        Ok(self.orders_of(login, |order| !order.is_terminal()))
    }
}
