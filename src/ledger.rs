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

//! Balance ledger: the only writer of balance fields.
//!
//! - **Credits** move an order to `PROCESSED` and add its accrual to the
//!   owner's balance in one step. Crediting an order that is already terminal
//!   is a no-op, so reconciliation may call it any number of times.
//! - **Withdrawals** debit `current`, credit `withdrawn` and record the spend
//!   in one step, after re-checking funds under exclusive access.

use crate::balance::{Balance, Withdrawal};
use crate::base::{OrderNumber, UserLogin};
use crate::repository::{CreditOutcome, Repository};
use crate::LedgerError;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct BalanceLedger {
    repository: Arc<dyn Repository>,
}

impl BalanceLedger {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Credits `accrual` for `number` exactly once over the order's lifetime.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] if the order does not exist.
    /// - [`LedgerError::Storage`] if the unit of work failed; nothing was
    ///   persisted.
    pub async fn credit_accrual(
        &self,
        number: &OrderNumber,
        accrual: u64,
    ) -> Result<CreditOutcome, LedgerError> {
        let outcome = self.repository.top_up_balance(number, accrual).await?;
        match &outcome {
            CreditOutcome::Applied { user, amount } => {
                info!(order = %number, user = %user, amount, "accrual credited");
            }
            CreditOutcome::AlreadyFinal => {
                info!(order = %number, "order already final, credit skipped");
            }
        }
        Ok(outcome)
    }

    /// Spends `amount` points of `user` against `order_ref`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a zero amount.
    /// - [`LedgerError::InsufficientFunds`] when `amount` exceeds the current
    ///   balance; the balance is left unchanged.
    pub async fn withdraw(
        &self,
        user: &UserLogin,
        amount: u64,
        order_ref: OrderNumber,
    ) -> Result<Withdrawal, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let withdrawal = Withdrawal {
            order: order_ref,
            sum: amount,
            processed_at: Utc::now(),
        };

        match self.repository.withdraw(user, &withdrawal).await {
            Ok(()) => {
                info!(user = %user, order = %withdrawal.order, amount, "withdrawal recorded");
                Ok(withdrawal)
            }
            Err(LedgerError::InsufficientFunds) => {
                warn!(user = %user, amount, "withdrawal rejected: insufficient funds");
                Err(LedgerError::InsufficientFunds)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn balance(&self, user: &UserLogin) -> Result<Balance, LedgerError> {
        self.repository.get_balance(user).await
    }

    pub async fn withdrawals(&self, user: &UserLogin) -> Result<Vec<Withdrawal>, LedgerError> {
        self.repository.get_withdrawals_info(user).await
    }
}
