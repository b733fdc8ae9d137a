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

//! Per-user point balances.
//!
//! # Example
//!
//! ```
//! use loyalty_ledger_rs::Wallet;
//!
//! let wallet = Wallet::new();
//! wallet.credit(500).unwrap();
//! assert_eq!(wallet.balance().current, 500);
//! ```

use crate::base::OrderNumber;
use crate::LedgerError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Largest balance a wallet can hold. Matches the `BIGINT` columns of the
/// PostgreSQL store so both stores accept the same credits.
pub const MAX_POINTS: u64 = i64::MAX as u64;

/// Snapshot of a user's balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable points.
    pub current: u64,
    /// Lifetime total withdrawn.
    pub withdrawn: u64,
}

/// A recorded spend of points against an order reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub order: OrderNumber,
    pub sum: u64,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct WalletData {
    current: u64,
    withdrawn: u64,
    withdrawals: Vec<Withdrawal>,
}

impl WalletData {
    fn assert_invariants(&self) {
        debug_assert!(
            self.withdrawals.iter().map(|w| w.sum).sum::<u64>() == self.withdrawn,
            "Invariant violated: withdrawn {} does not match withdrawal log",
            self.withdrawn
        );
    }

    /// Increases the spendable balance. Fails without changes if the result
    /// would exceed [`MAX_POINTS`].
    fn credit(&mut self, amount: u64) -> Result<(), LedgerError> {
        self.current = self
            .current
            .checked_add(amount)
            .filter(|total| *total <= MAX_POINTS)
            .ok_or(LedgerError::InvalidAmount)?;
        self.assert_invariants();
        Ok(())
    }

    /// Moves `withdrawal.sum` from current to withdrawn and logs it.
    fn withdraw(&mut self, withdrawal: Withdrawal) -> Result<(), LedgerError> {
        if withdrawal.sum == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if self.current < withdrawal.sum {
            return Err(LedgerError::InsufficientFunds);
        }
        self.current -= withdrawal.sum;
        self.withdrawn += withdrawal.sum;
        self.withdrawals.push(withdrawal);
        self.assert_invariants();
        Ok(())
    }
}

/// Balance plus withdrawal history of one user.
///
/// All mutation happens under a single lock, so the funds check in
/// [`Wallet::withdraw`] and the debit it guards are one atomic step.
#[derive(Debug, Default)]
pub struct Wallet {
    inner: Mutex<WalletData>,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> Balance {
        let data = self.inner.lock();
        Balance {
            current: data.current,
            withdrawn: data.withdrawn,
        }
    }

    pub fn withdrawals(&self) -> Vec<Withdrawal> {
        self.inner.lock().withdrawals.clone()
    }

    /// # Errors
    ///
    /// [`LedgerError::InvalidAmount`] when the balance would exceed
    /// [`MAX_POINTS`]; the wallet is left untouched.
    pub fn credit(&self, amount: u64) -> Result<(), LedgerError> {
        self.inner.lock().credit(amount)
    }

    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] for a zero sum.
    /// - [`LedgerError::InsufficientFunds`] when `sum > current`; the wallet
    ///   is left untouched.
    pub fn withdraw(&self, withdrawal: Withdrawal) -> Result<(), LedgerError> {
        self.inner.lock().withdraw(withdrawal)
    }
}
