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

//! Order reconciliation.
//!
//! [`Reconciler::reconcile`] brings all pending orders of a user up to date
//! with the accrual service before a read. Each order is handled by its own
//! task in a [`JoinSet`]; the call returns only once every task has finished.
//!
//! Failures stay per order: a network error or an exhausted retry budget
//! leaves that order in its last stored status and is picked up again on the
//! next call. They are collected in the [`ReconcileReport`] for logging and
//! never fail the call itself.
//!
//! Dropping the future returned by `reconcile` aborts every in-flight task.

use crate::accrual::{AccrualSource, RetryPolicy, fetch_accrual};
use crate::base::{OrderNumber, UserLogin};
use crate::ledger::BalanceLedger;
use crate::order::{Order, Transition, next_transition};
use crate::repository::{CreditOutcome, Repository};
use crate::LedgerError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default number of orders of one user reconciled at the same time.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Summary of one [`Reconciler::reconcile`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pending orders that were looked at.
    pub checked: usize,
    /// Orders whose stored state changed.
    pub changed: usize,
    pub failures: Vec<(OrderNumber, LedgerError)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    repository: Arc<dyn Repository>,
    ledger: BalanceLedger,
    accrual: Arc<dyn AccrualSource>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        repository: Arc<dyn Repository>,
        ledger: BalanceLedger,
        accrual: Arc<dyn AccrualSource>,
    ) -> Self {
        Self {
            repository,
            ledger,
            accrual,
            policy: RetryPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Brings one order up to date. Terminal orders are returned untouched
    /// without calling the accrual service.
    ///
    /// Returns the transition that was applied. When the credit loses a race
    /// with a concurrent reconciliation of the same order, the result is
    /// [`Transition::Unchanged`].
    pub async fn reconcile_order(
        &self,
        order: &Order,
        cancel: &CancellationToken,
    ) -> Result<Transition, LedgerError> {
        if order.is_terminal() {
            return Ok(Transition::Unchanged);
        }

        let report = fetch_accrual(self.accrual.as_ref(), &order.number, self.policy, cancel).await?;
        let transition = next_transition(order.status, &report);

        let applied = match transition {
            Transition::Unchanged => false,
            Transition::Persist(status) => {
                self.repository.update_order(&order.number, status).await?
            }
            Transition::Credit(accrual) => matches!(
                self.ledger.credit_accrual(&order.number, accrual).await?,
                CreditOutcome::Applied { .. }
            ),
        };

        debug!(
            order = %order.number,
            from = %order.status,
            signal = ?report.status,
            applied,
            "order reconciled"
        );

        Ok(if applied {
            transition
        } else {
            Transition::Unchanged
        })
    }

    /// Reconciles every `NEW`/`PROCESSING` order of `user` concurrently and
    /// waits for all of them.
    ///
    /// # Errors
    ///
    /// Only when the pending orders cannot be listed. Per-order failures end
    /// up in [`ReconcileReport::failures`].
    pub async fn reconcile(
        &self,
        user: &UserLogin,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, LedgerError> {
        let pending = self.repository.get_not_processed_orders(user).await?;
        let mut report = ReconcileReport {
            checked: pending.len(),
            ..ReconcileReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut numbers = HashMap::with_capacity(pending.len());

        for order in pending {
            let this = self.clone();
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            let number = order.number.clone();
            let handle = tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => this.reconcile_order(&order, &cancel).await,
                    Err(_) => Err(LedgerError::Cancelled),
                };
                (order.number, result)
            });
            numbers.insert(handle.id(), number);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (_, Ok(Transition::Unchanged)))) => {}
                Ok((_, (_, Ok(_)))) => report.changed += 1,
                Ok((_, (number, Err(e)))) => {
                    warn!(user = %user, order = %number, error = %e, "order reconciliation failed");
                    report.failures.push((number, e));
                }
                Err(e) => {
                    let Some(number) = numbers.remove(&e.id()) else {
                        warn!(user = %user, error = %e, "unknown reconciliation task died");
                        continue;
                    };
                    warn!(user = %user, order = %number, error = %e, "order reconciliation task died");
                    report.failures.push((
                        number,
                        LedgerError::Transient(format!("reconciliation task died: {e}")),
                    ));
                }
            }
        }

        Ok(report)
    }
}
