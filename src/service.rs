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

//! User-facing operations.
//!
//! | Operation | Reconciles first | Errors |
//! |-----------|------------------|--------|
//! | [`register_user`](LoyaltyService::register_user) | no | malformed, login taken |
//! | [`login`](LoyaltyService::login) | no | malformed, wrong credentials |
//! | [`list_orders`](LoyaltyService::list_orders) | yes | |
//! | [`upload_order`](LoyaltyService::upload_order) | in background | bad checksum, owned by another user |
//! | [`get_balance`](LoyaltyService::get_balance) | yes | |
//! | [`withdraw`](LoyaltyService::withdraw) | no | bad number, insufficient funds |
//! | [`list_withdrawals`](LoyaltyService::list_withdrawals) | no | |
//!
//! Reconciliation failures are logged and otherwise ignored; the next read
//! tries again.

use crate::auth::{Credentials, Session, SessionGrant, hash_password, verify_password};
use crate::balance::{Balance, Withdrawal};
use crate::base::{OrderNumber, SessionToken, UserLogin};
use crate::ledger::BalanceLedger;
use crate::order::Order;
use crate::reconcile::Reconciler;
use crate::repository::Repository;
use crate::{AuthFailure, Conflict, LedgerError};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::hours(24);

/// Token regeneration attempts before giving up on a colliding token.
const MAX_TOKEN_ATTEMPTS: usize = 8;

/// Poll interval of [`LoyaltyService::wait_background`].
const BACKGROUND_POLL: std::time::Duration = std::time::Duration::from_millis(5);

/// Result of a successful [`LoyaltyService::upload_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Order registered for the first time.
    Accepted,
    /// The same user had already uploaded this number.
    AlreadyUploaded,
}

#[derive(Clone)]
pub struct LoyaltyService {
    repository: Arc<dyn Repository>,
    ledger: BalanceLedger,
    reconciler: Reconciler,
    session_ttl: Duration,
    background: TaskTracker,
    shutdown: CancellationToken,
}

impl LoyaltyService {
    pub fn new(repository: Arc<dyn Repository>, reconciler: Reconciler) -> Self {
        Self {
            ledger: BalanceLedger::new(Arc::clone(&repository)),
            repository,
            reconciler,
            session_ttl: DEFAULT_SESSION_TTL,
            background: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Token that, when cancelled, aborts background reconciliations.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels background work and waits for it to finish. No new background
    /// work is started afterwards.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.background.close();
        self.background.wait().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.background.is_closed()
    }

    /// Waits until no background reconciliation is running. Leaves the
    /// tracker open, so it is safe to call alongside [`shutdown`](Self::shutdown).
    pub async fn wait_background(&self) {
        while !self.background.is_empty() {
            tokio::time::sleep(BACKGROUND_POLL).await;
        }
    }

    pub async fn register_user(&self, credentials: Credentials) -> Result<SessionGrant, LedgerError> {
        let login = credentials.validate()?;
        let hash = hash_password(&credentials.password)?;
        self.repository.create_user(&login, &hash).await?;
        info!(user = %login, "user registered");
        self.open_session(login).await
    }

    pub async fn login(&self, credentials: Credentials) -> Result<SessionGrant, LedgerError> {
        let login = credentials.validate()?;
        let stored = match self.repository.get_user_password(&login).await {
            Ok(hash) => hash,
            Err(LedgerError::NotFound(_)) => return Err(AuthFailure::WrongCredentials.into()),
            Err(e) => return Err(e),
        };
        if !verify_password(&credentials.password, &stored) {
            debug!(user = %login, "password mismatch");
            return Err(AuthFailure::WrongCredentials.into());
        }
        self.open_session(login).await
    }

    /// Resolves a session token to its user.
    ///
    /// # Errors
    ///
    /// [`AuthFailure::NotAuthenticated`] for unknown or expired tokens.
    pub async fn authenticate(&self, token: &SessionToken) -> Result<UserLogin, LedgerError> {
        let session = match self.repository.get_session(token).await {
            Ok(session) => session,
            Err(LedgerError::NotFound(_)) => return Err(AuthFailure::NotAuthenticated.into()),
            Err(e) => return Err(e),
        };
        if session.is_expired_at(Utc::now()) {
            return Err(AuthFailure::NotAuthenticated.into());
        }
        Ok(session.user)
    }

    pub async fn list_orders(
        &self,
        user: &UserLogin,
        cancel: &CancellationToken,
    ) -> Result<Vec<Order>, LedgerError> {
        self.refresh(user, cancel).await;
        self.repository.get_user_orders(user).await
    }

    /// Registers `raw_number` for `user`.
    ///
    /// A new order is reconciled in the background; the call does not wait
    /// for the accrual service.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidOrderNumber`] when the checksum fails.
    /// - [`Conflict::OrderOwnedByOther`] when another user owns the number.
    pub async fn upload_order(
        &self,
        user: &UserLogin,
        raw_number: &str,
    ) -> Result<UploadOutcome, LedgerError> {
        let number = OrderNumber::parse(raw_number)?;
        match self.repository.add_order(user, &number).await {
            Ok(_) => {
                info!(user = %user, order = %number, "order uploaded");
                self.spawn_refresh(user.clone());
                Ok(UploadOutcome::Accepted)
            }
            Err(LedgerError::Conflict(Conflict::OrderOwnedBySelf)) => {
                Ok(UploadOutcome::AlreadyUploaded)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_balance(
        &self,
        user: &UserLogin,
        cancel: &CancellationToken,
    ) -> Result<Balance, LedgerError> {
        self.refresh(user, cancel).await;
        self.ledger.balance(user).await
    }

    /// # Errors
    ///
    /// - [`LedgerError::InvalidOrderNumber`] for a bad reference.
    /// - [`LedgerError::InsufficientFunds`] when `amount` exceeds the balance.
    pub async fn withdraw(
        &self,
        user: &UserLogin,
        amount: u64,
        order_ref: &str,
    ) -> Result<Withdrawal, LedgerError> {
        let order_ref = OrderNumber::parse(order_ref)?;
        self.ledger.withdraw(user, amount, order_ref).await
    }

    pub async fn list_withdrawals(&self, user: &UserLogin) -> Result<Vec<Withdrawal>, LedgerError> {
        self.ledger.withdrawals(user).await
    }

    async fn open_session(&self, user: UserLogin) -> Result<SessionGrant, LedgerError> {
        let expiry = Utc::now() + self.session_ttl;
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let session = Session {
                token: SessionToken::generate(),
                user: user.clone(),
                expiry,
            };
            match self.repository.create_session(&session).await {
                Ok(()) => {
                    return Ok(SessionGrant {
                        token: session.token,
                        expiry,
                    });
                }
                Err(LedgerError::Conflict(Conflict::SessionToken)) => {
                    warn!(user = %user, "session token collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::Storage(
            "could not generate a unique session token".to_string(),
        ))
    }

    async fn refresh(&self, user: &UserLogin, cancel: &CancellationToken) {
        match self.reconciler.reconcile(user, cancel).await {
            Ok(report) if !report.is_clean() => {
                debug!(
                    user = %user,
                    failed = report.failures.len(),
                    "some orders left pending until the next read"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(user = %user, error = %e, "reconciliation skipped"),
        }
    }

    fn spawn_refresh(&self, user: UserLogin) {
        if self.shutdown.is_cancelled() {
            debug!(user = %user, "shutting down, order left for the next read");
            return;
        }
        let this = self.clone();
        let cancel = self.shutdown.child_token();
        self.background.spawn(async move {
            this.refresh(&user, &cancel).await;
        });
    }
}
