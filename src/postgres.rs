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

//! PostgreSQL repository.
//!
//! Multi-row writes (credit, withdrawal) run inside a single transaction. The
//! credit is a conditional `UPDATE ... WHERE status IN ('NEW', 'PROCESSING')`
//! so only one of several concurrent credits for the same order can match.
//! Withdrawals lock the user row with `SELECT ... FOR UPDATE` before checking
//! funds.
//!
//! The schema is created by [`PgRepository::migrate`], which the binary calls
//! once at startup; [`PgRepository::connect`] never touches it.

use crate::auth::Session;
use crate::balance::{Balance, Withdrawal};
use crate::base::{OrderNumber, SessionToken, UserLogin};
use crate::order::{Order, OrderStatus};
use crate::repository::{CreditOutcome, Repository, Result, reject_processed_update};
use crate::{Conflict, LedgerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const NUMERIC_OUT_OF_RANGE: &str = "22003";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        login         TEXT PRIMARY KEY,
        password_hash TEXT NOT NULL,
        current       BIGINT NOT NULL DEFAULT 0 CHECK (current >= 0),
        withdrawn     BIGINT NOT NULL DEFAULT 0 CHECK (withdrawn >= 0)
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        token  TEXT PRIMARY KEY,
        login  TEXT NOT NULL REFERENCES users (login),
        expiry TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS orders (
        number      TEXT PRIMARY KEY,
        login       TEXT NOT NULL REFERENCES users (login),
        status      TEXT NOT NULL DEFAULT 'NEW',
        accrual     BIGINT NOT NULL DEFAULT 0,
        uploaded_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS orders_login_status ON orders (login, status)",
    "CREATE TABLE IF NOT EXISTS withdrawals (
        id           BIGSERIAL PRIMARY KEY,
        login        TEXT NOT NULL REFERENCES users (login),
        order_ref    TEXT NOT NULL,
        sum          BIGINT NOT NULL CHECK (sum > 0),
        processed_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS withdrawals_login ON withdrawals (login)",
];

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(16).connect(uri).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates missing tables and indexes. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    async fn order_exists(&self, number: &OrderNumber) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM orders WHERE number = $1")
            .bind(number.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn db_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn to_db_amount(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| LedgerError::InvalidAmount)
}

fn from_db_amount(amount: i64) -> Result<u64> {
    u64::try_from(amount).map_err(|_| LedgerError::Storage(format!("negative amount {amount}")))
}

fn stored_number(raw: &str) -> Result<OrderNumber> {
    OrderNumber::parse(raw).map_err(|_| LedgerError::Storage(format!("corrupt order number {raw:?}")))
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let number: String = row.try_get("number")?;
    let login: String = row.try_get("login")?;
    let status: String = row.try_get("status")?;
    let accrual: i64 = row.try_get("accrual")?;
    let uploaded_at: DateTime<Utc> = row.try_get("uploaded_at")?;

    Ok(Order {
        number: stored_number(&number)?,
        user: Some(UserLogin(login)),
        status: OrderStatus::from_db(&status)
            .ok_or_else(|| LedgerError::Storage(format!("unknown order status {status:?}")))?,
        accrual: from_db_amount(accrual)?,
        uploaded_at,
    })
}

fn withdrawal_from_row(row: &PgRow) -> Result<Withdrawal> {
    let order_ref: String = row.try_get("order_ref")?;
    let sum: i64 = row.try_get("sum")?;
    Ok(Withdrawal {
        order: stored_number(&order_ref)?,
        sum: from_db_amount(sum)?,
        processed_at: row.try_get("processed_at")?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_user_password(&self, login: &UserLogin) -> Result<String> {
        let row = sqlx::query("SELECT password_hash FROM users WHERE login = $1")
            .bind(login.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::NotFound("user"))?;
        Ok(row.try_get("password_hash")?)
    }

    async fn create_user(&self, login: &UserLogin, password_hash: &str) -> Result<()> {
        let result = sqlx::query("INSERT INTO users (login, password_hash) VALUES ($1, $2)")
            .bind(login.as_str())
            .bind(password_hash)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if db_code(&e).as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(Conflict::LoginTaken.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let result = sqlx::query("INSERT INTO sessions (token, login, expiry) VALUES ($1, $2, $3)")
            .bind(session.token.as_str())
            .bind(session.user.as_str())
            .bind(session.expiry)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => match db_code(&e).as_deref() {
                Some(UNIQUE_VIOLATION) => Err(Conflict::SessionToken.into()),
                Some(FOREIGN_KEY_VIOLATION) => Err(LedgerError::NotFound("user")),
                _ => Err(e.into()),
            },
        }
    }

    async fn get_session(&self, token: &SessionToken) -> Result<Session> {
        let row = sqlx::query("SELECT login, expiry FROM sessions WHERE token = $1")
            .bind(token.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::NotFound("session"))?;
        Ok(Session {
            token: token.clone(),
            user: UserLogin(row.try_get("login")?),
            expiry: row.try_get("expiry")?,
        })
    }

    async fn get_user_orders(&self, login: &UserLogin) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT number, login, status, accrual, uploaded_at FROM orders
             WHERE login = $1 ORDER BY uploaded_at, number",
        )
        .bind(login.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn get_balance(&self, login: &UserLogin) -> Result<Balance> {
        let row = sqlx::query("SELECT current, withdrawn FROM users WHERE login = $1")
            .bind(login.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::NotFound("user"))?;
        Ok(Balance {
            current: from_db_amount(row.try_get("current")?)?,
            withdrawn: from_db_amount(row.try_get("withdrawn")?)?,
        })
    }

    async fn top_up_balance(&self, number: &OrderNumber, accrual: u64) -> Result<CreditOutcome> {
        let amount = to_db_amount(accrual)?;
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE orders SET status = 'PROCESSED', accrual = $2
             WHERE number = $1 AND status IN ('NEW', 'PROCESSING')
             RETURNING login",
        )
        .bind(number.as_str())
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = claimed else {
            drop(tx);
            return if self.order_exists(number).await? {
                Ok(CreditOutcome::AlreadyFinal)
            } else {
                Err(LedgerError::NotFound("order"))
            };
        };
        let owner = UserLogin(row.try_get("login")?);

        let credited = sqlx::query("UPDATE users SET current = current + $2 WHERE login = $1")
            .bind(owner.as_str())
            .bind(amount)
            .execute(&mut *tx)
            .await
            .map_err(|e| match db_code(&e).as_deref() {
                Some(NUMERIC_OUT_OF_RANGE) => LedgerError::InvalidAmount,
                _ => e.into(),
            })?;
        if credited.rows_affected() != 1 {
            return Err(LedgerError::Storage(format!(
                "owner {owner} of order {number} has no balance row"
            )));
        }

        tx.commit().await?;
        Ok(CreditOutcome::Applied {
            user: owner,
            amount: accrual,
        })
    }

    async fn get_withdrawals_info(&self, login: &UserLogin) -> Result<Vec<Withdrawal>> {
        let rows = sqlx::query(
            "SELECT order_ref, sum, processed_at FROM withdrawals
             WHERE login = $1 ORDER BY processed_at, id",
        )
        .bind(login.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(withdrawal_from_row).collect()
    }

    async fn withdraw(&self, login: &UserLogin, withdrawal: &Withdrawal) -> Result<()> {
        if withdrawal.sum == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let sum = to_db_amount(withdrawal.sum)?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT current FROM users WHERE login = $1 FOR UPDATE")
            .bind(login.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::NotFound("user"))?;
        let current: i64 = row.try_get("current")?;
        if current < sum {
            return Err(LedgerError::InsufficientFunds);
        }

        sqlx::query(
            "UPDATE users SET current = current - $2, withdrawn = withdrawn + $2 WHERE login = $1",
        )
        .bind(login.as_str())
        .bind(sum)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO withdrawals (login, order_ref, sum, processed_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(login.as_str())
        .bind(withdrawal.order.as_str())
        .bind(sum)
        .bind(withdrawal.processed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn add_order(&self, login: &UserLogin, number: &OrderNumber) -> Result<Order> {
        let inserted = sqlx::query(
            "INSERT INTO orders (number, login, status, uploaded_at) VALUES ($1, $2, 'NEW', $3)
             ON CONFLICT (number) DO NOTHING
             RETURNING number, login, status, accrual, uploaded_at",
        )
        .bind(number.as_str())
        .bind(login.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await;

        let inserted = match inserted {
            Ok(row) => row,
            Err(e) if db_code(&e).as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                return Err(LedgerError::NotFound("user"));
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(row) = inserted {
            return order_from_row(&row);
        }

        let row = sqlx::query("SELECT login FROM orders WHERE number = $1")
            .bind(number.as_str())
            .fetch_one(&self.pool)
            .await?;
        let owner: String = row.try_get("login")?;
        if owner == login.as_str() {
            Err(Conflict::OrderOwnedBySelf.into())
        } else {
            Err(Conflict::OrderOwnedByOther.into())
        }
    }

    async fn update_order(&self, number: &OrderNumber, status: OrderStatus) -> Result<bool> {
        if status == OrderStatus::Processed {
            return Err(reject_processed_update(number));
        }
        let result = sqlx::query(
            "UPDATE orders SET status = $2
             WHERE number = $1 AND status IN ('NEW', 'PROCESSING') AND status <> $2",
        )
        .bind(number.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            Ok(true)
        } else if self.order_exists(number).await? {
            Ok(false)
        } else {
            Err(LedgerError::NotFound("order"))
        }
    }

    async fn get_not_processed_orders(&self, login: &UserLogin) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT number, login, status, accrual, uploaded_at FROM orders
             WHERE login = $1 AND status IN ('NEW', 'PROCESSING')
             ORDER BY uploaded_at, number",
        )
        .bind(login.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }
}
