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

//! Error types for the loyalty ledger.

use thiserror::Error;

/// Which party already holds a contested resource.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Login is taken by an existing user
    #[error("login has already been taken by another user")]
    LoginTaken,

    /// Order number was already uploaded by the same user
    #[error("order has already been uploaded by this user")]
    OrderOwnedBySelf,

    /// Order number belongs to a different user
    #[error("order has already been uploaded by another user")]
    OrderOwnedByOther,

    /// Freshly generated session token collided with a stored one
    #[error("session token already exists")]
    SessionToken,
}

/// Why a caller could not be authenticated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("wrong login or password")]
    WrongCredentials,

    #[error("not authenticated")]
    NotAuthenticated,
}

/// Coarse error class, used to decide retry and surfacing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Auth,
    InsufficientFunds,
    NotFound,
    Transient,
    Storage,
}

/// Ledger errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Order number is not a Luhn-valid digit string
    #[error("invalid order number: {0:?}")]
    InvalidOrderNumber(String),

    /// Request payload could not be understood
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Amount is zero
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error(transparent)]
    Auth(#[from] AuthFailure),

    /// Withdrawal would exceed the current balance
    #[error("insufficient funds")]
    InsufficientFunds,

    /// Referenced user, order or session does not exist
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Network or service hiccup; safe to retry later
    #[error("transient failure: {0}")]
    Transient(String),

    /// Caller gave up waiting
    #[error("operation cancelled")]
    Cancelled,

    /// Persistent storage failed; the surrounding unit of work was rolled back
    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidOrderNumber(_) | Self::Malformed(_) | Self::InvalidAmount => {
                ErrorKind::Validation
            }
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Auth(_) => ErrorKind::Auth,
            Self::InsufficientFunds => ErrorKind::InsufficientFunds,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Transient(_) | Self::Cancelled => ErrorKind::Transient,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Stable machine-readable discriminant for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidOrderNumber(_) => "INVALID_ORDER_NUMBER",
            Self::Malformed(_) => "MALFORMED_REQUEST",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::Conflict(Conflict::LoginTaken) => "LOGIN_TAKEN",
            Self::Conflict(Conflict::OrderOwnedBySelf) => "ORDER_ALREADY_UPLOADED",
            Self::Conflict(Conflict::OrderOwnedByOther) => "ORDER_OWNED_BY_ANOTHER_USER",
            Self::Conflict(Conflict::SessionToken) => "SESSION_TOKEN_COLLISION",
            Self::Auth(AuthFailure::WrongCredentials) => "WRONG_CREDENTIALS",
            Self::Auth(AuthFailure::NotAuthenticated) => "NOT_AUTHENTICATED",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Transient(_) => "TRANSIENT_FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::Storage(_) => "STORAGE_FAILURE",
        }
    }

    /// Whether a later attempt of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Transient(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}
