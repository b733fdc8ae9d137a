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

//! Credentials, sessions and password hashing.

use crate::base::{SessionToken, UserLogin};
use crate::LedgerError;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Login/password pair as submitted by a client.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }

    /// Rejects empty logins and passwords.
    pub fn validate(&self) -> Result<UserLogin, LedgerError> {
        if self.login.trim().is_empty() {
            return Err(LedgerError::Malformed("login must not be empty".to_string()));
        }
        if self.password.is_empty() {
            return Err(LedgerError::Malformed("password must not be empty".to_string()));
        }
        Ok(UserLogin(self.login.trim().to_string()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A stored login session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: SessionToken,
    pub user: UserLogin,
    pub expiry: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

/// What register/login hand back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub token: SessionToken,
    pub expiry: DateTime<Utc>,
}

pub fn hash_password(password: &str) -> Result<String, LedgerError> {
    use argon2::password_hash::SaltString;
    use argon2::password_hash::rand_core::OsRng;
    use argon2::{Argon2, PasswordHasher};

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| LedgerError::Storage(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Returns false for a mismatch and for an unparseable stored hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
