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

//! Core identifier types for users, orders and sessions.

use crate::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Login of a registered user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UserLogin(pub String);

impl UserLogin {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserLogin {
    fn from(login: &str) -> Self {
        UserLogin(login.to_string())
    }
}

/// Purchase-order number.
///
/// Always a non-empty string of ASCII digits that passes the Luhn check.
/// The only way to build one is [`OrderNumber::parse`] (or `FromStr`), so
/// holding an `OrderNumber` means the checksum has been verified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Validates `raw` (surrounding whitespace ignored) and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidOrderNumber`] when the input is empty,
    /// contains anything but digits, or fails the Luhn checksum.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let digits = raw.trim();
        if luhn_valid(digits) {
            Ok(OrderNumber(digits.to_string()))
        } else {
            Err(LedgerError::InvalidOrderNumber(digits.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for OrderNumber {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderNumber::parse(s)
    }
}

impl<'de> Deserialize<'de> for OrderNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        OrderNumber::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque session token handed to clients in the `SESSION_TOKEN` cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SessionToken(pub String);

impl SessionToken {
    /// Generates a fresh random token.
    pub fn generate() -> Self {
        SessionToken(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Luhn (mod 10) checksum over a digit string.
pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();

    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luhn_accepts_known_valid_numbers() {
        assert!(luhn_valid("79927398713"));
        assert!(luhn_valid("4561261212345467"));
        assert!(luhn_valid("0"));
    }

    #[test]
    fn luhn_rejects_bad_checksum() {
        assert!(!luhn_valid("79927398710"));
        assert!(!luhn_valid("4561261212345464"));
    }

    #[test]
    fn luhn_rejects_non_digits() {
        assert!(!luhn_valid(""));
        assert!(!luhn_valid("7992-7398-713"));
        assert!(!luhn_valid("abc"));
        assert!(!luhn_valid("７９"));
    }

    #[test]
    fn parse_trims_whitespace() {
        let number = OrderNumber::parse(" 79927398713\n").unwrap();
        assert_eq!(number.as_str(), "79927398713");
    }

    #[test]
    fn parse_reports_the_rejected_input() {
        let err = OrderNumber::parse("12345").unwrap_err();
        assert_eq!(err, LedgerError::InvalidOrderNumber("12345".to_string()));
    }

    #[test]
    fn order_number_deserialize_validates() {
        let ok: OrderNumber = serde_json::from_str("\"79927398713\"").unwrap();
        assert_eq!(ok.to_string(), "79927398713");

        let bad = serde_json::from_str::<OrderNumber>("\"79927398710\"");
        assert!(bad.is_err());
    }

    #[test]
    fn generated_tokens_differ() {
        assert_ne!(SessionToken::generate(), SessionToken::generate());
    }
}
