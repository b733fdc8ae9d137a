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

//! Orders and their status state machine.
//!
//! ```text
//!  NEW ──PROCESSING──► PROCESSING
//!   │                     │
//!   ├──INVALID────────────┼──► INVALID    (terminal)
//!   └──PROCESSED──────────┴──► PROCESSED  (terminal, credits accrual)
//! ```
//!
//! A `REGISTERED` signal from the accrual service means the calculation has
//! not started yet and never changes the stored status.

use crate::base::{OrderNumber, UserLogin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    /// `INVALID` and `PROCESSED` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        }
    }

    /// Inverse of [`OrderStatus::as_str`].
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(Self::New),
            "PROCESSING" => Some(Self::Processing),
            "INVALID" => Some(Self::Invalid),
            "PROCESSED" => Some(Self::Processed),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as reported by the accrual service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

/// Body of a successful accrual-service response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualReport {
    pub order: String,
    pub status: AccrualStatus,
    #[serde(default)]
    pub accrual: u64,
}

/// An uploaded purchase order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub number: OrderNumber,
    #[serde(skip)]
    pub user: Option<UserLogin>,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub accrual: u64,
    pub uploaded_at: DateTime<Utc>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Order {
    /// A freshly uploaded order: `NEW`, no accrual yet.
    pub fn new(number: OrderNumber, user: UserLogin, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            number,
            user: Some(user),
            status: OrderStatus::New,
            accrual: 0,
            uploaded_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// What reconciliation must do with an order after hearing from the
/// accrual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to persist.
    Unchanged,
    /// Store a new non-crediting status (`PROCESSING` or `INVALID`).
    Persist(OrderStatus),
    /// Move to `PROCESSED` and credit the owner with the accrual.
    Credit(u64),
}

/// Decides the transition for an order in `current` status given the latest
/// accrual report. Pure; never looks at storage.
pub fn next_transition(current: OrderStatus, report: &AccrualReport) -> Transition {
    if current.is_terminal() {
        return Transition::Unchanged;
    }

    match report.status {
        AccrualStatus::Registered => Transition::Unchanged,
        AccrualStatus::Processing if current == OrderStatus::Processing => Transition::Unchanged,
        AccrualStatus::Processing => Transition::Persist(OrderStatus::Processing),
        AccrualStatus::Invalid => Transition::Persist(OrderStatus::Invalid),
        AccrualStatus::Processed => Transition::Credit(report.accrual),
    }
}
