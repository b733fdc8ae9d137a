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

//! REST API over [`LoyaltyService`].
//!
//! ## Endpoints
//!
//! - `POST /api/user/register` - Create a user and open a session
//! - `POST /api/user/login` - Open a session
//! - `POST /api/user/orders` - Upload an order number (plain text body)
//! - `GET /api/user/orders` - List uploaded orders
//! - `GET /api/user/balance` - Current and withdrawn points
//! - `POST /api/user/balance/withdraw` - Spend points against an order number
//! - `GET /api/user/withdrawals` - List withdrawals
//!
//! Every route except register and login requires the `SESSION_TOKEN` cookie.
//!
//! ## Example Usage
//!
//! ```bash
//! curl -c jar -X POST http://localhost:8080/api/user/register \
//!   -H "Content-Type: application/json" \
//!   -d '{"login": "alice", "password": "secret"}'
//!
//! curl -b jar -X POST http://localhost:8080/api/user/orders -d 79927398713
//!
//! curl -b jar http://localhost:8080/api/user/balance
//! ```

use crate::auth::{Credentials, SessionGrant};
use crate::base::{SessionToken, UserLogin};
use crate::error::{AuthFailure, Conflict, LedgerError};
use crate::service::{LoyaltyService, UploadOutcome};
use axum::{
    Json, Router,
    extract::{FromRequestParts, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "SESSION_TOKEN";

// === Request/Response DTOs ===

/// Request body for `POST /api/user/balance/withdraw`.
///
/// ```json
/// {"order": "2377225624", "sum": 751}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    pub sum: u64,
}

/// Response body for errors.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub service: LoyaltyService,
}

// === Error Handling ===

/// Wrapper for converting [`LedgerError`] into HTTP responses.
pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(LedgerError::Malformed(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::Malformed(_) | LedgerError::InvalidAmount => StatusCode::BAD_REQUEST,
            LedgerError::InvalidOrderNumber(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::Conflict(Conflict::LoginTaken)
            | LedgerError::Conflict(Conflict::OrderOwnedBySelf)
            | LedgerError::Conflict(Conflict::OrderOwnedByOther) => StatusCode::CONFLICT,
            LedgerError::Auth(AuthFailure::WrongCredentials)
            | LedgerError::Auth(AuthFailure::NotAuthenticated) => StatusCode::UNAUTHORIZED,
            LedgerError::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Conflict(Conflict::SessionToken)
            | LedgerError::Transient(_)
            | LedgerError::Cancelled
            | LedgerError::Storage(_) => {
                error!(error = %self.0, code = self.0.code(), "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

// === Authentication ===

/// The user behind the request's session cookie.
pub struct AuthUser(pub UserLogin);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = session_token(&parts.headers)
            .ok_or(LedgerError::Auth(AuthFailure::NotAuthenticated))?;
        let user = state.service.authenticate(&token).await?;
        Ok(AuthUser(user))
    }
}

fn session_token(headers: &HeaderMap) -> Option<SessionToken> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, token)| SessionToken(token.to_string()))
        .filter(|token| !token.as_str().is_empty())
}

fn session_cookie(grant: &SessionGrant) -> Result<HeaderValue, LedgerError> {
    let cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; HttpOnly; Expires={}",
        grant.token,
        grant.expiry.format("%a, %d %b %Y %H:%M:%S GMT")
    );
    HeaderValue::from_str(&cookie).map_err(|e| LedgerError::Storage(e.to_string()))
}

fn with_session(grant: SessionGrant) -> Result<Response, ApiError> {
    let cookie = session_cookie(&grant)?;
    Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)]).into_response())
}

/// 204 for an empty list, 200 with the JSON array otherwise.
fn list_response<T: Serialize>(items: Vec<T>) -> Response {
    if items.is_empty() {
        StatusCode::NO_CONTENT.into_response()
    } else {
        Json(items).into_response()
    }
}

// === Handlers ===

/// POST /api/user/register
async fn register(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(credentials) = payload?;
    let grant = state.service.register_user(credentials).await?;
    with_session(grant)
}

/// POST /api/user/login
async fn login(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(credentials) = payload?;
    let grant = state.service.login(credentials).await?;
    with_session(grant)
}

/// POST /api/user/orders
async fn upload_order(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: String,
) -> Result<StatusCode, ApiError> {
    let raw = body.trim();
    if raw.is_empty() {
        return Err(LedgerError::Malformed("empty order number".to_string()).into());
    }
    match state.service.upload_order(&user, raw).await? {
        UploadOutcome::Accepted => Ok(StatusCode::ACCEPTED),
        UploadOutcome::AlreadyUploaded => Ok(StatusCode::OK),
    }
}

/// GET /api/user/orders
async fn list_orders(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Response, ApiError> {
    let cancel = state.service.shutdown_token().child_token();
    let orders = state.service.list_orders(&user, &cancel).await?;
    Ok(list_response(orders))
}

/// GET /api/user/balance
async fn balance(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Response, ApiError> {
    let cancel = state.service.shutdown_token().child_token();
    let balance = state.service.get_balance(&user, &cancel).await?;
    Ok(Json(balance).into_response())
}

/// POST /api/user/balance/withdraw
async fn withdraw(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<WithdrawRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;
    state
        .service
        .withdraw(&user, request.sum, &request.order)
        .await?;
    Ok(StatusCode::OK)
}

/// GET /api/user/withdrawals
async fn withdrawals(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Response, ApiError> {
    let withdrawals = state.service.list_withdrawals(&user).await?;
    Ok(list_response(withdrawals))
}

// === Router ===

pub fn router(service: LoyaltyService) -> Router {
    Router::new()
        .route("/api/user/register", post(register))
        .route("/api/user/login", post(login))
        .route("/api/user/orders", post(upload_order).get(list_orders))
        .route("/api/user/balance", get(balance))
        .route("/api/user/balance/withdraw", post(withdraw))
        .route("/api/user/withdrawals", get(withdrawals))
        .with_state(AppState { service })
}
