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

//! Integration tests for the REST API.
//!
//! Each test starts the real router and a stub accrual service, both on
//! ephemeral ports, and talks to them over HTTP with `reqwest`.

use axum::{
    Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use loyalty_ledger_rs::{
    AccrualClientConfig, AccrualResult, AccrualSource, AccrualStatus, BalanceLedger,
    HttpAccrualClient, LoyaltyService, MemoryRepository, OrderNumber, Reconciler, RetryPolicy,
    router,
};
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

const EARNS_500: &str = "79927398713";
const NOT_YET_KNOWN: &str = "2377225624";
const THROTTLED: &str = "4561261212345467";
const BROKEN: &str = "18";

// === Stub accrual service ===

static STUB_CALLS: AtomicU32 = AtomicU32::new(0);

async fn stub_accrual(Path(number): Path<String>) -> Response {
    STUB_CALLS.fetch_add(1, Ordering::SeqCst);
    match number.as_str() {
        EARNS_500 => Json(json!({"order": number, "status": "PROCESSED", "accrual": 500}))
            .into_response(),
        NOT_YET_KNOWN => StatusCode::NO_CONTENT.into_response(),
        THROTTLED => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "7")],
            "No more than N requests per minute allowed",
        )
            .into_response(),
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_accrual_stub() -> String {
    spawn(Router::new().route("/orders/{number}", post(stub_accrual))).await
}

// === Test server ===

/// Real router over in-memory storage, wired to the stub accrual service.
struct TestServer {
    base_url: String,
    client: Client,
}

impl TestServer {
    async fn new() -> Self {
        let accrual_url = spawn_accrual_stub().await;
        let accrual = HttpAccrualClient::new(
            AccrualClientConfig::default()
                .with_base_url(accrual_url)
                .with_timeout(Duration::from_secs(2)),
        )
        .unwrap();

        let repo = Arc::new(MemoryRepository::new());
        let reconciler = Reconciler::new(
            repo.clone(),
            BalanceLedger::new(repo.clone()),
            Arc::new(accrual),
        )
        .with_policy(
            RetryPolicy::default()
                .with_max_attempts(1)
                .with_max_rate_limited(0),
        );
        let service = LoyaltyService::new(repo, reconciler);
        let base_url = spawn(router(service)).await;

        TestServer {
            base_url,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Registers `login` and returns the `Cookie` header value to send.
    async fn register(&self, login: &str) -> String {
        let response = self
            .client
            .post(self.url("/api/user/register"))
            .json(&json!({"login": login, "password": "pa55word"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        cookie_from(response.headers())
    }

    async fn upload(&self, cookie: &str, number: &str) -> StatusCode {
        self.client
            .post(self.url("/api/user/orders"))
            .header(header::COOKIE, cookie)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(number.to_string())
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn get(&self, cookie: &str, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header(header::COOKIE, cookie)
            .send()
            .await
            .unwrap()
    }

    async fn withdraw(&self, cookie: &str, order: &str, sum: u64) -> StatusCode {
        self.client
            .post(self.url("/api/user/balance/withdraw"))
            .header(header::COOKIE, cookie)
            .json(&json!({"order": order, "sum": sum}))
            .send()
            .await
            .unwrap()
            .status()
    }
}

fn cookie_from(headers: &HeaderMap) -> String {
    let set_cookie = headers
        .get(header::SET_COOKIE)
        .expect("session cookie")
        .to_str()
        .unwrap();
    let pair = set_cookie.split(';').next().unwrap().trim();
    assert!(pair.starts_with("SESSION_TOKEN="));
    pair.to_string()
}

// === Tests ===

#[tokio::test]
async fn register_login_and_auth_errors() {
    let server = TestServer::new().await;
    server.register("alice").await;

    let again = server
        .client
        .post(server.url("/api/user/register"))
        .json(&json!({"login": "alice", "password": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["code"], "LOGIN_TAKEN");

    let login = server
        .client
        .post(server.url("/api/user/login"))
        .json(&json!({"login": "alice", "password": "pa55word"}))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::OK);
    let cookie = cookie_from(login.headers());
    assert_eq!(
        server.get(&cookie, "/api/user/balance").await.status(),
        StatusCode::OK
    );

    let wrong = server
        .client
        .post(server.url("/api/user/login"))
        .json(&json!({"login": "alice", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let garbage = server
        .client
        .post(server.url("/api/user/login"))
        .header(header::CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

    let anonymous = server.client.get(server.url("/api/user/orders")).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        server
            .get("SESSION_TOKEN=forged", "/api/user/withdrawals")
            .await
            .status(),
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn order_upload_status_codes() {
    let server = TestServer::new().await;
    let alice = server.register("alice").await;
    let bob = server.register("bob").await;

    assert_eq!(server.upload(&alice, EARNS_500).await, StatusCode::ACCEPTED);
    assert_eq!(server.upload(&alice, EARNS_500).await, StatusCode::OK);
    assert_eq!(server.upload(&bob, EARNS_500).await, StatusCode::CONFLICT);
    assert_eq!(server.upload(&alice, "79927398714").await, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(server.upload(&alice, "").await, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn accrual_flows_into_orders_and_balance() {
    let server = TestServer::new().await;
    let alice = server.register("alice").await;

    let empty = server.get(&alice, "/api/user/orders").await;
    assert_eq!(empty.status(), StatusCode::NO_CONTENT);

    server.upload(&alice, EARNS_500).await;
    server.upload(&alice, NOT_YET_KNOWN).await;
    server.upload(&alice, THROTTLED).await;

    let balance: Value = server.get(&alice, "/api/user/balance").await.json().await.unwrap();
    assert_eq!(balance, json!({"current": 500, "withdrawn": 0}));

    let response = server.get(&alice, "/api/user/orders").await;
    assert_eq!(response.status(), StatusCode::OK);
    let orders: Vec<Value> = response.json().await.unwrap();
    assert_eq!(orders.len(), 3);
    for order in &orders {
        let number = order["number"].as_str().unwrap();
        match number {
            EARNS_500 => {
                assert_eq!(order["status"], "PROCESSED");
                assert_eq!(order["accrual"], 500);
            }
            NOT_YET_KNOWN | THROTTLED => {
                assert_eq!(order["status"], "NEW");
                assert!(order.get("accrual").is_none());
            }
            other => panic!("unexpected order {other}"),
        }
        assert!(order["uploaded_at"].is_string());
    }
}

#[tokio::test]
async fn withdrawals_respect_the_balance() {
    let server = TestServer::new().await;
    let alice = server.register("alice").await;
    server.upload(&alice, EARNS_500).await;
    server.get(&alice, "/api/user/balance").await;

    assert_eq!(
        server.get(&alice, "/api/user/withdrawals").await.status(),
        StatusCode::NO_CONTENT
    );
    assert_eq!(server.withdraw(&alice, NOT_YET_KNOWN, 100).await, StatusCode::OK);
    assert_eq!(
        server.withdraw(&alice, NOT_YET_KNOWN, 1000).await,
        StatusCode::PAYMENT_REQUIRED
    );
    assert_eq!(
        server.withdraw(&alice, "12345", 1).await,
        StatusCode::UNPROCESSABLE_ENTITY
    );

    let balance: Value = server.get(&alice, "/api/user/balance").await.json().await.unwrap();
    assert_eq!(balance, json!({"current": 400, "withdrawn": 100}));

    let withdrawals: Vec<Value> = server
        .get(&alice, "/api/user/withdrawals")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0]["order"], NOT_YET_KNOWN);
    assert_eq!(withdrawals[0]["sum"], 100);
    assert!(withdrawals[0]["processed_at"].is_string());
}

#[tokio::test]
async fn http_client_maps_accrual_responses() {
    let accrual = HttpAccrualClient::new(
        AccrualClientConfig::default().with_base_url(format!("{}/", spawn_accrual_stub().await)),
    )
    .unwrap();
    let query = |raw: &str| {
        let number = OrderNumber::parse(raw).unwrap();
        let accrual = accrual.clone();
        async move { accrual.query(&number).await }
    };

    match query(EARNS_500).await {
        AccrualResult::Report(report) => {
            assert_eq!(report.status, AccrualStatus::Processed);
            assert_eq!(report.accrual, 500);
        }
        other => panic!("expected a report, got {other:?}"),
    }
    match query(NOT_YET_KNOWN).await {
        AccrualResult::Report(report) => assert_eq!(report.status, AccrualStatus::Registered),
        other => panic!("expected a report, got {other:?}"),
    }
    assert_eq!(
        query(THROTTLED).await,
        AccrualResult::RateLimited(Some(Duration::from_secs(7)))
    );
    assert!(matches!(query(BROKEN).await, AccrualResult::TransientFailure(_)));
    assert!(STUB_CALLS.load(Ordering::SeqCst) >= 4);
}
