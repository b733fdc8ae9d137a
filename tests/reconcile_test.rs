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

//! Integration tests for order reconciliation: exactly-once credit under
//! concurrency, rate-limit waits and retry budgets.
//!
//! Timing tests run on a paused tokio clock, so waits of a minute take no
//! real time.

use async_trait::async_trait;
use loyalty_ledger_rs::{
    AccrualReport, AccrualResult, AccrualSource, AccrualStatus, BalanceLedger, LedgerError,
    MemoryRepository, OrderNumber, OrderStatus, Reconciler, Repository, RetryPolicy, UserLogin,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const ORDER: &str = "79927398713";

/// Replays scripted answers, then repeats the last one. Records when each
/// query arrived.
struct Script {
    replies: Mutex<VecDeque<AccrualResult>>,
    last: Mutex<Option<AccrualResult>>,
    calls: Mutex<Vec<Instant>>,
    delay: Duration,
}

impl Script {
    fn new(replies: Vec<AccrualResult>) -> Arc<Self> {
        Self::with_delay(replies, Duration::ZERO)
    }

    fn with_delay(replies: Vec<AccrualResult>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AccrualSource for Script {
    async fn query(&self, _number: &OrderNumber) -> AccrualResult {
        self.calls.lock().push(Instant::now());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().pop_front();
        match next {
            Some(reply) => {
                *self.last.lock() = Some(reply.clone());
                reply
            }
            None => self
                .last
                .lock()
                .clone()
                .unwrap_or(AccrualResult::TransientFailure("no script".into())),
        }
    }
}

fn report(status: AccrualStatus, accrual: u64) -> AccrualResult {
    AccrualResult::Report(AccrualReport {
        order: ORDER.to_string(),
        status,
        accrual,
    })
}

async fn setup(source: Arc<Script>) -> (Arc<MemoryRepository>, Reconciler, UserLogin) {
    let repo = Arc::new(MemoryRepository::new());
    let user = UserLogin::from("alice");
    repo.create_user(&user, "hash").await.unwrap();
    repo.add_order(&user, &OrderNumber::parse(ORDER).unwrap())
        .await
        .unwrap();
    let reconciler = Reconciler::new(repo.clone(), BalanceLedger::new(repo.clone()), source);
    (repo, reconciler, user)
}

async fn status_of(repo: &MemoryRepository, user: &UserLogin) -> OrderStatus {
    repo.get_user_orders(user).await.unwrap()[0].status
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reconciliations_credit_once() {
    let source = Script::with_delay(
        vec![report(AccrualStatus::Processed, 500)],
        Duration::from_millis(20),
    );
    let (repo, reconciler, user) = setup(source).await;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let reconciler = reconciler.clone();
            let user = user.clone();
            tokio::spawn(async move {
                reconciler
                    .reconcile(&user, &CancellationToken::new())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut changed = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        assert!(report.is_clean());
        changed += report.changed;
    }

    assert_eq!(changed, 1);
    let balance = repo.get_balance(&user).await.unwrap();
    assert_eq!(balance.current, 500);
    assert_eq!(status_of(&repo, &user).await, OrderStatus::Processed);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_without_retry_after_waits_a_minute() {
    let source = Script::new(vec![
        AccrualResult::RateLimited(None),
        report(AccrualStatus::Processed, 500),
    ]);
    let (repo, reconciler, user) = setup(source.clone()).await;

    let task = {
        let reconciler = reconciler.clone();
        let user = user.clone();
        tokio::spawn(async move { reconciler.reconcile(&user, &CancellationToken::new()).await })
    };

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(source.calls().len(), 1, "re-queried before the wait elapsed");
    assert_eq!(status_of(&repo, &user).await, OrderStatus::New);

    let report = task.await.unwrap().unwrap();
    assert_eq!(report.changed, 1);

    let calls = source.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1] - calls[0] >= Duration::from_secs(60));
    assert_eq!(repo.get_balance(&user).await.unwrap().current, 500);
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_value_is_honoured() {
    let source = Script::new(vec![
        AccrualResult::RateLimited(Some(Duration::from_secs(7))),
        report(AccrualStatus::Invalid, 0),
    ]);
    let (repo, reconciler, user) = setup(source.clone()).await;

    reconciler
        .reconcile(&user, &CancellationToken::new())
        .await
        .unwrap();

    let calls = source.calls();
    let gap = calls[1] - calls[0];
    assert!(gap >= Duration::from_secs(7) && gap < Duration::from_secs(8));
    assert_eq!(status_of(&repo, &user).await, OrderStatus::Invalid);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_order_for_the_next_read() {
    let source = Script::new(vec![AccrualResult::TransientFailure("HTTP 500".into())]);
    let (repo, reconciler, user) = setup(source.clone()).await;
    let reconciler = reconciler.with_policy(RetryPolicy::default().with_max_attempts(3));

    let report = reconciler
        .reconcile(&user, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(source.calls().len(), 3);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].1.is_transient());
    assert_eq!(status_of(&repo, &user).await, OrderStatus::New);

    let again = reconciler
        .reconcile(&user, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.checked, 1, "order is still pending");
}

#[tokio::test(start_paused = true)]
async fn processing_then_processed_credits_on_the_later_read() {
    let source = Script::new(vec![
        report(AccrualStatus::Registered, 0),
        report(AccrualStatus::Processing, 0),
        report(AccrualStatus::Processed, 250),
    ]);
    let (repo, reconciler, user) = setup(source).await;
    let cancel = CancellationToken::new();

    reconciler.reconcile(&user, &cancel).await.unwrap();
    assert_eq!(status_of(&repo, &user).await, OrderStatus::New);

    reconciler.reconcile(&user, &cancel).await.unwrap();
    assert_eq!(status_of(&repo, &user).await, OrderStatus::Processing);
    assert_eq!(repo.get_balance(&user).await.unwrap().current, 0);

    reconciler.reconcile(&user, &cancel).await.unwrap();
    let order = &repo.get_user_orders(&user).await.unwrap()[0];
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, 250);
    assert_eq!(repo.get_balance(&user).await.unwrap().current, 250);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_rate_limit_wait() {
    let source = Script::new(vec![AccrualResult::RateLimited(None)]);
    let (repo, reconciler, user) = setup(source.clone()).await;
    let cancel = CancellationToken::new();

    let task = {
        let cancel = cancel.clone();
        let user = user.clone();
        tokio::spawn(async move { reconciler.reconcile(&user, &cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();

    let report = task.await.unwrap().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].1, LedgerError::Cancelled);
    assert_eq!(source.calls().len(), 1);
    assert_eq!(status_of(&repo, &user).await, OrderStatus::New);
}
