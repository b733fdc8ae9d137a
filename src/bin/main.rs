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

use clap::Parser;
use loyalty_ledger_rs::{
    BalanceLedger, Config, HttpAccrualClient, LoyaltyService, MemoryRepository, Reconciler,
    Repository, router,
};
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::parse();
    init_tracing(&config);

    let repository = open_repository(&config).await?;
    let accrual = HttpAccrualClient::new(config.accrual_client_config())?;
    let ledger = BalanceLedger::new(Arc::clone(&repository));
    let reconciler = Reconciler::new(Arc::clone(&repository), ledger, Arc::new(accrual))
        .with_policy(config.retry_policy())
        .with_concurrency(config.reconcile_concurrency());
    let service = LoyaltyService::new(repository, reconciler).with_session_ttl(config.session_ttl());

    let listener = TcpListener::bind(config.run_address).await?;
    info!(
        address = %config.run_address,
        accrual = %config.accrual_system_address,
        "loyalty ledger listening"
    );

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining background reconciliations");
    service.shutdown().await;
    Ok(())
}

fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    if config.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[cfg(feature = "postgres")]
async fn open_repository(config: &Config) -> Result<Arc<dyn Repository>, BoxError> {
    match &config.database_uri {
        Some(uri) => {
            let repository = loyalty_ledger_rs::PgRepository::connect(uri).await?;
            repository.migrate().await?;
            info!("using PostgreSQL storage");
            Ok(Arc::new(repository))
        }
        None => {
            info!("no database configured, using in-memory storage");
            Ok(Arc::new(MemoryRepository::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_repository(config: &Config) -> Result<Arc<dyn Repository>, BoxError> {
    if config.database_uri.is_some() {
        warn!("built without the postgres feature, DATABASE_URI ignored");
    }
    info!("using in-memory storage");
    Ok(Arc::new(MemoryRepository::new()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
