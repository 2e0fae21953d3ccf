// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Counter Ledger Service
//!
//! Serves hit counters for embedding in web pages, plus an admin API for
//! managing them.
//!
//! ## Configuration
//!
//! A `.env` file is read first if present. Settings come from an optional
//! file named by `COUNTER_LEDGER_CONFIG`, overridden by environment
//! variables:
//!
//! - `COUNTER_LEDGER__BIND_ADDR`: Server bind address (default: 0.0.0.0:8080)
//! - `COUNTER_LEDGER__DATABASE_PATH`: SQLite file, or `memory` (default: counters.db)
//! - `COUNTER_LEDGER__TRUST_FORWARDED_FOR`: Use X-Forwarded-For (default: false)
//! - `COUNTER_LEDGER__CREATION_LIMIT__MAX_ACTIONS`: Creations per window (default: 5)
//! - `COUNTER_LEDGER__LOGIN_LIMIT__MAX_FAILURES`: Failures before lockout (default: 5)
//! - `COUNTER_LEDGER__ADMIN__PASSWORD_HASH`: Argon2 PHC string enabling admin login

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use counter_ledger::{
    clock::SystemClock,
    config::Config,
    handlers::{router, AppState},
    store::Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::load()?;
    info!(
        bind_addr = %config.bind_addr,
        database_path = %config.database_path,
        creation_max_actions = config.creation_limit.max_actions,
        login_max_failures = config.login_limit.max_failures,
        "Starting counter ledger"
    );
    if config.admin.password_hash.is_none() {
        warn!("No admin password hash configured, admin login is disabled");
    }

    let store = Store::connect(&config.database_path)?;
    let state = Arc::new(AppState::new(config.clone(), store, Arc::new(SystemClock))?);

    // Spawn sweep task
    let sweep_state = state.clone();
    let sweep_interval = config.sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            sweep_state.sweep().await;
        }
    });

    let app = router(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
