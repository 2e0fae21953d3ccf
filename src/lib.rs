// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Counter Ledger
//!
//! A self-hosted hit counter service:
//!
//! - Counters in `unique` mode count each client identity once
//! - Counters in `unlimited` mode count every hit, with an optional throttle
//! - SQLite persistence with atomic read-decide-write for hits
//! - Sliding-window throttling of counter creation
//! - Lockout of repeated failed admin logins
//! - Activity trends and inactivity detection for the admin dashboard

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod limiter;
pub mod metrics;
pub mod models;
pub mod store;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{LedgerError, StoreError};
pub use handlers::{router, AppState};
pub use ledger::{HitOutcome, Ledger};
pub use limiter::{LockState, LockoutLimiter, WindowDecision, WindowLimiter};
pub use models::{CountMode, Counter, CounterView, NewCounter};
pub use store::Store;
pub use validator::ValidationError;
