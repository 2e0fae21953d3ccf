// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Error types for the counter ledger.
//!
//! Missing counters are not errors: lookups return `Option` and hit
//! recording returns [`crate::ledger::HitOutcome::CounterNotFound`].
//! Rate-limit and lockout rejections are typed decisions from
//! [`crate::limiter`]. What remains here is invalid input and storage
//! failure.

use crate::validator::ValidationError;
use thiserror::Error;

/// Errors raised by the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Identifier already taken by a live or deleted counter.
    #[error("Counter id already in use: {0}")]
    DuplicateId(String),

    #[error("Store lock poisoned by a panicked writer")]
    Poisoned,

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Storage failures are fatal and never retried.
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("Could not allocate a free counter id after {0} attempts")]
    IdSpaceExhausted(usize),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, LedgerError>;
