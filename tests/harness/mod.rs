// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Test harness for abuse simulation against the counter ledger.
//!
//! Simulated traffic runs on a manual clock, so request rates are exact
//! and no test sleeps.

pub mod attacks;
pub mod generators;
pub mod metrics;
