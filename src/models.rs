// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Data models for counters, hit records and their presentation views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::validator::ValidationError;

/// Maximum label length in characters.
pub const MAX_LABEL_CHARS: usize = 80;

/// Maximum note length in characters.
pub const MAX_NOTE_CHARS: usize = 200;

/// Deduplication policy of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountMode {
    /// One increment per visitor identity, ever.
    Unique,
    /// Every hit counts, optionally coalesced by a throttle window.
    Unlimited,
}

impl CountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unique => "unique",
            Self::Unlimited => "unlimited",
        }
    }
}

impl fmt::Display for CountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CountMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unique" => Ok(Self::Unique),
            "unlimited" => Ok(Self::Unlimited),
            _ => Err(ValidationError::InvalidMode(s.to_string())),
        }
    }
}

/// How long a visitor's repeat hits are absorbed before counting again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooldown {
    /// Every hit counts.
    None,
    /// Hits closer than this many milliseconds to the previous one coalesce.
    Window(i64),
    /// Repeat hits never count.
    Forever,
}

/// A named hit counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Opaque short identifier, never reused
    pub id: String,
    /// Display label (at most 80 characters)
    pub label: String,
    /// Current count
    pub value: u64,
    /// Deduplication policy
    pub mode: CountMode,
    /// Per-counter throttle for `unlimited` counters, overriding the
    /// service default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_ms: Option<i64>,
    /// Creation timestamp (absent only on rows imported without one)
    pub created_at: Option<DateTime<Utc>>,
    /// Free-form admin note (at most 200 characters)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Counter {
    /// Resolve the effective cooldown, given the service-wide default throttle
    /// for `unlimited` counters.
    pub fn cooldown(&self, default_throttle_ms: i64) -> Cooldown {
        match self.mode {
            CountMode::Unique => Cooldown::Forever,
            CountMode::Unlimited => match self.throttle_ms.unwrap_or(default_throttle_ms) {
                ms if ms <= 0 => Cooldown::None,
                ms => Cooldown::Window(ms),
            },
        }
    }
}

/// Input for creating a counter.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCounter {
    pub label: String,
    #[serde(default)]
    pub start_value: i64,
    pub mode: String,
    /// Throttle in seconds for `unlimited` counters
    #[serde(default)]
    pub throttle_override_secs: Option<u64>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Admin overwrite of counter metadata. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CounterPatch {
    pub label: Option<String>,
    pub value: Option<i64>,
    pub note: Option<String>,
}

/// Filters for paging through counters.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

fn default_page_limit() -> u32 {
    20
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: default_page_limit(),
            offset: 0,
            search: None,
            mode: None,
        }
    }
}

/// One page of counters plus totals for pagination.
#[derive(Debug, Clone, Serialize)]
pub struct CounterPage {
    pub counters: Vec<Counter>,
    pub total: u64,
    /// 1-based page number of this slice
    pub page: u64,
    pub pages: u64,
}

/// Length of an activity series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrendWindow {
    Week,
    Month,
}

impl TrendWindow {
    pub fn days(&self) -> u32 {
        match self {
            Self::Week => 7,
            Self::Month => 30,
        }
    }
}

impl TryFrom<u32> for TrendWindow {
    type Error = ValidationError;

    fn try_from(days: u32) -> Result<Self, Self::Error> {
        match days {
            7 => Ok(Self::Week),
            30 => Ok(Self::Month),
            other => Err(ValidationError::InvalidTrendWindow(other)),
        }
    }
}

/// Whether a counter has gone quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InactiveStatus {
    pub inactive: bool,
    /// Whole days since the last hit (or creation); absent when neither is known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_days: Option<i64>,
}

/// Counter enriched with activity data for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct CounterView {
    pub id: String,
    pub label: String,
    pub value: u64,
    pub mode: CountMode,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub hits_today: u64,
    pub activity_trend: Vec<u64>,
    pub inactive_status: InactiveStatus,
}
