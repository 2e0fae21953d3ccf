// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Prometheus metrics for hits, creations and rate-limit events.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Hit outcome label values.
pub const HIT_INCREMENTED: &str = "incremented";
pub const HIT_DEDUPLICATED: &str = "deduplicated";
pub const HIT_NOT_FOUND: &str = "not_found";

/// Limiter label values.
pub const LIMITER_CREATION: &str = "creation";
pub const LIMITER_LOGIN: &str = "login";

/// Service metrics in a private registry.
pub struct Metrics {
    registry: Registry,
    hits: IntCounterVec,
    rate_limited: IntCounterVec,
    counters_created: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let hits = IntCounterVec::new(
            Opts::new("counter_ledger_hits_total", "Hits received, by outcome"),
            &["outcome"],
        )?;
        let rate_limited = IntCounterVec::new(
            Opts::new(
                "counter_ledger_rate_limited_total",
                "Requests rejected by a window limiter",
            ),
            &["limiter"],
        )?;
        let counters_created = IntCounter::new(
            "counter_ledger_counters_created_total",
            "Counters created",
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;
        registry.register(Box::new(counters_created.clone()))?;

        Ok(Self {
            registry,
            hits,
            rate_limited,
            counters_created,
        })
    }

    pub fn record_hit(&self, outcome: &str) {
        self.hits.with_label_values(&[outcome]).inc();
    }

    pub fn record_rate_limited(&self, limiter: &str) {
        self.rate_limited.with_label_values(&[limiter]).inc();
    }

    pub fn record_counter_created(&self) {
        self.counters_created.inc();
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
