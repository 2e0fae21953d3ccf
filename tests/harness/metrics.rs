// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Metrics collection for attack simulation results.

use std::collections::HashMap;
use std::time::Duration;

/// Collects metrics during attack simulation.
#[derive(Debug, Default)]
pub struct AttackMetrics {
    /// Simulated time covered by the attack
    simulated: Duration,
    /// Count of requests by outcome
    outcomes: HashMap<Outcome, usize>,
    /// Count of requests by IP
    requests_per_ip: HashMap<String, usize>,
    /// Latency samples (microseconds)
    latencies: Vec<u64>,
}

/// Possible outcomes for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Action performed (counter created, login accepted, hit counted)
    Allowed,
    /// Hit recorded without incrementing
    Deduplicated,
    /// Rejected by the creation window
    RateLimited,
    /// Rejected by the login lockout
    Locked,
    /// Evaluated and refused (bad input or wrong password)
    Rejected,
}

impl AttackMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request outcome.
    pub fn record(&mut self, outcome: Outcome, ip: &str, latency: Duration) {
        *self.outcomes.entry(outcome).or_insert(0) += 1;
        *self.requests_per_ip.entry(ip.to_string()).or_insert(0) += 1;
        self.latencies.push(latency.as_micros() as u64);
    }

    /// Set the simulated duration once the attack completes.
    pub fn finish(&mut self, simulated: Duration) {
        self.simulated = simulated;
    }

    pub fn total_requests(&self) -> usize {
        self.outcomes.values().sum()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Ratio of requests stopped by a limiter.
    pub fn block_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        let blocked = self.count(Outcome::RateLimited) + self.count(Outcome::Locked);
        blocked as f64 / total as f64
    }

    pub fn median_latency_us(&self) -> u64 {
        if self.latencies.is_empty() {
            return 0;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    pub fn unique_ips(&self) -> usize {
        self.requests_per_ip.len()
    }

    /// Generate a summary report.
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            total_requests: self.total_requests(),
            allowed: self.count(Outcome::Allowed),
            deduplicated: self.count(Outcome::Deduplicated),
            rate_limited: self.count(Outcome::RateLimited),
            locked: self.count(Outcome::Locked),
            rejected: self.count(Outcome::Rejected),
            simulated_secs: self.simulated.as_secs(),
            block_rate: self.block_rate(),
            median_latency_us: self.median_latency_us(),
            unique_ips: self.unique_ips(),
        }
    }
}

/// Summary report of attack metrics.
#[derive(Debug, Clone)]
pub struct MetricsReport {
    pub total_requests: usize,
    pub allowed: usize,
    pub deduplicated: usize,
    pub rate_limited: usize,
    pub locked: usize,
    pub rejected: usize,
    pub simulated_secs: u64,
    pub block_rate: f64,
    pub median_latency_us: u64,
    pub unique_ips: usize,
}

impl std::fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Attack Metrics Report ===")?;
        writeln!(f, "Simulated:         {} s", self.simulated_secs)?;
        writeln!(f, "Total Requests:    {}", self.total_requests)?;
        writeln!(f)?;
        writeln!(f, "--- Outcomes ---")?;
        writeln!(f, "Allowed:           {}", self.allowed)?;
        writeln!(f, "Deduplicated:      {}", self.deduplicated)?;
        writeln!(f, "Rate Limited:      {}", self.rate_limited)?;
        writeln!(f, "Locked:            {}", self.locked)?;
        writeln!(f, "Rejected:          {}", self.rejected)?;
        writeln!(f, "Block Rate:        {:.1}%", self.block_rate * 100.0)?;
        writeln!(f)?;
        writeln!(f, "Median Latency:    {} us", self.median_latency_us)?;
        writeln!(f, "Unique IPs:        {}", self.unique_ips)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_rate() {
        let mut metrics = AttackMetrics::new();
        for _ in 0..3 {
            metrics.record(Outcome::Allowed, "10.0.0.1", Duration::ZERO);
        }
        for _ in 0..5 {
            metrics.record(Outcome::RateLimited, "10.0.0.1", Duration::ZERO);
        }
        for _ in 0..2 {
            metrics.record(Outcome::Locked, "10.0.0.2", Duration::ZERO);
        }

        assert_eq!(metrics.total_requests(), 10);
        assert_eq!(metrics.unique_ips(), 2);
        assert!((metrics.block_rate() - 0.7).abs() < 0.01);
    }
}
