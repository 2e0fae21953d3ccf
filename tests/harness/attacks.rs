// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Attack simulation patterns for security testing.

use std::time::Duration;

/// Attack pattern configuration.
#[derive(Debug, Clone)]
pub struct AttackConfig {
    /// Total number of requests to send
    pub total_requests: usize,
    /// Requests per second rate
    pub requests_per_second: f64,
    /// Number of unique IPs to simulate
    pub unique_ips: usize,
    /// Every n-th login attempt uses the right password (0 = never)
    pub correct_password_every: usize,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            total_requests: 100,
            requests_per_second: 10.0,
            unique_ips: 1,
            correct_password_every: 0,
        }
    }
}

/// Predefined attack patterns.
impl AttackConfig {
    /// Single IP creation flood.
    pub fn creation_flood() -> Self {
        Self {
            total_requests: 200,
            requests_per_second: 10.0,
            ..Default::default()
        }
    }

    /// Distributed creation flood - many IPs, few requests each.
    pub fn distributed_creation() -> Self {
        Self {
            total_requests: 1000,
            requests_per_second: 50.0,
            unique_ips: 100,
            ..Default::default()
        }
    }

    /// Slow drip - one creation every 15 minutes, under a 5/hour limit.
    pub fn slow_drip() -> Self {
        Self {
            total_requests: 20,
            requests_per_second: 1.0 / 900.0,
            ..Default::default()
        }
    }

    /// Password brute force from one IP at 1 guess per second.
    pub fn brute_force() -> Self {
        Self {
            total_requests: 100,
            requests_per_second: 1.0,
            ..Default::default()
        }
    }

    /// Credential stuffing spread across many IPs.
    pub fn credential_stuffing() -> Self {
        Self {
            total_requests: 500,
            requests_per_second: 10.0,
            unique_ips: 50,
            ..Default::default()
        }
    }

    /// Brute force interleaved with a legitimate login.
    pub fn interleaved_success() -> Self {
        Self {
            total_requests: 40,
            requests_per_second: 1.0,
            correct_password_every: 4,
            ..Default::default()
        }
    }

    /// Hit inflation - a few IPs reloading one page rapidly.
    pub fn hit_inflation() -> Self {
        Self {
            total_requests: 1000,
            requests_per_second: 100.0,
            unique_ips: 10,
            ..Default::default()
        }
    }

    /// Simulated gap between consecutive requests.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.requests_per_second)
    }

    /// Calculate expected duration for the attack.
    pub fn expected_duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_requests as f64 / self.requests_per_second)
    }

    /// Whether request `index` is a legitimate login.
    pub fn is_legitimate(&self, index: usize) -> bool {
        self.correct_password_every > 0 && (index + 1) % self.correct_password_every == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_duration() {
        assert_eq!(AttackConfig::creation_flood().expected_duration(), Duration::from_secs(20));
        assert_eq!(AttackConfig::slow_drip().interval(), Duration::from_secs(900));
    }

    #[test]
    fn test_legitimate_schedule() {
        let config = AttackConfig::interleaved_success();
        assert!(!config.is_legitimate(0));
        assert!(config.is_legitimate(3));
        assert!(!AttackConfig::brute_force().is_legitimate(3));
    }
}
