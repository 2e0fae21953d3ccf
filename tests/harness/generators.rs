// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Test data generators for attack simulation.

use std::net::{IpAddr, Ipv4Addr};

/// Generate a pool of IP addresses for testing.
pub fn generate_ips(count: usize) -> Vec<IpAddr> {
    (0..count)
        .map(|i| {
            // Use 10.x.x.x private range
            let a = ((i >> 16) & 0xFF) as u8;
            let b = ((i >> 8) & 0xFF) as u8;
            let c = (i & 0xFF) as u8;
            IpAddr::V4(Ipv4Addr::new(10, a, b, c))
        })
        .collect()
}

/// Generate counter labels for creation floods.
pub fn generate_labels(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("Spam page {i}")).collect()
}

/// Generate wrong password guesses.
pub fn generate_guesses(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("hunter{i}")).collect()
}

/// Labels that must never produce a counter.
pub fn generate_invalid_labels() -> Vec<String> {
    vec![
        String::new(),
        "   ".to_string(),
        "\t\n".to_string(),
        "x".repeat(81),
        "é".repeat(81),
    ]
}

/// Mode strings, each paired with whether it should be accepted.
pub fn generate_modes() -> Vec<(&'static str, bool)> {
    vec![
        ("unique", true),
        ("unlimited", true),
        ("UNIQUE", true),
        (" Unlimited ", true),
        ("", false),
        ("uniq", false),
        ("unlimited; DROP TABLE counters", false),
        ("both", false),
        ("0", false),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ips() {
        let ips = generate_ips(256);
        assert_eq!(ips.len(), 256);
        // All should be unique
        let unique: std::collections::HashSet<_> = ips.iter().collect();
        assert_eq!(unique.len(), 256);
    }

    #[test]
    fn test_invalid_labels_exceed_or_blank() {
        for label in generate_invalid_labels() {
            assert!(label.trim().is_empty() || label.chars().count() > 80);
        }
    }
}
