// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Admin authentication: Argon2id password verification and session tokens.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;

/// Check `candidate` against an Argon2 PHC hash string.
///
/// A malformed hash is a configuration problem; it is logged and treated as
/// a failed verification.
pub fn verify_password(phc_hash: &str, candidate: &str) -> bool {
    let parsed = match PasswordHash::new(phc_hash) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "Configured admin password hash is malformed");
            return false;
        }
    };

    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

/// In-memory admin sessions keyed by bearer token.
pub struct SessionStore {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl SessionStore {
    pub fn new(ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(36_500)),
            clock,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Start a session and return its token.
    pub async fn issue(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let expires_at = self.clock.now() + self.ttl;
        self.sessions.write().await.insert(token.clone(), expires_at);
        debug!(%expires_at, "Admin session issued");
        token
    }

    /// Whether `token` names a live session.
    pub async fn validate(&self, token: &str) -> bool {
        let now = self.clock.now();
        self.sessions
            .read()
            .await
            .get(token)
            .is_some_and(|expires_at| *expires_at > now)
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    /// Drop expired sessions.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, expires_at| *expires_at > now);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use argon2::password_hash::{PasswordHasher, SaltString};

    fn hash(password: &str) -> String {
        let salt = SaltString::from_b64("c29tZXNhbHRzb21lc2FsdA").unwrap();
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_verify_password() {
        let phc = hash("hunter2");
        assert!(verify_password(&phc, "hunter2"));
        assert!(!verify_password(&phc, "hunter3"));
        assert!(!verify_password("not-a-phc-string", "hunter2"));
    }

    #[tokio::test]
    async fn test_sessions_expire() {
        let clock = Arc::new(ManualClock::at_epoch_monday());
        let sessions = SessionStore::new(std::time::Duration::from_secs(60), clock.clone());

        let token = sessions.issue().await;
        assert!(sessions.validate(&token).await);
        assert!(!sessions.validate("forged").await);

        clock.advance_ms(60_000);
        assert!(!sessions.validate(&token).await);
        assert_eq!(sessions.sweep().await, 1);
    }

    #[tokio::test]
    async fn test_revoke() {
        let clock = Arc::new(ManualClock::at_epoch_monday());
        let sessions = SessionStore::new(std::time::Duration::from_secs(60), clock);
        let token = sessions.issue().await;
        assert!(sessions.revoke(&token).await);
        assert!(!sessions.validate(&token).await);
    }
}
