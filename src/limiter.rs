// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Per-identity time-window limiters.
//!
//! Two limiters share one in-memory identity table:
//! 1. [`WindowLimiter`]: at most N actions per identity per sliding window
//!    (counter creation throttling)
//! 2. [`LockoutLimiter`]: N failures inside a window lock the identity out
//!    for a fixed time (admin login protection)
//!
//! Entries are pruned lazily on access. Identities that stop sending
//! requests are only evicted by [`WindowLimiter::sweep`] /
//! [`LockoutLimiter::sweep`], which the service runs periodically.
//! Nothing here is persisted; a restart clears all state.

use crate::clock::Clock;
use crate::config::{LockoutConfig, WindowConfig};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of a sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// Action is allowed
    Allowed {
        /// Actions left in the current window after this one
        remaining: u32,
    },
    /// Action is rejected until the oldest action leaves the window
    Limited { retry_after_secs: u64 },
}

impl WindowDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::Allowed { .. } => 0,
            Self::Limited { retry_after_secs } => *retry_after_secs,
        }
    }
}

/// Lockout state of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub blocked: bool,
    /// Seconds until the lock lifts, 0 when not blocked
    pub retry_after_secs: u64,
    /// Failures currently counted toward the next lock
    pub failures: u32,
}

impl LockState {
    fn open(failures: u32) -> Self {
        Self {
            blocked: false,
            retry_after_secs: 0,
            failures,
        }
    }
}

/// Whole seconds until `until_ms`, rounded up, at least 1.
fn secs_until(until_ms: i64, now_ms: i64) -> u64 {
    let ms = (until_ms - now_ms).max(1) as u64;
    ms.div_ceil(1000)
}

fn duration_ms(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Drop instants at or before `cutoff` from the front of an ordered log.
fn prune_before(log: &mut VecDeque<i64>, cutoff: i64) {
    while log.front().is_some_and(|&t| t <= cutoff) {
        log.pop_front();
    }
}

/// Per-identity state that can become empty and be evicted.
trait WindowEntry: Default {
    fn is_empty(&self) -> bool;
}

/// Identity-keyed state under one lock.
///
/// Contention is low, so the whole map is locked for each update; this
/// keeps every read-modify-write on an identity free of lost updates.
struct IdentityTable<E> {
    entries: RwLock<HashMap<String, E>>,
}

impl<E: WindowEntry> IdentityTable<E> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Run `f` on the identity's entry, creating it if absent. Entries left
    /// empty are removed.
    async fn update<R>(&self, identity: &str, f: impl FnOnce(&mut E) -> R) -> R {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(identity.to_string()).or_default();
        let result = f(entry);
        if entry.is_empty() {
            entries.remove(identity);
        }
        result
    }

    /// Like [`IdentityTable::update`] but never creates an entry.
    async fn update_existing<R>(
        &self,
        identity: &str,
        f: impl FnOnce(&mut E) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(identity)?;
        let result = f(entry);
        if entry.is_empty() {
            entries.remove(identity);
        }
        Some(result)
    }

    async fn remove(&self, identity: &str) -> bool {
        self.entries.write().await.remove(identity).is_some()
    }

    /// Prune every entry with `prune` and evict the ones left empty.
    async fn sweep(&self, mut prune: impl FnMut(&mut E)) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            prune(entry);
            !entry.is_empty()
        });
        before - entries.len()
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Recent action instants of one identity, oldest first.
#[derive(Debug, Default)]
struct ActionLog {
    timestamps: VecDeque<i64>,
}

impl WindowEntry for ActionLog {
    fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Sliding-window action limiter.
pub struct WindowLimiter {
    config: WindowConfig,
    clock: Arc<dyn Clock>,
    actions: IdentityTable<ActionLog>,
}

impl WindowLimiter {
    /// Create a limiter. `max_actions = 0` disables it.
    pub fn new(config: WindowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            actions: IdentityTable::new(),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    fn window_ms(&self) -> i64 {
        duration_ms(self.config.window_duration())
    }

    fn decide(&self, log: &mut ActionLog, now_ms: i64) -> WindowDecision {
        let window_ms = self.window_ms();
        prune_before(&mut log.timestamps, now_ms - window_ms);

        let used = log.timestamps.len();
        let max = self.config.max_actions as usize;
        if used >= max {
            let oldest = log.timestamps.front().copied().unwrap_or(now_ms);
            WindowDecision::Limited {
                retry_after_secs: secs_until(oldest + window_ms, now_ms),
            }
        } else {
            WindowDecision::Allowed {
                remaining: (max - used - 1) as u32,
            }
        }
    }

    /// Check whether `identity` may act now, without recording anything.
    pub async fn check(&self, identity: &str) -> WindowDecision {
        if self.config.max_actions == 0 {
            return WindowDecision::Allowed { remaining: u32::MAX };
        }

        let now_ms = self.clock.now_ms();
        self.actions
            .update_existing(identity, |log| self.decide(log, now_ms))
            .await
            .unwrap_or(WindowDecision::Allowed {
                remaining: self.config.max_actions - 1,
            })
    }

    /// Record an attempt by `identity` at the current instant.
    pub async fn record(&self, identity: &str) {
        let now_ms = self.clock.now_ms();
        self.actions
            .update(identity, |log| log.timestamps.push_back(now_ms))
            .await;
    }

    /// Check and, if allowed, record in one step.
    pub async fn check_and_record(&self, identity: &str) -> WindowDecision {
        if self.config.max_actions == 0 {
            return WindowDecision::Allowed { remaining: u32::MAX };
        }

        let now_ms = self.clock.now_ms();
        let decision = self
            .actions
            .update(identity, |log| {
                let decision = self.decide(log, now_ms);
                if decision.is_allowed() {
                    log.timestamps.push_back(now_ms);
                }
                decision
            })
            .await;

        if let WindowDecision::Limited { retry_after_secs } = decision {
            info!(
                identity,
                retry_after_secs,
                max_actions = self.config.max_actions,
                "Action rate limited"
            );
        }
        decision
    }

    /// Forget an identity.
    pub async fn clear(&self, identity: &str) -> bool {
        self.actions.remove(identity).await
    }

    /// Evict identities with no actions left in the window.
    pub async fn sweep(&self) -> usize {
        let cutoff = self.clock.now_ms() - self.window_ms();
        let evicted = self
            .actions
            .sweep(|log| prune_before(&mut log.timestamps, cutoff))
            .await;
        debug!(evicted, "Window limiter swept");
        evicted
    }

    /// Number of identities currently tracked.
    pub async fn tracked(&self) -> usize {
        self.actions.len().await
    }
}

/// Failure history of one identity.
#[derive(Debug, Default)]
struct FailureLog {
    failures: VecDeque<i64>,
    block_until: Option<i64>,
}

impl FailureLog {
    fn prune(&mut self, now_ms: i64, failure_window_ms: i64) {
        prune_before(&mut self.failures, now_ms - failure_window_ms);
        if self.block_until.is_some_and(|until| until <= now_ms) {
            self.block_until = None;
        }
    }

    fn state(&self, now_ms: i64) -> LockState {
        match self.block_until {
            Some(until) if until > now_ms => LockState {
                blocked: true,
                retry_after_secs: secs_until(until, now_ms),
                failures: self.failures.len() as u32,
            },
            _ => LockState::open(self.failures.len() as u32),
        }
    }
}

impl WindowEntry for FailureLog {
    fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.block_until.is_none()
    }
}

/// Failure-count lockout limiter.
///
/// Per identity: `Open` while failures accumulate, `Locked` once
/// `max_failures` land inside the failure window, back to `Open` when the
/// lock expires. A lock consumes the failures that caused it.
pub struct LockoutLimiter {
    config: LockoutConfig,
    clock: Arc<dyn Clock>,
    failures: IdentityTable<FailureLog>,
}

impl LockoutLimiter {
    /// Create a limiter. `max_failures = 0` disables lockout.
    pub fn new(config: LockoutConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            failures: IdentityTable::new(),
        }
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    fn failure_window_ms(&self) -> i64 {
        duration_ms(self.config.failure_window())
    }

    /// Whether `identity` is locked out right now. Expired locks are cleared.
    pub async fn check_blocked(&self, identity: &str) -> LockState {
        let now_ms = self.clock.now_ms();
        let window_ms = self.failure_window_ms();
        self.failures
            .update_existing(identity, |log| {
                log.prune(now_ms, window_ms);
                log.state(now_ms)
            })
            .await
            .unwrap_or(LockState::open(0))
    }

    /// Count a failed attempt, locking the identity once the threshold is hit.
    pub async fn record_failure(&self, identity: &str) -> LockState {
        if self.config.max_failures == 0 {
            return LockState::open(0);
        }

        let now_ms = self.clock.now_ms();
        let window_ms = self.failure_window_ms();
        let lockout_ms = duration_ms(self.config.lockout_duration());
        let max_failures = self.config.max_failures as usize;

        let (state, locked_now) = self
            .failures
            .update(identity, |log| {
                log.prune(now_ms, window_ms);
                log.failures.push_back(now_ms);

                let locked_now = log.failures.len() >= max_failures;
                if locked_now {
                    log.block_until = Some(now_ms + lockout_ms);
                    log.failures.clear();
                }
                (log.state(now_ms), locked_now)
            })
            .await;

        if locked_now {
            warn!(
                identity,
                retry_after_secs = state.retry_after_secs,
                "Too many failures, identity locked out"
            );
        } else {
            debug!(identity, failures = state.failures, "Failure recorded");
        }
        state
    }

    /// Clear all history for `identity` after a successful attempt.
    pub async fn record_success(&self, identity: &str) {
        self.clear(identity).await;
    }

    pub async fn clear(&self, identity: &str) -> bool {
        self.failures.remove(identity).await
    }

    /// Evict identities with no recent failures and no active lock.
    pub async fn sweep(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let window_ms = self.failure_window_ms();
        let evicted = self.failures.sweep(|log| log.prune(now_ms, window_ms)).await;
        debug!(evicted, "Lockout limiter swept");
        evicted
    }

    /// Number of identities currently tracked.
    pub async fn tracked(&self) -> usize {
        self.failures.len().await
    }
}
