// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Counter ledger: creation, deduplicated hit recording and activity views.
//!
//! Each hit is judged by the counter's [`Cooldown`]:
//! - `unique` counters increment once per visitor identity, ever
//! - `unlimited` counters increment on every hit, unless a throttle is set,
//!   in which case a visitor's hits closer together than the throttle
//!   coalesce into one increment
//!
//! The visitor's hit record is refreshed on every hit, counted or not.
//! Hits without an identity always increment and leave no record.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result, StoreError};
use crate::models::{
    CountMode, Cooldown, Counter, CounterPage, CounterPatch, CounterView, InactiveStatus,
    ListQuery, NewCounter, TrendWindow,
};
use crate::store::Store;
use crate::validator::{validate_new_counter, validate_patch, validate_value};

/// Attempts at finding an unused id before giving up.
pub const MAX_ID_ATTEMPTS: usize = 8;

/// Largest page a listing may request.
pub const MAX_PAGE_LIMIT: u32 = 100;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Result of recording a hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitOutcome {
    Recorded { counter: Counter, incremented: bool },
    /// No counter with that id; nothing was written.
    CounterNotFound,
}

/// Decide whether a hit increments, given the visitor's previous hit.
pub fn should_increment(
    cooldown: Cooldown,
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    match cooldown {
        Cooldown::Forever => false,
        Cooldown::None => true,
        Cooldown::Window(ms) => (now - previous).num_milliseconds() >= ms,
    }
}

/// Bucket hit times into a fixed-length daily series ending today (UTC).
///
/// A week is laid out Monday-first by weekday. A month is laid out one
/// point per day, oldest first. Days without hits are zero.
pub fn compute_activity_trend(
    hits: &[DateTime<Utc>],
    window: TrendWindow,
    now: DateTime<Utc>,
) -> Vec<u64> {
    let days = window.days() as usize;
    let today = now.date_naive();
    let first_day = trend_start(today, window);
    let mut series = vec![0u64; days];

    for hit in hits {
        let day = hit.date_naive();
        if day < first_day || day > today {
            continue;
        }

        let idx = match window {
            TrendWindow::Week => day.weekday().num_days_from_monday() as usize,
            TrendWindow::Month => (day - first_day).num_days() as usize,
        };
        if let Some(slot) = series.get_mut(idx) {
            *slot += 1;
        }
    }

    series
}

fn trend_start(today: NaiveDate, window: TrendWindow) -> NaiveDate {
    today - Duration::days(i64::from(window.days()) - 1)
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

/// Judge whether a counter has gone quiet.
///
/// Idle time runs from the later of the last hit and the creation time.
/// With neither known the counter is reported inactive.
pub fn compute_inactive_status(
    last_hit: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    threshold_days: u32,
    now: DateTime<Utc>,
) -> InactiveStatus {
    let Some(reference) = last_hit.max(created_at) else {
        return InactiveStatus {
            inactive: true,
            idle_days: None,
        };
    };

    let idle = now - reference;
    InactiveStatus {
        inactive: idle >= Duration::days(i64::from(threshold_days)),
        idle_days: Some(idle.num_days().max(0)),
    }
}

/// Trim an identity; blank identities count as absent.
fn normalize_identity(identity: Option<&str>) -> Option<&str> {
    identity.map(str::trim).filter(|s| !s.is_empty())
}

/// Business logic over the counter store.
///
/// Every method does synchronous SQLite I/O. Clones share one store, so an
/// async caller can move a clone into `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(store: Store, clock: Arc<dyn Clock>, config: LedgerConfig) -> Self {
        Self {
            store: Arc::new(store),
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Validate and create a counter under a freshly generated id.
    pub fn create_counter(&self, input: &NewCounter) -> Result<Counter> {
        let length = self.config.id_length.max(1);
        self.create_with_ids(input, || generate_id(length))
    }

    fn create_with_ids<F>(&self, input: &NewCounter, mut next_id: F) -> Result<Counter>
    where
        F: FnMut() -> String,
    {
        let valid = validate_new_counter(input)?;
        let created_at = self.clock.now();

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = next_id();
            if self.store.id_taken(&id)? {
                debug!(attempt, "Generated counter id already taken");
                continue;
            }

            let counter = Counter {
                id,
                label: valid.label.clone(),
                value: valid.start_value,
                mode: valid.mode,
                throttle_ms: valid.throttle_ms,
                created_at: Some(created_at),
                note: valid.note.clone(),
            };

            match self.store.create_counter(&counter) {
                Ok(counter) => {
                    info!(counter_id = %counter.id, mode = %counter.mode, "Counter created");
                    return Ok(counter);
                }
                Err(StoreError::DuplicateId(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(LedgerError::IdSpaceExhausted(MAX_ID_ATTEMPTS))
    }

    pub fn get_counter(&self, id: &str) -> Result<Option<Counter>> {
        Ok(self.store.get_counter(id)?)
    }

    /// Record a page view from `identity` (usually the client IP).
    pub fn record_hit(&self, counter_id: &str, identity: Option<&str>) -> Result<HitOutcome> {
        let identity = normalize_identity(identity);
        let now = self.clock.now();
        let default_throttle_ms = self.config.unlimited_throttle_ms();

        let recorded = self.store.record_hit_transaction(
            counter_id,
            identity,
            now,
            |counter, previous| {
                identity.is_none()
                    || should_increment(counter.cooldown(default_throttle_ms), previous, now)
            },
        )?;

        match recorded {
            Some(hit) => {
                debug!(
                    counter_id,
                    anonymous = identity.is_none(),
                    incremented = hit.incremented,
                    value = hit.counter.value,
                    "Hit recorded"
                );
                Ok(HitOutcome::Recorded {
                    counter: hit.counter,
                    incremented: hit.incremented,
                })
            }
            None => {
                debug!(counter_id, "Hit for unknown counter");
                Ok(HitOutcome::CounterNotFound)
            }
        }
    }

    /// One page of counters with pagination totals.
    pub fn list_counters(&self, query: &ListQuery) -> Result<CounterPage> {
        let mode = query
            .mode
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .map(str::parse::<CountMode>)
            .transpose()?;
        let search = query.search.as_deref();
        let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);

        let total = self.store.count_counters(search, mode)?;
        let counters = self
            .store
            .list_counters_page(limit, query.offset, search, mode)?;

        let limit = u64::from(limit);
        Ok(CounterPage {
            counters,
            total,
            page: u64::from(query.offset) / limit + 1,
            pages: total.div_ceil(limit).max(1),
        })
    }

    /// Overwrite a counter's value. Returns `false` if the counter is missing.
    pub fn set_value(&self, id: &str, value: i64) -> Result<bool> {
        let value = validate_value(value)?;
        let updated = self.store.update_counter_value(id, value)?;
        if updated {
            info!(counter_id = id, value, "Counter value overwritten");
        }
        Ok(updated)
    }

    pub fn update_metadata(&self, id: &str, patch: &CounterPatch) -> Result<Option<Counter>> {
        let patch = validate_patch(patch)?;
        if patch.is_empty() {
            return self.get_counter(id);
        }
        Ok(self.store.update_counter_metadata(id, &patch)?)
    }

    pub fn delete_counter(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete_counter(id)?;
        if deleted {
            info!(counter_id = id, "Counter deleted");
        }
        Ok(deleted)
    }

    pub fn delete_all_counters(&self) -> Result<u64> {
        let deleted = self.store.delete_all_counters()?;
        info!(deleted, "All counters deleted");
        Ok(deleted)
    }

    pub fn delete_counters_by_mode(&self, mode: &str) -> Result<u64> {
        let mode: CountMode = mode.parse()?;
        let deleted = self.store.delete_counters_by_mode(mode)?;
        info!(%mode, deleted, "Counters deleted by mode");
        Ok(deleted)
    }

    /// Bulk purge of hit records last seen before `before`.
    pub fn purge_hits_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let purged = self.store.purge_hits_before(before)?;
        info!(purged, before = %before, "Hit records purged");
        Ok(purged)
    }

    /// Purge hit records not refreshed in the last `days` days.
    pub fn purge_hits_older_than(&self, days: u32) -> Result<u64> {
        self.purge_hits_before(self.clock.now() - Duration::days(i64::from(days)))
    }

    /// Apply the configured hit retention. A zero retention keeps everything.
    pub fn purge_expired_hits(&self) -> Result<u64> {
        match self.config.hit_retention_days {
            0 => Ok(0),
            days => self.purge_hits_older_than(days),
        }
    }

    /// Daily hit series of 7 or 30 points.
    pub fn activity_trend(&self, counter_id: &str, days: u32) -> Result<Vec<u64>> {
        let window = TrendWindow::try_from(days)?;
        let now = self.clock.now();
        let since = start_of_day(trend_start(now.date_naive(), window));
        let hits = self.store.hit_timestamps_since(counter_id, since)?;
        Ok(compute_activity_trend(&hits, window, now))
    }

    /// Inactivity of a counter against the configured threshold.
    pub fn inactive_status(
        &self,
        counter: &Counter,
        last_hit: Option<DateTime<Utc>>,
    ) -> InactiveStatus {
        compute_inactive_status(
            last_hit,
            counter.created_at,
            self.config.inactive_threshold_days,
            self.clock.now(),
        )
    }

    /// Counter with last hit, today's hits, weekly trend and inactivity.
    pub fn counter_view(&self, id: &str) -> Result<Option<CounterView>> {
        let Some(counter) = self.store.get_counter(id)? else {
            return Ok(None);
        };

        let now = self.clock.now();
        let last_hit_at = self.store.get_last_hit_timestamp(id)?;
        let hits_today = self
            .store
            .count_hits_since(id, start_of_day(now.date_naive()))?;
        let activity_trend = self.activity_trend(id, TrendWindow::Week.days())?;
        let inactive_status = self.inactive_status(&counter, last_hit_at);

        Ok(Some(CounterView {
            id: counter.id,
            label: counter.label,
            value: counter.value,
            mode: counter.mode,
            last_hit_at,
            hits_today,
            activity_trend,
            inactive_status,
        }))
    }
}

fn generate_id(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn at(day: i64, hour: u32) -> DateTime<Utc> {
        // 2024-01-01 is a Monday
        start_of_day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            + Duration::days(day)
            + Duration::hours(i64::from(hour))
    }

    fn ledger_with(config: LedgerConfig) -> (Ledger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch_monday());
        let ledger = Ledger::new(Store::in_memory().unwrap(), clock.clone(), config);
        (ledger, clock)
    }

    fn new_counter(mode: &str) -> NewCounter {
        NewCounter {
            label: "Blog".to_string(),
            start_value: 0,
            mode: mode.to_string(),
            throttle_override_secs: None,
            note: None,
        }
    }

    #[test]
    fn test_should_increment_table() {
        let now = at(0, 12);
        let earlier = Some(now - Duration::seconds(30));

        assert!(should_increment(Cooldown::Forever, None, now));
        assert!(!should_increment(Cooldown::Forever, earlier, now));
        assert!(should_increment(Cooldown::None, earlier, now));
        assert!(should_increment(Cooldown::Window(30_000), earlier, now));
        assert!(!should_increment(Cooldown::Window(30_001), earlier, now));
    }

    #[test]
    fn test_generated_ids() {
        let (ledger, _) = ledger_with(LedgerConfig::default());
        let counter = ledger.create_counter(&new_counter("unique")).unwrap();
        assert_eq!(counter.id.len(), 8);
        assert!(counter
            .id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        assert_eq!(counter.created_at, Some(at(0, 0)));
    }

    #[test]
    fn test_id_collision_retries_then_gives_up() {
        let (ledger, _) = ledger_with(LedgerConfig::default());
        ledger
            .create_with_ids(&new_counter("unique"), || "taken".to_string())
            .unwrap();

        let mut ids = vec!["fresh".to_string(), "taken".to_string()];
        let counter = ledger
            .create_with_ids(&new_counter("unique"), || ids.pop().unwrap())
            .unwrap();
        assert_eq!(counter.id, "fresh");

        let err = ledger
            .create_with_ids(&new_counter("unique"), || "taken".to_string())
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdSpaceExhausted(MAX_ID_ATTEMPTS)));
    }

    #[test]
    fn test_invalid_input_never_reaches_store() {
        let (ledger, _) = ledger_with(LedgerConfig::default());
        let err = ledger.create_counter(&new_counter("sometimes")).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(ledger.store().count_counters(None, None).unwrap(), 0);
    }

    #[test]
    fn test_throttled_unlimited_counter() {
        let (ledger, clock) = ledger_with(LedgerConfig {
            unlimited_throttle_secs: 60,
            ..Default::default()
        });
        let counter = ledger.create_counter(&new_counter("unlimited")).unwrap();
        let hit = |ip: &str| match ledger.record_hit(&counter.id, Some(ip)).unwrap() {
            HitOutcome::Recorded { counter, .. } => counter.value,
            HitOutcome::CounterNotFound => panic!("counter vanished"),
        };

        assert_eq!(hit("10.0.0.1"), 1);
        clock.advance_ms(30_000);
        assert_eq!(hit("10.0.0.1"), 1);
        // Another visitor is unaffected by the first one's throttle
        assert_eq!(hit("10.0.0.2"), 2);
        clock.advance_ms(60_000);
        assert_eq!(hit("10.0.0.1"), 3);
    }

    #[test]
    fn test_per_counter_throttle_override() {
        let (ledger, clock) = ledger_with(LedgerConfig::default());
        let mut input = new_counter("unlimited");
        input.throttle_override_secs = Some(10);
        let counter = ledger.create_counter(&input).unwrap();

        for _ in 0..3 {
            ledger.record_hit(&counter.id, Some("a")).unwrap();
            clock.advance_ms(1000);
        }
        assert_eq!(ledger.get_counter(&counter.id).unwrap().unwrap().value, 1);

        clock.advance_ms(10_000);
        ledger.record_hit(&counter.id, Some("a")).unwrap();
        assert_eq!(ledger.get_counter(&counter.id).unwrap().unwrap().value, 2);
    }

    #[test]
    fn test_anonymous_hits_always_count() {
        let (ledger, _) = ledger_with(LedgerConfig::default());
        let counter = ledger.create_counter(&new_counter("unique")).unwrap();
        for identity in [None, Some(""), Some("   "), None] {
            ledger.record_hit(&counter.id, identity).unwrap();
        }
        assert_eq!(ledger.get_counter(&counter.id).unwrap().unwrap().value, 4);
        assert_eq!(ledger.store().count_hit_records(&counter.id).unwrap(), 0);
    }

    #[test]
    fn test_hit_at_max_value_is_not_counted() {
        let (ledger, _) = ledger_with(LedgerConfig::default());
        let counter = ledger.create_counter(&new_counter("unlimited")).unwrap();
        assert!(ledger.set_value(&counter.id, i64::MAX).unwrap());

        let outcome = ledger.record_hit(&counter.id, None).unwrap();
        assert!(matches!(
            outcome,
            HitOutcome::Recorded { incremented: false, ref counter } if counter.value == i64::MAX as u64
        ));
        let stored = ledger.get_counter(&counter.id).unwrap().unwrap();
        assert_eq!(stored.value, i64::MAX as u64);
        assert!(ledger.counter_view(&counter.id).unwrap().is_some());
    }

    #[test]
    fn test_week_trend_is_monday_first() {
        // Thursday 2024-01-04 noon
        let now = at(3, 12);
        let hits = vec![at(0, 1), at(0, 2), at(2, 5), at(3, 9), at(-1, 23), at(-7, 0)];
        let series = compute_activity_trend(&hits, TrendWindow::Week, now);
        // Window is Fri 2023-12-29 ..= Thu 2024-01-04; the Sunday hit lands last
        assert_eq!(series, vec![2, 0, 1, 1, 0, 0, 1]);
    }

    #[test]
    fn test_month_trend_is_daily_oldest_first() {
        let now = at(29, 8);
        let hits = vec![at(0, 0), at(0, 1), at(29, 7), at(30, 0), at(-1, 0)];
        let series = compute_activity_trend(&hits, TrendWindow::Month, now);
        assert_eq!(series.len(), 30);
        assert_eq!(series[0], 2);
        assert_eq!(series[29], 1);
        assert_eq!(series.iter().sum::<u64>(), 3);
    }

    #[test]
    fn test_activity_trend_from_store() {
        let (ledger, clock) = ledger_with(LedgerConfig::default());
        let counter = ledger.create_counter(&new_counter("unlimited")).unwrap();

        ledger.record_hit(&counter.id, Some("a")).unwrap();
        clock.advance(Duration::days(1));
        ledger.record_hit(&counter.id, Some("b")).unwrap();
        ledger.record_hit(&counter.id, Some("c")).unwrap();

        assert_eq!(
            ledger.activity_trend(&counter.id, 7).unwrap(),
            vec![1, 2, 0, 0, 0, 0, 0]
        );
        assert!(matches!(
            ledger.activity_trend(&counter.id, 14),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_inactive_status() {
        let now = at(40, 0);

        let quiet = compute_inactive_status(Some(at(5, 0)), Some(at(0, 0)), 30, now);
        assert_eq!(quiet, InactiveStatus { inactive: true, idle_days: Some(35) });

        let busy = compute_inactive_status(Some(at(39, 0)), Some(at(0, 0)), 30, now);
        assert!(!busy.inactive);

        // Never hit: judged from creation
        let fresh = compute_inactive_status(None, Some(at(35, 0)), 30, now);
        assert_eq!(fresh, InactiveStatus { inactive: false, idle_days: Some(5) });

        // Exactly at the threshold counts as inactive
        let edge = compute_inactive_status(None, Some(at(10, 0)), 30, now);
        assert!(edge.inactive);

        let unknown = compute_inactive_status(None, None, 30, now);
        assert_eq!(unknown, InactiveStatus { inactive: true, idle_days: None });
    }

    #[test]
    fn test_list_counters_pagination() {
        let (ledger, clock) = ledger_with(LedgerConfig::default());
        for _ in 0..5 {
            ledger.create_counter(&new_counter("unique")).unwrap();
            clock.advance_ms(1);
        }

        let page = ledger
            .list_counters(&ListQuery {
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.counters.len(), 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.page, 2);
        assert_eq!(page.pages, 3);

        let err = ledger
            .list_counters(&ListQuery {
                mode: Some("weekly".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_purge_expired_hits() {
        let (ledger, clock) = ledger_with(LedgerConfig {
            hit_retention_days: 7,
            ..Default::default()
        });
        let counter = ledger.create_counter(&new_counter("unique")).unwrap();
        ledger.record_hit(&counter.id, Some("old")).unwrap();
        clock.advance(Duration::days(8));
        ledger.record_hit(&counter.id, Some("new")).unwrap();

        assert_eq!(ledger.purge_expired_hits().unwrap(), 1);
        assert_eq!(ledger.store().count_hit_records(&counter.id).unwrap(), 1);
    }

    #[test]
    fn test_counter_view() {
        let (ledger, clock) = ledger_with(LedgerConfig::default());
        let counter = ledger.create_counter(&new_counter("unique")).unwrap();
        clock.advance(Duration::hours(3));
        ledger.record_hit(&counter.id, Some("a")).unwrap();
        ledger.record_hit(&counter.id, Some("b")).unwrap();

        let view = ledger.counter_view(&counter.id).unwrap().unwrap();
        assert_eq!(view.value, 2);
        assert_eq!(view.hits_today, 2);
        assert_eq!(view.last_hit_at, Some(at(0, 3)));
        assert_eq!(view.activity_trend, vec![2, 0, 0, 0, 0, 0, 0]);
        assert!(!view.inactive_status.inactive);

        assert!(ledger.counter_view("missing").unwrap().is_none());
    }
}
