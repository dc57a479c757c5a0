use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::domain::{DailyTotals, DayOfWeek, Domain, TabId, WeeklyHistory, day_of_week};
use crate::storage::{
    self, CURRENT_DAY_KEY, Store, TOTAL_TIME_EACH_DAY_KEY, TOTAL_TIME_KEY,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTabSession {
    pub domain: Domain,
    pub started_at: Option<DateTime<Utc>>,
}

/// Per-domain time accounting for the current day plus a week of history.
///
/// Every operation takes the current instant so that callers decide what
/// "now" is; the ledger never reads the clock itself.
pub struct DomainTimeLedger<S: Store> {
    store: S,
    day_start_offset: Duration,
    sessions: HashMap<TabId, ActiveTabSession>,
    totals: DailyTotals,
    history: WeeklyHistory,
    current_day: Option<DateTime<Utc>>,
}

impl<S: Store> DomainTimeLedger<S> {
    /// Loads persisted state and reconciles it with `now`.
    ///
    /// Nothing may be accounted before this returns; the ledger handed back
    /// already points at today's totals.
    pub fn open(store: S, day_start_offset: Duration, now: DateTime<Utc>) -> Self {
        let totals = storage::load_daily_totals(&store).unwrap_or_default();
        let history = storage::load_weekly_history(&store).unwrap_or_default();
        let current_day = storage::load_current_day(&store);

        let mut ledger = Self {
            store,
            day_start_offset,
            sessions: HashMap::new(),
            totals,
            history,
            current_day,
        };
        ledger.reconcile(now);
        ledger
    }

    /// Retires the in-flight totals into the weekly history when the day has
    /// changed since the marker was written.
    pub fn reconcile(&mut self, now: DateTime<Utc>) {
        let Some(marker) = self.current_day else {
            info!("no day marker stored, starting a fresh day");
            self.current_day = Some(now);
            self.persist_marker();
            return;
        };

        let previous = self.day_of(marker);
        let current = self.day_of(now);
        if previous == current {
            return;
        }

        let skipped = DayOfWeek::days_between(previous, current);
        for day in &skipped {
            self.history.clear_slot(*day);
        }

        let retired = std::mem::take(&mut self.totals);
        info!(
            from = previous.name(),
            to = current.name(),
            skipped = skipped.len(),
            domains = retired.len(),
            "day rolled over"
        );
        self.history.set(previous, retired);
        self.current_day = Some(now);

        self.persist_totals();
        self.persist_marker();
    }

    /// Main-frame navigation finished: the tab now shows `url`. Nothing is
    /// charged here.
    pub fn navigation_completed(&mut self, tab: TabId, url: &str, now: DateTime<Utc>) {
        self.ensure_current_day(now);
        let domain = Domain::from_url(url);
        debug!(tab, domain = %domain, "session started");
        self.sessions.insert(
            tab,
            ActiveTabSession {
                domain,
                started_at: Some(now),
            },
        );
    }

    /// Main-frame navigation is about to leave the current page: close out
    /// the previous domain and start timing the next one.
    pub fn before_navigate(&mut self, tab: TabId, url: &str, now: DateTime<Utc>) {
        self.ensure_current_day(now);
        if let Some(previous) = self.sessions.get(&tab).cloned() {
            self.charge(tab, &previous, now);
        } else {
            debug!(tab, "no prior session to close out");
        }

        self.sessions.insert(
            tab,
            ActiveTabSession {
                domain: Domain::from_url(url),
                started_at: Some(now),
            },
        );
    }

    pub fn tab_removed(&mut self, tab: TabId, now: DateTime<Utc>) {
        self.ensure_current_day(now);
        match self.sessions.remove(&tab) {
            Some(session) => self.charge(tab, &session, now),
            None => debug!(tab, "removed tab had no session"),
        }
    }

    pub fn total_time(&self) -> DailyTotals {
        self.totals.clone()
    }

    pub fn total_time_each_day(&self) -> WeeklyHistory {
        self.history.clone()
    }

    pub fn session(&self, tab: TabId) -> Option<&ActiveTabSession> {
        self.sessions.get(&tab)
    }

    pub fn current_day(&self) -> Option<DateTime<Utc>> {
        self.current_day
    }

    /// Forgets all accounted time. Open tab sessions keep running.
    pub fn clear_saved_data(&mut self) {
        self.totals = DailyTotals::new();
        self.history = WeeklyHistory::new();
        info!("saved time data cleared");
        self.persist_totals();
    }

    /// Rolls over first if the day changed since the marker was written.
    /// Queries call this too, so totals read after midnight are the new day's.
    pub fn ensure_current_day(&mut self, now: DateTime<Utc>) {
        let stale = match self.current_day {
            Some(marker) => self.day_of(marker) != self.day_of(now),
            None => true,
        };
        if stale {
            self.reconcile(now);
        }
    }

    fn charge(&mut self, tab: TabId, session: &ActiveTabSession, now: DateTime<Utc>) {
        if session.domain.is_newtab() {
            return;
        }

        let Some(started_at) = session.started_at else {
            debug!(tab, domain = %session.domain, "session has no start time, nothing charged");
            return;
        };

        let elapsed = (now - started_at).num_milliseconds() as f64 / 1000.0;
        if elapsed < 0.0 {
            warn!(tab, domain = %session.domain, elapsed, "clock moved backwards, nothing charged");
            return;
        }

        self.totals.add(&session.domain, elapsed);
        let today = self.day_of(now);
        self.history.set(today, self.totals.clone());
        debug!(tab, domain = %session.domain, elapsed, "charged");

        self.persist_totals();
        self.persist_marker();
    }

    fn day_of(&self, timestamp: DateTime<Utc>) -> DayOfWeek {
        day_of_week(timestamp, self.day_start_offset)
    }

    fn persist_totals(&self) {
        storage::persist(&self.store, TOTAL_TIME_KEY, &self.totals);
        storage::persist(&self.store, TOTAL_TIME_EACH_DAY_KEY, &self.history);
    }

    fn persist_marker(&self) {
        if let Some(marker) = self.current_day {
            storage::persist(&self.store, CURRENT_DAY_KEY, &marker.to_rfc3339());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Local, TimeZone, Utc};
    use serde_json::json;

    use crate::domain::{DailyTotals, DayOfWeek, Domain, WeeklyHistory};
    use crate::storage::{
        CURRENT_DAY_KEY, FailingStore, MemoryStore, TOTAL_TIME_EACH_DAY_KEY, TOTAL_TIME_KEY, load_current_day,
        load_daily_totals, load_weekly_history, persist,
    };

    use super::DomainTimeLedger;

    // 2026-01-04 is a Sunday, so day N of that week has day-of-week N.
    fn at(day_of_week: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2026, 1, 4 + day_of_week, hour, minute, second)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn day(index: u32) -> DayOfWeek {
        DayOfWeek::new(index).unwrap()
    }

    fn totals(entries: &[(&str, f64)]) -> DailyTotals {
        let mut totals = DailyTotals::new();
        for (domain, seconds) in entries {
            totals.add(&Domain::from(*domain), *seconds);
        }
        totals
    }

    fn store_with(marker: DateTime<Utc>, today: DailyTotals, history: WeeklyHistory) -> MemoryStore {
        let store = MemoryStore::new();
        persist(&store, CURRENT_DAY_KEY, &marker.to_rfc3339());
        persist(&store, TOTAL_TIME_KEY, &today);
        persist(&store, TOTAL_TIME_EACH_DAY_KEY, &history);
        store
    }

    fn filled_history() -> WeeklyHistory {
        let mut history = WeeklyHistory::new();
        for index in 0..7 {
            history.set(day(index), totals(&[("stale", 1.0)]));
        }
        history
    }

    #[test]
    fn charges_previous_domain_on_next_navigation() {
        let store = MemoryStore::new();
        let mut ledger = DomainTimeLedger::open(store.clone(), Duration::zero(), at(1, 9, 0, 0));

        ledger.navigation_completed(7, "https://mail.google.com/inbox", at(1, 9, 0, 0));
        ledger.before_navigate(7, "https://github.com/", at(1, 9, 0, 30));
        ledger.navigation_completed(7, "https://github.com/", at(1, 9, 0, 31));
        ledger.tab_removed(7, at(1, 9, 2, 31));

        let today = ledger.total_time();
        assert_eq!(today.get(&Domain::from("google")), Some(30.0));
        assert_eq!(today.get(&Domain::from("github")), Some(120.0));
        assert!(ledger.session(7).is_none());

        let persisted = load_daily_totals(&store).expect("totals persisted");
        assert_eq!(persisted, today);
        let history = load_weekly_history(&store).expect("history persisted");
        assert_eq!(history.slot(day(1)), &today);
    }

    #[test]
    fn navigation_completed_alone_charges_nothing() {
        let mut ledger =
            DomainTimeLedger::open(MemoryStore::new(), Duration::zero(), at(2, 9, 0, 0));
        ledger.navigation_completed(1, "https://example.com", at(2, 9, 0, 0));
        ledger.navigation_completed(1, "https://docs.rs", at(2, 9, 5, 0));

        assert!(ledger.total_time().is_empty());
        assert_eq!(
            ledger.session(1).map(|session| session.domain.as_str()),
            Some("docs")
        );
    }

    #[test]
    fn newtab_time_is_never_charged() {
        let mut ledger =
            DomainTimeLedger::open(MemoryStore::new(), Duration::zero(), at(3, 9, 0, 0));
        ledger.navigation_completed(1, "chrome://newtab/", at(3, 9, 0, 0));
        ledger.before_navigate(1, "https://rust-lang.org", at(3, 9, 10, 0));
        ledger.before_navigate(1, "chrome://newtab/", at(3, 9, 10, 45));
        ledger.tab_removed(1, at(3, 9, 30, 0));

        let today = ledger.total_time();
        assert_eq!(today.len(), 1);
        assert_eq!(today.get(&Domain::from("rust-lang")), Some(45.0));
    }

    #[test]
    fn per_domain_sums_match_time_spent() {
        let mut ledger =
            DomainTimeLedger::open(MemoryStore::new(), Duration::zero(), at(4, 8, 0, 0));
        let visits = [
            ("https://www.youtube.com/", 0),
            ("https://github.com/", 100),
            ("https://www.youtube.com/watch", 250),
            ("chrome://newtab/", 400),
            ("https://github.com/pulls", 1000),
        ];
        let start = at(4, 8, 0, 0);

        ledger.navigation_completed(3, visits[0].0, start);
        for (url, offset) in &visits[1..] {
            ledger.before_navigate(3, url, start + Duration::seconds(*offset));
        }
        ledger.tab_removed(3, start + Duration::seconds(1300));

        let today = ledger.total_time();
        assert_eq!(today.get(&Domain::from("youtube")), Some(100.0 + 150.0));
        assert_eq!(today.get(&Domain::from("github")), Some(150.0 + 300.0));
        assert_eq!(today.total_seconds(), 700.0);
    }

    #[test]
    fn missing_session_and_missing_start_charge_nothing() {
        let mut ledger =
            DomainTimeLedger::open(MemoryStore::new(), Duration::zero(), at(1, 9, 0, 0));
        ledger.tab_removed(99, at(1, 9, 1, 0));
        ledger.before_navigate(42, "https://github.com", at(1, 9, 1, 0));
        assert!(ledger.total_time().is_empty());

        ledger.sessions.get_mut(&42).expect("session").started_at = None;
        ledger.tab_removed(42, at(1, 9, 5, 0));
        assert!(ledger.total_time().is_empty());
    }

    #[test]
    fn queries_are_idempotent() {
        let mut ledger =
            DomainTimeLedger::open(MemoryStore::new(), Duration::zero(), at(5, 9, 0, 0));
        ledger.navigation_completed(1, "https://github.com", at(5, 9, 0, 0));
        ledger.tab_removed(1, at(5, 9, 1, 0));

        assert_eq!(ledger.total_time(), ledger.total_time());
        assert_eq!(ledger.total_time_each_day(), ledger.total_time_each_day());
    }

    #[test]
    fn rollover_clears_skipped_days() {
        let store = store_with(
            at(1, 20, 0, 0),
            totals(&[("github", 300.0)]),
            filled_history(),
        );
        let now = at(4, 9, 0, 0);
        let ledger = DomainTimeLedger::open(store.clone(), Duration::zero(), now);

        let history = ledger.total_time_each_day();
        assert!(history.slot(day(2)).is_empty());
        assert!(history.slot(day(3)).is_empty());
        assert_eq!(history.slot(day(1)), &totals(&[("github", 300.0)]));
        assert_eq!(history.slot(day(0)), &totals(&[("stale", 1.0)]));
        assert_eq!(history.slot(day(5)), &totals(&[("stale", 1.0)]));
        assert!(ledger.total_time().is_empty());
        assert_eq!(ledger.current_day(), Some(now));
        assert_eq!(load_current_day(&store), Some(now));
        assert!(load_daily_totals(&store).expect("totals").is_empty());
    }

    #[test]
    fn rollover_wraps_around_the_week() {
        // Saturday to the following Monday.
        let saturday = at(6, 22, 0, 0);
        let monday = at(1, 9, 0, 0) + Duration::days(7);
        let store = store_with(saturday, totals(&[("youtube", 60.0)]), filled_history());
        let ledger = DomainTimeLedger::open(store, Duration::zero(), monday);

        let history = ledger.total_time_each_day();
        assert!(history.slot(day(0)).is_empty());
        assert_eq!(history.slot(day(6)), &totals(&[("youtube", 60.0)]));
        for index in 1..6 {
            assert_eq!(history.slot(day(index)), &totals(&[("stale", 1.0)]));
        }
        assert!(ledger.total_time().is_empty());
    }

    #[test]
    fn same_day_restart_keeps_accumulating() {
        let store = store_with(
            at(2, 8, 0, 0),
            totals(&[("github", 10.0)]),
            WeeklyHistory::new(),
        );
        let mut ledger = DomainTimeLedger::open(store, Duration::zero(), at(2, 18, 0, 0));
        ledger.navigation_completed(1, "https://github.com", at(2, 18, 0, 0));
        ledger.tab_removed(1, at(2, 18, 0, 5));

        assert_eq!(ledger.total_time().get(&Domain::from("github")), Some(15.0));
    }

    #[test]
    fn restart_does_not_double_count_open_sessions() {
        let store = MemoryStore::new();
        let mut ledger = DomainTimeLedger::open(store.clone(), Duration::zero(), at(2, 9, 0, 0));
        ledger.navigation_completed(1, "https://github.com", at(2, 9, 0, 0));
        ledger.before_navigate(1, "https://docs.rs", at(2, 9, 1, 0));
        drop(ledger);

        let mut reopened = DomainTimeLedger::open(store, Duration::zero(), at(2, 9, 30, 0));
        reopened.tab_removed(1, at(2, 9, 31, 0));
        assert_eq!(reopened.total_time().get(&Domain::from("github")), Some(60.0));
        assert_eq!(reopened.total_time().len(), 1);
    }

    #[test]
    fn day_change_while_running_rolls_over_before_charging() {
        let mut ledger =
            DomainTimeLedger::open(MemoryStore::new(), Duration::zero(), at(2, 23, 0, 0));
        ledger.navigation_completed(1, "https://github.com", at(2, 23, 0, 0));
        ledger.before_navigate(1, "https://docs.rs", at(2, 23, 30, 0));
        ledger.before_navigate(1, "https://github.com", at(3, 0, 10, 0));

        let history = ledger.total_time_each_day();
        assert_eq!(history.slot(day(2)), &totals(&[("github", 1800.0)]));
        assert_eq!(ledger.total_time(), totals(&[("docs", 2400.0)]));
        assert_eq!(history.slot(day(3)), &totals(&[("docs", 2400.0)]));
    }

    #[test]
    fn day_start_offset_keeps_late_night_on_previous_day() {
        let mut ledger =
            DomainTimeLedger::open(MemoryStore::new(), Duration::hours(4), at(2, 23, 0, 0));
        ledger.navigation_completed(1, "https://github.com", at(2, 23, 0, 0));
        ledger.tab_removed(1, at(3, 1, 0, 0));

        assert_eq!(ledger.total_time(), totals(&[("github", 7200.0)]));
        assert_eq!(
            ledger.total_time_each_day().slot(day(2)),
            &totals(&[("github", 7200.0)])
        );
    }

    #[test]
    fn clear_saved_data_keeps_sessions_running() {
        let store = MemoryStore::new();
        let mut ledger = DomainTimeLedger::open(store.clone(), Duration::zero(), at(1, 9, 0, 0));
        ledger.navigation_completed(1, "https://github.com", at(1, 9, 0, 0));
        ledger.before_navigate(1, "https://docs.rs", at(1, 9, 1, 0));

        ledger.clear_saved_data();
        assert!(ledger.total_time().is_empty());
        assert_eq!(ledger.total_time_each_day(), WeeklyHistory::new());
        assert_eq!(store.get(TOTAL_TIME_KEY), Some(json!({})));

        ledger.tab_removed(1, at(1, 9, 2, 0));
        assert_eq!(ledger.total_time(), totals(&[("docs", 60.0)]));
    }

    #[test]
    fn corrupted_store_opens_empty() {
        let store = MemoryStore::new();
        store.insert(TOTAL_TIME_KEY, json!([1, 2, 3]));
        store.insert(TOTAL_TIME_EACH_DAY_KEY, json!("oops"));
        store.insert(CURRENT_DAY_KEY, json!(17));

        let now = at(1, 9, 0, 0);
        let ledger = DomainTimeLedger::open(store.clone(), Duration::zero(), now);
        assert!(ledger.total_time().is_empty());
        assert_eq!(ledger.total_time_each_day(), WeeklyHistory::new());
        assert_eq!(ledger.current_day(), Some(now));
        assert_eq!(load_current_day(&store), Some(now));
    }

    #[test]
    fn failed_writes_do_not_block_accounting() {
        let mut ledger = DomainTimeLedger::open(FailingStore, Duration::zero(), at(2, 9, 0, 0));

        ledger.navigation_completed(1, "https://github.com/", at(2, 9, 0, 0));
        ledger.before_navigate(1, "https://news.ycombinator.com/", at(2, 9, 0, 40));
        ledger.navigation_completed(1, "https://news.ycombinator.com/", at(2, 9, 0, 41));
        ledger.tab_removed(1, at(2, 9, 1, 41));

        assert_eq!(ledger.total_time().get(&Domain::from("github")), Some(40.0));
        assert_eq!(ledger.total_time().get(&Domain::from("ycombinator")), Some(60.0));
        assert_eq!(
            ledger.total_time_each_day().slot(day(2)).get(&Domain::from("github")),
            Some(40.0)
        );
        assert!(ledger.session(1).is_none());
    }

}
