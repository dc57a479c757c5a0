use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Datelike, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const NULL_DOMAIN: &str = "null";
pub const NEWTAB_DOMAIN: &str = "newtab";
pub const DAYS_PER_WEEK: usize = 7;

pub type TabId = i64;

/// Normalized website identifier derived from a URL hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    pub fn null() -> Self {
        Self(NULL_DOMAIN.to_string())
    }

    /// Reduces a hostname to its registrable label.
    ///
    /// `mail.example.com` and `example.com` both become `example`; anything
    /// that is not two or three labels long is kept as-is.
    pub fn from_hostname(hostname: Option<&str>) -> Self {
        let hostname = match hostname.map(str::trim) {
            Some(hostname) if !hostname.is_empty() => hostname,
            _ => return Self::null(),
        };

        let parts = hostname.split('.').collect::<Vec<_>>();
        let label = match parts.as_slice() {
            [_, label, _] => *label,
            [label, _] => *label,
            _ => hostname,
        };

        if label.is_empty() {
            Self::null()
        } else {
            Self(label.to_string())
        }
    }

    /// Never fails: an unparseable URL or one without a host maps to the
    /// sentinel domain.
    pub fn from_url(raw: &str) -> Self {
        match Url::parse(raw) {
            Ok(url) => Self::from_hostname(url.host_str()),
            Err(err) => {
                tracing::debug!(url = raw, "unparseable url, using sentinel domain: {err}");
                Self::null()
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_newtab(&self) -> bool {
        self.0 == NEWTAB_DOMAIN
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Domain {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Accumulated seconds per domain for a single day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DailyTotals(HashMap<Domain, f64>);

impl DailyTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, domain: &Domain, seconds: f64) {
        *self.0.entry(domain.clone()).or_insert(0.0) += seconds;
    }

    pub fn get(&self, domain: &Domain) -> Option<f64> {
        self.0.get(domain).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn total_seconds(&self) -> f64 {
        self.0.values().sum()
    }

    /// Largest first, ties by name.
    pub fn sorted(&self) -> Vec<(Domain, f64)> {
        let mut rows = self
            .0
            .iter()
            .map(|(domain, seconds)| (domain.clone(), *seconds))
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| {
            right
                .1
                .total_cmp(&left.1)
                .then_with(|| left.0.cmp(&right.0))
        });
        rows
    }
}

/// One frozen `DailyTotals` per day-of-week, Sunday first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeeklyHistory([DailyTotals; DAYS_PER_WEEK]);

impl WeeklyHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, day: DayOfWeek) -> &DailyTotals {
        &self.0[day.index()]
    }

    pub fn set(&mut self, day: DayOfWeek, totals: DailyTotals) {
        self.0[day.index()] = totals;
    }

    pub fn clear_slot(&mut self, day: DayOfWeek) {
        self.0[day.index()] = DailyTotals::new();
    }

    pub fn iter(&self) -> impl Iterator<Item = (DayOfWeek, &DailyTotals)> {
        self.0
            .iter()
            .enumerate()
            .map(|(index, totals)| (DayOfWeek::from_index(index), totals))
    }
}

/// Day-of-week index, 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayOfWeek(u8);

impl DayOfWeek {
    pub fn new(index: u32) -> Option<Self> {
        if (index as usize) < DAYS_PER_WEEK {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    fn from_index(index: usize) -> Self {
        Self((index % DAYS_PER_WEEK) as u8)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; DAYS_PER_WEEK] = [
            "Sunday",
            "Monday",
            "Tuesday",
            "Wednesday",
            "Thursday",
            "Friday",
            "Saturday",
        ];
        NAMES[self.index()]
    }

    /// Days strictly between `from` and `to` walking forward, wrapping past
    /// Saturday when `to` comes earlier in the week.
    pub fn days_between(from: DayOfWeek, to: DayOfWeek) -> Vec<DayOfWeek> {
        let start = from.index();
        let mut end = to.index();
        if end < start {
            end += DAYS_PER_WEEK;
        }

        (start + 1..end).map(Self::from_index).collect()
    }
}

/// Which calendar day a timestamp belongs to, in local time, after shifting
/// the day boundary by `day_start_offset`.
pub fn day_of_week(timestamp: DateTime<Utc>, day_start_offset: Duration) -> DayOfWeek {
    let local_time = timestamp.with_timezone(&Local) - day_start_offset;
    DayOfWeek::from_index(local_time.weekday().num_days_from_sunday() as usize)
}

/// Human duration the way the overlay shows it.
pub fn format_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    if seconds < 60.0 {
        format!("{} seconds", seconds.ceil() as i64)
    } else if seconds < 3600.0 {
        format!("{} minutes", (seconds / 60.0).round() as i64)
    } else {
        let total_minutes = (seconds / 60.0).round() as i64;
        format!("{}h {:02}m", total_minutes / 60, total_minutes % 60)
    }
}
