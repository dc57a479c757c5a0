use std::collections::HashMap;

use chrono::{DateTime, Local, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::alarms::{AlarmScheduler, AlarmTimer};
use crate::domain::{DailyTotals, TabId, WeeklyHistory};
use crate::ledger::DomainTimeLedger;
use crate::storage::Store;

const MAIN_FRAME: i64 = 0;

/// Everything the browser side can send: tab lifecycle events and overlay
/// commands.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Inbound {
	#[serde(rename_all = "camelCase")]
	NavigationCompleted {
		tab_id: TabId,
		url: String,
		#[serde(default)]
		frame_id: i64,
	},
	#[serde(rename_all = "camelCase")]
	BeforeNavigate {
		tab_id: TabId,
		url: String,
		#[serde(default)]
		frame_id: i64,
	},
	#[serde(rename_all = "camelCase")]
	TabRemoved { tab_id: TabId },
	GetTotalTime,
	GetTotalTimeEachDay,
	GetAlarms,
	AddAlarm {
		name: String,
		date: String,
		time: String,
	},
	DeleteAlarm {
		name: String,
	},
	ClearSaveData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
	TotalTime { data: DailyTotals },
	TotalTimeEachDay { data: WeeklyHistory },
	Alarms { data: HashMap<String, DateTime<Utc>> },
	AlarmFired { name: String },
	Cleared,
	Error { message: String },
}

impl Outbound {
	pub fn error(message: impl Into<String>) -> Self {
		Self::Error {
			message: message.into(),
		}
	}
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
	#[error("invalid alarm date {0:?}, expected YYYY-MM-DD")]
	Date(String),
	#[error("invalid alarm time {0:?}, expected HH:MM")]
	Time(String),
	#[error("{date} {time} does not exist in the local time zone")]
	Nonexistent { date: String, time: String },
}

/// Combines an overlay date and time picker value into an instant, reading
/// both as local wall-clock time.
pub fn alarm_instant(date: &str, time: &str) -> Result<DateTime<Utc>, CommandError> {
	let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
		.map_err(|_| CommandError::Date(date.to_string()))?;
	let clock = NaiveTime::parse_from_str(time.trim(), "%H:%M")
		.or_else(|_| NaiveTime::parse_from_str(time.trim(), "%H:%M:%S"))
		.map_err(|_| CommandError::Time(time.to_string()))?;

	match Local.from_local_datetime(&day.and_time(clock)) {
		LocalResult::Single(at) => Ok(at.with_timezone(&Utc)),
		LocalResult::Ambiguous(first, second) => Ok(first.min(second).with_timezone(&Utc)),
		LocalResult::None => Err(CommandError::Nonexistent {
			date: date.to_string(),
			time: time.to_string(),
		}),
	}
}

/// Owns both services and turns inbound messages into outbound ones.
pub struct Companion<S: Store, T: AlarmTimer> {
	ledger: DomainTimeLedger<S>,
	scheduler: AlarmScheduler<S, T>,
}

impl<S: Store, T: AlarmTimer> Companion<S, T> {
	pub fn new(ledger: DomainTimeLedger<S>, scheduler: AlarmScheduler<S, T>) -> Self {
		Self { ledger, scheduler }
	}

	pub fn ledger(&self) -> &DomainTimeLedger<S> {
		&self.ledger
	}

	pub fn scheduler(&self) -> &AlarmScheduler<S, T> {
		&self.scheduler
	}

	pub fn handle(&mut self, message: Inbound, now: DateTime<Utc>) -> Vec<Outbound> {
		match message {
			Inbound::NavigationCompleted {
				tab_id,
				url,
				frame_id,
			} => {
				if frame_id == MAIN_FRAME {
					self.ledger.navigation_completed(tab_id, &url, now);
				}
				Vec::new()
			}
			Inbound::BeforeNavigate {
				tab_id,
				url,
				frame_id,
			} => {
				if frame_id == MAIN_FRAME {
					self.ledger.before_navigate(tab_id, &url, now);
				}
				Vec::new()
			}
			Inbound::TabRemoved { tab_id } => {
				self.ledger.tab_removed(tab_id, now);
				Vec::new()
			}
			Inbound::GetTotalTime => {
				self.ledger.ensure_current_day(now);
				vec![Outbound::TotalTime {
					data: self.ledger.total_time(),
				}]
			}
			Inbound::GetTotalTimeEachDay => {
				self.ledger.ensure_current_day(now);
				vec![Outbound::TotalTimeEachDay {
					data: self.ledger.total_time_each_day(),
				}]
			}
			Inbound::GetAlarms => vec![self.alarms_message()],
			Inbound::AddAlarm { name, date, time } => match alarm_instant(&date, &time) {
				Ok(at) => {
					let fired = self.scheduler.add_alarm(name, at, now);
					let mut replies = fired_messages(fired);
					replies.push(self.alarms_message());
					replies
				}
				Err(err) => {
					warn!("rejected alarm {name:?}: {err}");
					vec![Outbound::error(err.to_string())]
				}
			},
			Inbound::DeleteAlarm { name } => {
				if !self.scheduler.delete_alarm(&name) {
					debug!("no alarm named {name:?} to delete");
				}
				vec![self.alarms_message()]
			}
			Inbound::ClearSaveData => {
				self.ledger.clear_saved_data();
				vec![Outbound::Cleared]
			}
		}
	}

	/// The scheduler's timer elapsed.
	pub fn alarm_timer_elapsed(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
		fired_messages(self.scheduler.timer_elapsed(now))
	}

	/// Decodes one protocol line; undecodable lines become an error reply.
	pub fn handle_line(&mut self, line: &str, now: DateTime<Utc>) -> Vec<Outbound> {
		let line = line.trim();
		if line.is_empty() {
			return Vec::new();
		}

		match serde_json::from_str::<Inbound>(line) {
			Ok(message) => self.handle(message, now),
			Err(err) => {
				warn!("undecodable message: {err}");
				vec![Outbound::error(format!("undecodable message: {err}"))]
			}
		}
	}

	fn alarms_message(&self) -> Outbound {
		Outbound::Alarms {
			data: self.scheduler.alarms().clone(),
		}
	}
}

pub fn fired_messages(fired: Vec<String>) -> Vec<Outbound> {
	fired
		.into_iter()
		.map(|name| Outbound::AlarmFired { name })
		.collect()
}
