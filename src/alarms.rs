use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::storage::{self, Store};

/// The one timer the scheduler owns.
pub trait AlarmTimer {
    /// Replaces any armed timer with one that elapses after `delay`.
    fn arm(&mut self, delay: std::time::Duration);
    fn cancel(&mut self);
}

/// Sends a tick on `ticks` when the armed delay elapses. Must be used from
/// inside a tokio runtime.
pub struct TokioAlarmTimer {
    ticks: mpsc::UnboundedSender<()>,
    task: Option<JoinHandle<()>>,
}

impl TokioAlarmTimer {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (ticks, receiver) = mpsc::unbounded_channel();
        (Self { ticks, task: None }, receiver)
    }
}

impl AlarmTimer for TokioAlarmTimer {
    fn arm(&mut self, delay: std::time::Duration) {
        self.cancel();
        let ticks = self.ticks.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ticks.send(());
        }));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TokioAlarmTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Armed {
    name: String,
    at: DateTime<Utc>,
}

/// Named alarms with a single timer armed for the nearest one.
pub struct AlarmScheduler<S: Store, T: AlarmTimer> {
    store: S,
    timer: T,
    alarms: HashMap<String, DateTime<Utc>>,
    armed: Option<Armed>,
}

impl<S: Store, T: AlarmTimer> AlarmScheduler<S, T> {
    /// Loads stored alarms and fires any that came due while the process was
    /// not running. Returns the scheduler and the names it fired.
    pub fn open(store: S, timer: T, now: DateTime<Utc>) -> (Self, Vec<String>) {
        let alarms = storage::load_alarms(&store);
        info!(count = alarms.len(), "alarms loaded");
        let mut scheduler = Self {
            store,
            timer,
            alarms,
            armed: None,
        };
        let fired = scheduler.reevaluate(now);
        (scheduler, fired)
    }

    pub fn alarms(&self) -> &HashMap<String, DateTime<Utc>> {
        &self.alarms
    }

    /// Name and deadline of the alarm the timer is armed for.
    pub fn armed(&self) -> Option<(&str, DateTime<Utc>)> {
        self.armed.as_ref().map(|armed| (armed.name.as_str(), armed.at))
    }

    /// Inserts or replaces `name`, then re-arms. Returns alarms fired by the
    /// re-evaluation (including `name` itself if `at` is already past).
    pub fn add_alarm(&mut self, name: String, at: DateTime<Utc>, now: DateTime<Utc>) -> Vec<String> {
        info!(alarm = name.as_str(), at = %at, "alarm set");
        self.alarms.insert(name, at);
        self.persist();
        self.reevaluate(now)
    }

    /// Removes `name` if present. The armed timer is left alone; the next
    /// re-evaluation picks the new nearest alarm.
    pub fn delete_alarm(&mut self, name: &str) -> bool {
        let removed = self.alarms.remove(name).is_some();
        if removed {
            info!(alarm = name, "alarm deleted");
        }
        self.persist();
        removed
    }

    /// The armed timer elapsed.
    pub fn timer_elapsed(&mut self, now: DateTime<Utc>) -> Vec<String> {
        if let Some(armed) = self.armed.take() {
            if !self.alarms.contains_key(&armed.name) {
                debug!(alarm = armed.name.as_str(), "armed alarm was deleted before it fired");
            }
        }
        self.reevaluate(now)
    }

    /// Fires everything due at `now`, then arms the single timer for the
    /// nearest remaining alarm.
    pub fn reevaluate(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = self
            .alarms
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(name, at)| (name.clone(), *at))
            .collect::<Vec<_>>();
        due.sort_by_key(|(_, at)| *at);

        let mut fired = Vec::with_capacity(due.len());
        for (name, _) in due {
            self.alarms.remove(&name);
            self.persist();
            info!(alarm = name.as_str(), "alarm fired");
            fired.push(name);
        }

        self.arm_nearest(now);
        fired
    }

    fn arm_nearest(&mut self, now: DateTime<Utc>) {
        self.timer.cancel();
        self.armed = None;

        let Some((name, at)) = self.alarms.iter().min_by_key(|(_, at)| **at) else {
            return;
        };

        let delay = (*at - now).to_std().unwrap_or_default();
        debug!(alarm = name.as_str(), delay_ms = delay.as_millis() as u64, "timer armed");
        self.armed = Some(Armed {
            name: name.clone(),
            at: *at,
        });
        self.timer.arm(delay);
    }

    fn persist(&self) {
        storage::save_alarms(&self.store, &self.alarms);
    }
}
