use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{DAYS_PER_WEEK, DailyTotals, WeeklyHistory};

pub const TOTAL_TIME_KEY: &str = "totalTime";
pub const TOTAL_TIME_EACH_DAY_KEY: &str = "totalTimeEachDay";
pub const CURRENT_DAY_KEY: &str = "currentDay";
pub const ALARMS_KEY: &str = "alarms";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode value: {0}")]
    JsonEncode(#[source] serde_json::Error),
    #[error("store writer is gone")]
    WriterGone,
}

/// Completion signal for a single store write.
///
/// Callers may drop it (fire-and-forget) or wait on it for durability.
#[derive(Debug)]
pub struct PendingWrite(oneshot::Receiver<Result<(), StorageError>>);

impl PendingWrite {
    pub fn channel() -> (oneshot::Sender<Result<(), StorageError>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self(receiver))
    }

    pub fn ready(result: Result<(), StorageError>) -> Self {
        let (sender, pending) = Self::channel();
        let _ = sender.send(result);
        pending
    }

    /// The outcome if the write has already completed.
    pub fn try_result(&mut self) -> Option<Result<(), StorageError>> {
        match self.0.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(StorageError::WriterGone)),
        }
    }

    pub async fn wait(self) -> Result<(), StorageError> {
        self.0.await.unwrap_or(Err(StorageError::WriterGone))
    }
}

/// String-keyed JSON value store.
pub trait Store {
    fn load(&self, key: &str) -> Result<Option<Value>, StorageError>;
    fn save(&self, key: &str, value: Value) -> PendingWrite;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        (**self).load(key)
    }

    fn save(&self, key: &str, value: Value) -> PendingWrite {
        (**self).save(key, value)
    }
}

/// In-process store; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    pub fn insert(&self, key: &str, value: Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value);
        }
    }
}

impl Store for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.get(key))
    }

    fn save(&self, key: &str, value: Value) -> PendingWrite {
        self.insert(key, value);
        PendingWrite::ready(Ok(()))
    }
}

/// All keys in one JSON object file, rewritten through a temp file on every
/// save.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl FileStore {
    /// Opens `path`, starting empty when it does not exist. A file that is
    /// not a JSON object is moved aside to `<path>.corrupt` and the store
    /// starts empty; only real I/O failures are errors.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let entries = match read_entries(path)? {
            Some(Ok(entries)) => entries,
            Some(Err(reason)) => {
                let aside = corrupt_path(path);
                tracing::warn!(
                    store = %path.display(),
                    aside = %aside.display(),
                    "corrupted store file, starting empty: {reason}"
                );
                fs::rename(path, &aside)?;
                Map::new()
            }
            None => Map::new(),
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, entries: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let blob = serde_json::to_vec_pretty(entries).map_err(StorageError::JsonEncode)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&blob)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// `None` when the file is missing or blank, `Some(Err(reason))` when it
/// holds something other than a JSON object.
fn read_entries(path: &Path) -> Result<Option<Result<Map<String, Value>, String>>, StorageError> {
    let raw = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StorageError::Io(err)),
    };

    if raw.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(entries)) => Ok(entries),
        Ok(_) => Err("not a JSON object".to_string()),
        Err(err) => Err(err.to_string()),
    }))
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

impl Store for FileStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned()))
    }

    /// Keys written to the file by another process since the last save are
    /// picked up before writing, so only `key` is overwritten.
    fn save(&self, key: &str, value: Value) -> PendingWrite {
        let result = match self.entries.lock() {
            Ok(mut entries) => {
                if let Ok(Some(Ok(on_disk))) = read_entries(&self.path) {
                    for (other, stored) in on_disk {
                        if other != key {
                            entries.insert(other, stored);
                        }
                    }
                }
                entries.insert(key.to_string(), value);
                self.write_file(&entries)
            }
            Err(_) => Err(StorageError::WriterGone),
        };
        PendingWrite::ready(result)
    }
}

/// Store whose writes always fail; reads come back empty.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct FailingStore;

#[cfg(test)]
impl Store for FailingStore {
    fn load(&self, _key: &str) -> Result<Option<Value>, StorageError> {
        Ok(None)
    }

    fn save(&self, _key: &str, _value: Value) -> PendingWrite {
        PendingWrite::ready(Err(StorageError::Io(std::io::Error::new(
            ErrorKind::PermissionDenied,
            "read-only store",
        ))))
    }
}

/// Encodes and saves `value`; the outcome is logged if it is already known.
pub fn persist<S: Store + ?Sized, T: Serialize>(store: &S, key: &str, value: &T) {
    let value = match serde_json::to_value(value) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(key, "failed to encode value: {err}");
            return;
        }
    };

    let mut pending = store.save(key, value);
    if let Some(Err(err)) = pending.try_result() {
        tracing::error!(key, "store write failed: {err}");
    }
}

/// Reads a typed value; a missing key, a failed read or a value of the wrong
/// shape all come back as `None`.
pub fn load_or_absent<S: Store + ?Sized, T: DeserializeOwned>(store: &S, key: &str) -> Option<T> {
    let value = match store.load(key) {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(key, "store read failed, treating as absent: {err}");
            return None;
        }
    };

    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            tracing::warn!(key, "corrupted stored value, treating as absent: {err}");
            None
        }
    }
}

/// Weekly history is stored as a 7-element array; an object keyed `"0"`
/// through `"6"` is accepted too.
pub fn load_weekly_history<S: Store + ?Sized>(store: &S) -> Option<WeeklyHistory> {
    let value = match store.load(TOTAL_TIME_EACH_DAY_KEY) {
        Ok(value) => value?,
        Err(err) => {
            tracing::warn!(key = TOTAL_TIME_EACH_DAY_KEY, "store read failed: {err}");
            return None;
        }
    };

    let value = match value {
        Value::Object(mut slots) => Value::Array(
            (0..DAYS_PER_WEEK)
                .map(|index| {
                    slots
                        .remove(&index.to_string())
                        .unwrap_or_else(|| Value::Object(Map::new()))
                })
                .collect(),
        ),
        other => other,
    };

    match serde_json::from_value(value) {
        Ok(history) => Some(history),
        Err(err) => {
            tracing::warn!(
                key = TOTAL_TIME_EACH_DAY_KEY,
                "corrupted weekly history, treating as absent: {err}"
            );
            None
        }
    }
}

pub fn load_daily_totals<S: Store + ?Sized>(store: &S) -> Option<DailyTotals> {
    load_or_absent(store, TOTAL_TIME_KEY)
}

pub fn load_current_day<S: Store + ?Sized>(store: &S) -> Option<DateTime<Utc>> {
    let raw: String = load_or_absent(store, CURRENT_DAY_KEY)?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(timestamp) => Some(timestamp.with_timezone(&Utc)),
        Err(err) => {
            tracing::warn!(key = CURRENT_DAY_KEY, value = raw.as_str(), "unparseable day marker: {err}");
            None
        }
    }
}

pub fn load_alarms<S: Store + ?Sized>(store: &S) -> HashMap<String, DateTime<Utc>> {
    let raw: HashMap<String, Value> = load_or_absent(store, ALARMS_KEY).unwrap_or_default();
    let mut alarms = HashMap::new();
    for (name, value) in raw {
        let parsed = value
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok());
        match parsed {
            Some(at) => {
                alarms.insert(name, at.with_timezone(&Utc));
            }
            None => tracing::warn!(alarm = name.as_str(), "dropping alarm with unparseable time"),
        }
    }
    alarms
}

pub fn save_alarms<S: Store + ?Sized>(store: &S, alarms: &HashMap<String, DateTime<Utc>>) {
    let encoded = alarms
        .iter()
        .map(|(name, at)| (name.clone(), at.to_rfc3339()))
        .collect::<HashMap<_, _>>();
    persist(store, ALARMS_KEY, &encoded);
}
