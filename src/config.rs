use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

const APP_DIR: &str = "pet_timeledger";
const STORE_FILE: &str = "store.json";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config {}: {source}", .path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config {}: {source}", .path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
	#[error("day_start_offset_hours must be within 0..=23, got {0}")]
	DayStartOffset(i64),
}

/// Contents of `config.toml`; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
	pub store_path: Option<PathBuf>,
	pub day_start_offset_hours: i64,
}

#[derive(Debug, Clone)]
pub struct Settings {
	pub store_path: PathBuf,
	pub day_start_offset_hours: i64,
}

impl Settings {
	pub fn day_start_offset(&self) -> Duration {
		Duration::hours(self.day_start_offset_hours)
	}
}

/// Resolves settings with precedence: CLI flag, then environment, then the
/// config file, then the platform state directory.
pub fn resolve_settings(
	cli_store: Option<PathBuf>,
	cli_config: Option<PathBuf>,
) -> Result<Settings, ConfigError> {
	let config_path = cli_config
		.or_else(|| env_path("PET_TIMELEDGER_CONFIG"))
		.unwrap_or_else(|| state_dir().join(CONFIG_FILE));
	let file_config = load_file_config(&config_path)?;

	if !(0..24).contains(&file_config.day_start_offset_hours) {
		return Err(ConfigError::DayStartOffset(file_config.day_start_offset_hours));
	}

	let store_path = cli_store
		.or_else(|| env_path("PET_TIMELEDGER_STORE"))
		.or(file_config.store_path)
		.unwrap_or_else(|| state_dir().join(STORE_FILE));

	Ok(Settings {
		store_path: absolutize(store_path),
		day_start_offset_hours: file_config.day_start_offset_hours,
	})
}

pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
	let raw = match fs::read_to_string(path) {
		Ok(raw) => raw,
		Err(err) if err.kind() == ErrorKind::NotFound => return Ok(FileConfig::default()),
		Err(source) => {
			return Err(ConfigError::Read {
				path: path.to_path_buf(),
				source,
			});
		}
	};

	toml::from_str(&raw).map_err(|source| ConfigError::Parse {
		path: path.to_path_buf(),
		source,
	})
}

fn env_path(name: &str) -> Option<PathBuf> {
	let path = PathBuf::from(env::var_os(name)?);
	if path.as_os_str().is_empty() {
		None
	} else {
		Some(path)
	}
}

fn state_dir() -> PathBuf {
	if let Some(path) = env_path("PET_TIMELEDGER_STATE_DIR") {
		return path;
	}

	#[cfg(target_os = "windows")]
	{
		if let Some(path) = env::var_os("LOCALAPPDATA") {
			return PathBuf::from(path).join(APP_DIR);
		}
	}

	if let Some(path) = env::var_os("XDG_STATE_HOME") {
		return PathBuf::from(path).join(APP_DIR);
	}

	if let Some(path) = env::var_os("HOME") {
		return PathBuf::from(path).join(".local").join("state").join(APP_DIR);
	}

	PathBuf::from(".pet_timeledger")
}

fn absolutize(path: PathBuf) -> PathBuf {
	if path.is_absolute() {
		return path;
	}

	match env::current_dir() {
		Ok(cwd) => cwd.join(path),
		Err(_) => path,
	}
}
