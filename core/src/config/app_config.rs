//! Application configuration

use super::default_data_dir;
use crate::config::migration::Migrate;

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const CONFIG_FILE: &str = "taskboard.json";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
	/// Config schema version
	pub version: u32,

	/// Data directory path
	pub data_dir: PathBuf,

	/// Logging level
	pub log_level: String,

	/// Database file name (relative to data_dir)
	pub database: String,

	/// Change feed and client sync tuning
	#[serde(default)]
	pub sync: SyncConfig,
}

/// Knobs for the change feed producer and the polling client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// How often an idle feed producer rechecks the change log without a bus event
	pub poll_interval_ms: u64,

	/// Maximum number of change records folded into one batch
	pub batch_size: u32,

	/// Batches buffered per feed before the producer waits for the consumer
	pub channel_capacity: usize,

	/// Fixed delay between reconnect attempts
	pub retry_delay_ms: u64,

	/// Consecutive failed attempts before the client gives up
	pub max_attempts: u32,

	/// How long a rolled back optimistic value stays visible
	pub overlay_grace_ms: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			poll_interval_ms: 1_000,
			batch_size: 100,
			channel_capacity: 16,
			retry_delay_ms: 2_000,
			max_attempts: 5,
			overlay_grace_ms: 300,
		}
	}
}

impl SyncConfig {
	pub const fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub const fn retry_delay(&self) -> Duration {
		Duration::from_millis(self.retry_delay_ms)
	}

	pub const fn overlay_grace(&self) -> Duration {
		Duration::from_millis(self.overlay_grace_ms)
	}
}

impl AppConfig {
	/// Load configuration from the default location
	pub fn load() -> Result<Self> {
		let data_dir = default_data_dir()?;
		Self::load_from(&data_dir)
	}

	/// Load configuration from a specific data directory, creating it with defaults when missing
	pub fn load_from(data_dir: &Path) -> Result<Self> {
		let config_path = data_dir.join(CONFIG_FILE);

		if config_path.exists() {
			info!("Loading config from {:?}", config_path);
			let json = fs::read_to_string(&config_path)?;
			let mut config: AppConfig = serde_json::from_str(&json)?;

			if config.needs_migration() {
				info!(
					"Migrating config from v{} to v{}",
					config.version,
					Self::target_version()
				);
				config.migrate()?;
				config.save()?;
			}

			Ok(config)
		} else {
			warn!("No config found, creating default at {:?}", config_path);
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			Ok(config)
		}
	}

	/// Create default configuration with specific data directory
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: Self::target_version(),
			data_dir,
			log_level: "info".to_string(),
			database: "taskboard.db".to_string(),
			sync: SyncConfig::default(),
		}
	}

	/// Save configuration to disk
	pub fn save(&self) -> Result<()> {
		fs::create_dir_all(&self.data_dir)?;

		let config_path = self.data_dir.join(CONFIG_FILE);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)?;
		info!("Saved config to {:?}", config_path);
		Ok(())
	}

	/// Get the path for logs directory
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}

	pub fn database_path(&self) -> PathBuf {
		self.data_dir.join(&self.database)
	}

	/// Ensure all required directories exist
	pub fn ensure_directories(&self) -> Result<()> {
		fs::create_dir_all(&self.data_dir)?;
		fs::create_dir_all(self.logs_dir())?;
		Ok(())
	}
}

impl Default for AppConfig {
	fn default() -> Self {
		let data_dir = default_data_dir().unwrap_or_else(|_| PathBuf::from("."));
		Self::default_with_dir(data_dir)
	}
}

impl Migrate for AppConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		2
	}

	fn migrate(&mut self) -> Result<()> {
		match self.version {
			0 => {
				self.version = 1;
				self.migrate()
			}
			1 => {
				// v2 introduced the sync section
				self.sync = SyncConfig::default();
				self.version = 2;
				Ok(())
			}
			2 => Ok(()),
			v => Err(anyhow!("Unknown config version: {}", v)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn creates_defaults_when_missing() {
		let dir = tempfile::tempdir().unwrap();

		let config = AppConfig::load_from(dir.path()).unwrap();

		assert_eq!(config.version, AppConfig::target_version());
		assert_eq!(config.sync, SyncConfig::default());
		assert!(dir.path().join(CONFIG_FILE).exists());
	}

	#[test]
	fn migrates_configs_without_a_sync_section() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(
			dir.path().join(CONFIG_FILE),
			serde_json::json!({
				"version": 1,
				"data_dir": dir.path(),
				"log_level": "debug",
				"database": "board.db",
			})
			.to_string(),
		)
		.unwrap();

		let config = AppConfig::load_from(dir.path()).unwrap();

		assert_eq!(config.version, 2);
		assert_eq!(config.log_level, "debug");
		assert_eq!(config.sync.max_attempts, 5);
		assert_eq!(config.sync.retry_delay(), Duration::from_secs(2));
	}

	#[test]
	fn rejects_unknown_versions() {
		let mut config = AppConfig::default_with_dir(PathBuf::from("."));
		config.version = 9;

		assert!(config.migrate().is_err());
	}
}
