//! Client preferences that survive restarts

use std::{
	fs,
	path::{Path, PathBuf},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PREFERENCES_FILE: &str = "preferences.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
	/// Whether the client keeps consuming the change feed. Off until the user opts in.
	pub sync_enabled: bool,

	#[serde(skip)]
	path: Option<PathBuf>,
}

impl Preferences {
	/// Reads `preferences.json` from `data_dir`. A missing or unreadable file yields defaults bound
	/// to that location, so the next [`Preferences::save`] writes it.
	pub fn load_from(data_dir: &Path) -> Self {
		let path = data_dir.join(PREFERENCES_FILE);

		let mut preferences = match fs::read_to_string(&path) {
			Ok(json) => serde_json::from_str::<Self>(&json).unwrap_or_else(|e| {
				warn!(?path, ?e, "Discarding unreadable preferences");
				Self::default()
			}),
			Err(_) => Self::default(),
		};

		preferences.path = Some(path);
		preferences
	}

	/// Persists to the file it was loaded from. In-memory preferences are not written anywhere.
	pub fn save(&self) -> Result<()> {
		let Some(path) = &self.path else {
			return Ok(());
		};

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		fs::write(path, serde_json::to_string_pretty(self)?)?;
		debug!(?path, sync_enabled = self.sync_enabled, "Saved preferences");

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sync_is_disabled_until_saved_otherwise() {
		let dir = tempfile::tempdir().unwrap();

		let mut preferences = Preferences::load_from(dir.path());
		assert!(!preferences.sync_enabled);

		preferences.sync_enabled = true;
		preferences.save().unwrap();

		assert!(Preferences::load_from(dir.path()).sync_enabled);
	}

	#[test]
	fn garbage_on_disk_falls_back_to_defaults() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join(PREFERENCES_FILE), "{ not json").unwrap();

		assert!(!Preferences::load_from(dir.path()).sync_enabled);
	}
}
