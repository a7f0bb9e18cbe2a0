#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(
	clippy::missing_errors_doc,
	clippy::module_name_repetitions,
	clippy::missing_panics_doc
)]

//! Task board core: the server-side store and change feed, and the client-side registry that
//! mirrors it.

pub mod client;
pub mod config;
pub mod infra;
pub mod service;

use crate::{
	client::Client,
	config::{AppConfig, Preferences},
	infra::{
		database,
		sync::{RecordingStore, SyncEventBus},
	},
	service::sync::FeedServer,
};

use std::{path::Path, sync::Arc};

use sea_orm::DatabaseConnection;
use tracing::info;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber: `RUST_LOG` (falling back to `log_level`) filters both stdout
/// and a daily rolling file under `{data_dir}/logs`. Keep the guard alive for as long as logs
/// should be flushed.
pub fn init_tracing(data_dir: impl AsRef<Path>, log_level: &str) -> anyhow::Result<WorkerGuard> {
	let logs_dir = data_dir.as_ref().join("logs");
	std::fs::create_dir_all(&logs_dir)?;

	let (non_blocking, guard) = tracing_appender::non_blocking(rolling::daily(logs_dir, "log"));

	let filter = EnvFilter::try_from_default_env().or_else(|_| {
		EnvFilter::try_new(format!(
			"warn,tb_core={log_level},tb_sync={log_level},tb_server={log_level}"
		))
	})?;

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_target(true))
		.with(
			fmt::layer()
				.with_target(true)
				.with_ansi(false)
				.with_writer(non_blocking),
		)
		.try_init()?;

	Ok(guard)
}

/// Server side of the task board: the database, the recording store all mutations go through
/// and the feed server clients follow.
pub struct Node {
	config: AppConfig,
	db: DatabaseConnection,
	store: RecordingStore,
	feed: FeedServer,
}

impl Node {
	/// Loads (or creates) the config in `data_dir` and opens the database it points at.
	pub async fn new(data_dir: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
		let config = AppConfig::load_from(data_dir.as_ref())?;
		Self::with_config(config).await
	}

	pub async fn with_config(config: AppConfig) -> anyhow::Result<Arc<Self>> {
		config.ensure_directories()?;
		let db = database::open(config.database_path()).await?;

		Ok(Self::assemble(config, db))
	}

	/// A node whose data lives and dies with the process.
	pub async fn in_memory(config: AppConfig) -> anyhow::Result<Arc<Self>> {
		let db = database::open_in_memory().await?;

		Ok(Self::assemble(config, db))
	}

	fn assemble(config: AppConfig, db: DatabaseConnection) -> Arc<Self> {
		let bus = SyncEventBus::new();

		let node = Self {
			store: RecordingStore::new(db.clone(), bus.clone()),
			feed: FeedServer::new(db.clone(), bus, config.sync.clone()),
			config,
			db,
		};

		info!(data_dir = ?node.config.data_dir, "Task board node ready");

		Arc::new(node)
	}

	pub fn config(&self) -> &AppConfig {
		&self.config
	}

	pub fn db(&self) -> &DatabaseConnection {
		&self.db
	}

	pub fn store(&self) -> &RecordingStore {
		&self.store
	}

	pub fn feed(&self) -> &FeedServer {
		&self.feed
	}

	/// A client following this node in-process, with preferences from the node's data directory.
	pub fn client(&self) -> Client {
		self.client_with(Preferences::load_from(&self.config.data_dir))
	}

	pub fn client_with(&self, preferences: Preferences) -> Client {
		Client::new(Arc::new(self.feed.clone()), &self.config.sync, preferences)
	}
}
