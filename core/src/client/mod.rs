//! Client side of the sync pipeline
//!
//! A [`Client`] owns the [`Registry`] every view reads from and fills it three ways: the initial
//! [`Client::hydrate`], point-in-time [`Client::refetch`]es and responses passed to
//! [`Client::merge_response`], and the change feed followed by its [`Poller`] while sync is
//! enabled.

pub mod board;
pub mod overlay;
pub mod poller;
pub mod registry;

pub use board::{Board, Column, Moved, StatusOverlay};
pub use overlay::{MutationRejected, Overlay};
pub use poller::{FeedSource, Poller, PollerState};
pub use registry::{Bucket, Registry, RegistrySnapshot, Selection};

use crate::{
	config::{Preferences, SyncConfig},
	service::sync::FeedError,
};

use std::sync::Arc;

use serde_json::Value;
use tb_sync::EntityType;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument};

pub struct Client {
	source: Arc<dyn FeedSource>,
	registry: Arc<Registry>,
	poller: Poller,
	board: Board,
	preferences: Mutex<Preferences>,
}

impl Client {
	pub fn new(source: Arc<dyn FeedSource>, config: &SyncConfig, preferences: Preferences) -> Self {
		let registry = Arc::new(Registry::new());

		Self {
			poller: Poller::new(Arc::clone(&source), Arc::clone(&registry), config),
			board: Board::new(Arc::clone(&registry), config.overlay_grace()),
			source,
			registry,
			preferences: Mutex::new(preferences),
		}
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn board(&self) -> &Board {
		&self.board
	}

	pub fn poller(&self) -> &Poller {
		&self.poller
	}

	pub fn sync_state(&self) -> watch::Receiver<PollerState> {
		self.poller.subscribe()
	}

	pub async fn sync_enabled(&self) -> bool {
		self.preferences.lock().await.sync_enabled
	}

	/// Loads every user and task and points the poller at the cursor read just before, so the
	/// feed replays anything that changed while the snapshots were taken.
	#[instrument(skip(self), err)]
	pub async fn hydrate(&self) -> Result<u64, FeedError> {
		let cursor = self.source.current_cursor().await?;
		let users = self.source.fetch_snapshot(EntityType::User).await?;
		let tasks = self.source.fetch_snapshot(EntityType::Task).await?;

		self.registry.hydrate(users, tasks);
		self.poller.set_cursor(Some(cursor));

		Ok(cursor)
	}

	/// Hydrates, then follows the feed if the user left sync enabled last time.
	pub async fn init(&self) -> Result<(), FeedError> {
		self.hydrate().await?;

		if self.sync_enabled().await {
			self.poller.start().await;
		}

		Ok(())
	}

	/// Re-reads one entity kind and merges it.
	#[instrument(skip(self), err)]
	pub async fn refetch(&self, entity_type: EntityType) -> Result<bool, FeedError> {
		let entities = self.source.fetch_snapshot(entity_type).await?;
		Ok(self.registry.merge_entities(entities))
	}

	/// Merges whatever entities a direct call returned.
	pub fn merge_response(&self, response: &Value) -> bool {
		self.registry.merge(response)
	}

	/// Persists the choice and starts or stops following the feed. Enabling hydrates first so a
	/// client that failed or was off for a while starts from a fresh snapshot.
	pub async fn set_sync_enabled(&self, enabled: bool) -> anyhow::Result<()> {
		let mut preferences = self.preferences.lock().await;

		if enabled {
			self.hydrate().await?;
			self.poller.start().await;
		} else {
			self.poller.stop().await;
		}

		if preferences.sync_enabled != enabled {
			preferences.sync_enabled = enabled;
			preferences.save()?;
			info!(enabled, "Changed sync preference");
		}

		Ok(())
	}

	pub async fn shutdown(&self) {
		self.poller.stop().await;
	}
}
