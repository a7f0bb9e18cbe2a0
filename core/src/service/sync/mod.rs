//! Change feed server
//!
//! Clients bootstrap with [`FeedServer::current_cursor`] followed by [`FeedServer::fetch_snapshot`]
//! per entity type, then follow [`FeedServer::consume_feed`] from that cursor. Reading the cursor
//! first means a mutation racing the snapshot is delivered again by the feed rather than lost;
//! merging it twice is harmless.

mod feed;
mod producer;

pub use feed::{Feed, FeedError, FeedHandle, FeedItem, FeedSender};

use crate::{
	config::SyncConfig,
	infra::sync::{ChangeLog, EntityFilter, EntityStore, Error, SyncEventBus},
};

use producer::Producer;

use sea_orm::DatabaseConnection;
use tb_sync::{EntityPayload, EntityType};
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct FeedServer {
	db: DatabaseConnection,
	bus: SyncEventBus,
	config: SyncConfig,
}

impl FeedServer {
	pub fn new(db: DatabaseConnection, bus: SyncEventBus, config: SyncConfig) -> Self {
		Self { db, bus, config }
	}

	/// Every live entity of one kind, oldest first.
	#[instrument(skip(self), err)]
	pub async fn fetch_snapshot(&self, entity_type: EntityType) -> Result<Vec<EntityPayload>, Error> {
		EntityStore::find_many(&self.db, entity_type, &EntityFilter::default()).await
	}

	/// Sequence of the latest change record, 0 when nothing changed yet.
	pub async fn current_cursor(&self) -> Result<u64, Error> {
		ChangeLog::head(&self.db).await
	}

	/// Starts a feed delivering every change after `cursor`, or after the current head when
	/// `cursor` is `None`. The producer runs until the feed is dropped or aborted.
	#[instrument(skip(self), err)]
	pub async fn consume_feed(&self, cursor: Option<u64>) -> Result<(Feed, FeedHandle), FeedError> {
		// Subscribe before resolving the cursor so no wakeup falls in between
		let events = self.bus.subscribe();

		let cursor = match cursor {
			Some(cursor) => {
				let pruned_through = ChangeLog::pruned_through(&self.db).await?;
				if cursor < pruned_through {
					return Err(Error::CursorExpired {
						cursor,
						pruned_through,
					}
					.into());
				}
				cursor
			}
			None => ChangeLog::head(&self.db).await?,
		};

		let (sender, feed, handle) = Feed::channel(self.config.channel_capacity);

		let producer = Producer {
			db: self.db.clone(),
			events,
			sender,
			cursor,
			batch_size: self.config.batch_size.max(1),
			poll_interval: self.config.poll_interval(),
		};

		debug!(cursor, "Starting change feed");
		tokio::spawn(producer.run());

		Ok((feed, handle))
	}
}
