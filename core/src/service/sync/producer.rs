use super::FeedSender;

use crate::infra::sync::{ChangeLog, EntityStore, Error, SyncEvent};

use std::{collections::HashMap, time::Duration};

use sea_orm::DatabaseConnection;
use tb_sync::{ChangeBatch, ChangeRecord, EntityPayload, EntityType};
use tokio::{sync::broadcast, time::sleep};
use tracing::{debug, trace, warn};

/// Feeds one [`super::Feed`]: drains the change log past `cursor`, then parks until the bus says
/// something was appended or `poll_interval` elapses.
pub(super) struct Producer {
	pub(super) db: DatabaseConnection,
	pub(super) events: broadcast::Receiver<SyncEvent>,
	pub(super) sender: FeedSender,
	pub(super) cursor: u64,
	pub(super) batch_size: u32,
	pub(super) poll_interval: Duration,
}

impl Producer {
	pub(super) async fn run(mut self) {
		loop {
			match self.next_batch().await {
				Ok(Some(batch)) => {
					let cursor = batch.cursor;
					if !self.sender.send(batch).await {
						break;
					}
					trace!(cursor, "Delivered change batch");
					// More records may be waiting behind this batch
					continue;
				}
				Ok(None) => {}
				Err(e) => {
					warn!(?e, cursor = self.cursor, "Change feed producer failed");
					self.sender.fail(e.into()).await;
					return;
				}
			}

			tokio::select! {
				() = self.sender.cancelled() => break,
				event = self.events.recv() => match event {
					Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
					// Server shutting down
					Err(broadcast::error::RecvError::Closed) => break,
				},
				() = sleep(self.poll_interval) => {}
			}
		}

		debug!(cursor = self.cursor, "Change feed producer stopped");
	}

	/// Folds the records after the cursor into one batch. Windows whose entities all vanished
	/// (their delete lies beyond the window) advance the cursor without yielding a batch.
	async fn next_batch(&mut self) -> Result<Option<ChangeBatch>, Error> {
		loop {
			let records = ChangeLog::read_after(&self.db, self.cursor, self.batch_size).await?;
			let Some(last) = records.last().map(|record| record.sequence) else {
				return Ok(None);
			};

			let entities = self.resolve(latest_per_entity(records)).await?;
			self.cursor = last;

			if !entities.is_empty() {
				return Ok(Some(ChangeBatch {
					entities,
					cursor: last,
				}));
			}
		}
	}

	/// Current state for every touched entity, or a tombstone when its last record is a delete.
	async fn resolve(&self, records: Vec<ChangeRecord>) -> Result<Vec<EntityPayload>, Error> {
		let mut entities = Vec::with_capacity(records.len());

		for record in records {
			if record.is_delete() {
				entities.push(EntityPayload::tombstone(record.entity_type, record.id));
				continue;
			}

			match EntityStore::find_unique(&self.db, record.entity_type, &record.id).await? {
				Some(entity) => entities.push(entity),
				None => trace!(
					sequence = record.sequence,
					id = %record.id,
					"Entity vanished before delivery, its delete record follows"
				),
			}
		}

		Ok(entities)
	}
}

/// One record per entity, the last one, ordered by sequence.
fn latest_per_entity(records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
	let mut latest: HashMap<(EntityType, String), ChangeRecord> = HashMap::new();

	for record in records {
		latest.insert((record.entity_type, record.id.clone()), record);
	}

	let mut records = latest.into_values().collect::<Vec<_>>();
	records.sort_unstable_by_key(|record| record.sequence);
	records
}

#[cfg(test)]
mod tests {
	use super::*;

	use chrono::Utc;
	use tb_sync::OperationKind;

	fn record(sequence: u64, id: &str, operation_kind: OperationKind) -> ChangeRecord {
		ChangeRecord {
			sequence,
			id: id.to_string(),
			entity_type: EntityType::Task,
			operation_kind,
			occurred_at: Utc::now(),
		}
	}

	#[test]
	fn keeps_the_last_record_of_each_entity_in_log_order() {
		let folded = latest_per_entity(vec![
			record(1, "a", OperationKind::Create),
			record(2, "b", OperationKind::Create),
			record(3, "a", OperationKind::Update),
			record(4, "c", OperationKind::Create),
			record(5, "b", OperationKind::Delete),
		]);

		assert_eq!(
			folded
				.iter()
				.map(|r| (r.id.as_str(), r.sequence))
				.collect::<Vec<_>>(),
			vec![("a", 3), ("c", 4), ("b", 5)]
		);
	}
}
