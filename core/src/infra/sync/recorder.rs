//! Change recording
//!
//! [`RecordingStore`] is the only way mutations reach the [`EntityStore`]. Each mutating call runs
//! the store statement and the [`ChangeLog`] append in one transaction, so either both the entity
//! change and its record commit or neither does. Reads pass straight through and leave the log
//! untouched.

use super::{ChangeLog, Deleted, EntityFilter, EntityStore, Error, SyncEvent, SyncEventBus};

use std::fmt;

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use serde_json::{Map, Value};
use tb_sync::{ChangeRecord, EntityPayload, EntityType, OperationKind};
use tracing::{debug, instrument};

/// Every operation the store understands. Anything else is refused before the store is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	Create,
	Update,
	Delete,
	FindMany,
	FindUnique,
	FindFirst,
	Count,
}

impl Operation {
	pub const ALL: [Self; 7] = [
		Self::Create,
		Self::Update,
		Self::Delete,
		Self::FindMany,
		Self::FindUnique,
		Self::FindFirst,
		Self::Count,
	];

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Create => "create",
			Self::Update => "update",
			Self::Delete => "delete",
			Self::FindMany => "findMany",
			Self::FindUnique => "findUnique",
			Self::FindFirst => "findFirst",
			Self::Count => "count",
		}
	}

	pub fn parse(name: &str, entity_type: EntityType) -> Result<Self, Error> {
		Self::ALL
			.into_iter()
			.find(|operation| operation.as_str() == name)
			.ok_or_else(|| Error::UnrecognizedOperation {
				operation: name.to_string(),
				entity_type,
			})
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Result of [`RecordingStore::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
	Entity(EntityPayload),
	/// Tombstones for the deleted entity and whatever was removed along with it
	Deleted {
		entity: EntityPayload,
		cascaded: Vec<EntityPayload>,
	},
	Entities(Vec<EntityPayload>),
	Found(Option<EntityPayload>),
	Count(u64),
}

impl Outcome {
	/// JSON shape handed back to callers. A deleted user embeds its cascaded tasks under `tasks`
	/// so a single response carries every tombstone.
	pub fn into_value(self) -> Value {
		match self {
			Self::Entity(entity) => entity.to_value(),
			Self::Deleted { entity, cascaded } => {
				let mut value = entity.to_value();
				if let (EntityType::User, Value::Object(object)) = (entity.entity_type, &mut value) {
					object.insert(
						"tasks".to_string(),
						Value::Array(cascaded.iter().map(EntityPayload::to_value).collect()),
					);
				}
				value
			}
			Self::Entities(entities) => {
				Value::Array(entities.iter().map(EntityPayload::to_value).collect())
			}
			Self::Found(entity) => entity.map_or(Value::Null, |entity| entity.to_value()),
			Self::Count(count) => Value::from(count),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RecordingStore {
	db: DatabaseConnection,
	bus: SyncEventBus,
}

impl RecordingStore {
	pub fn new(db: DatabaseConnection, bus: SyncEventBus) -> Self {
		Self { db, bus }
	}

	pub fn db(&self) -> &DatabaseConnection {
		&self.db
	}

	pub fn bus(&self) -> &SyncEventBus {
		&self.bus
	}

	/// Dynamic entry point: `operation` by name, arguments shaped as
	/// `{ "where": { "id" | "search" | "userId" }, "data": { .. } }`.
	#[instrument(skip(self, args), fields(%entity_type), err)]
	pub async fn execute(
		&self,
		entity_type: EntityType,
		operation: &str,
		args: Value,
	) -> Result<Outcome, Error> {
		let operation = Operation::parse(operation, entity_type)?;
		let mut args = Args::new(operation, args)?;

		Ok(match operation {
			Operation::Create => Outcome::Entity(self.create(entity_type, args.data()?).await?),
			Operation::Update => {
				let id = args.id()?;
				Outcome::Entity(self.update(entity_type, &id, args.data()?).await?)
			}
			Operation::Delete => {
				let Deleted { entity, cascaded } = self.delete(entity_type, &args.id()?).await?;
				Outcome::Deleted { entity, cascaded }
			}
			Operation::FindMany => {
				Outcome::Entities(self.find_many(entity_type, &args.filter()?).await?)
			}
			Operation::FindUnique => {
				Outcome::Found(self.find_unique(entity_type, &args.id()?).await?)
			}
			Operation::FindFirst => {
				Outcome::Found(self.find_first(entity_type, &args.filter()?).await?)
			}
			Operation::Count => Outcome::Count(self.count(entity_type, &args.filter()?).await?),
		})
	}

	#[instrument(skip(self, data), fields(%entity_type), err)]
	pub async fn create(
		&self,
		entity_type: EntityType,
		data: Map<String, Value>,
	) -> Result<EntityPayload, Error> {
		let txn = self.db.begin().await?;

		let entity = EntityStore::create(&txn, entity_type, data).await?;
		let record = ChangeLog::append(
			&txn,
			entity_type,
			&entity.id,
			OperationKind::Create,
			occurred_at(&entity),
		)
		.await?;

		self.commit(txn, vec![record]).await?;

		Ok(entity)
	}

	#[instrument(skip(self, data), fields(%entity_type), err)]
	pub async fn update(
		&self,
		entity_type: EntityType,
		id: &str,
		data: Map<String, Value>,
	) -> Result<EntityPayload, Error> {
		let txn = self.db.begin().await?;

		let entity = EntityStore::update(&txn, entity_type, id, data).await?;
		let record = ChangeLog::append(
			&txn,
			entity_type,
			id,
			OperationKind::Update,
			occurred_at(&entity),
		)
		.await?;

		self.commit(txn, vec![record]).await?;

		Ok(entity)
	}

	/// Deletes the entity and returns tombstones. Tasks removed along with a user get a delete
	/// record of their own.
	#[instrument(skip(self), fields(%entity_type), err)]
	pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<Deleted, Error> {
		let txn = self.db.begin().await?;

		let Deleted { entity, cascaded } = EntityStore::delete(&txn, entity_type, id).await?;

		let now = Utc::now();
		let mut records = Vec::with_capacity(cascaded.len() + 1);
		for task in &cascaded {
			records.push(
				ChangeLog::append(&txn, task.entity_type, &task.id, OperationKind::Delete, now)
					.await?,
			);
		}
		records.push(ChangeLog::append(&txn, entity_type, id, OperationKind::Delete, now).await?);

		self.commit(txn, records).await?;

		Ok(Deleted {
			entity: entity.into_tombstone(),
			cascaded: cascaded
				.into_iter()
				.map(EntityPayload::into_tombstone)
				.collect(),
		})
	}

	pub async fn find_many(
		&self,
		entity_type: EntityType,
		filter: &EntityFilter,
	) -> Result<Vec<EntityPayload>, Error> {
		EntityStore::find_many(&self.db, entity_type, filter).await
	}

	pub async fn find_unique(
		&self,
		entity_type: EntityType,
		id: &str,
	) -> Result<Option<EntityPayload>, Error> {
		EntityStore::find_unique(&self.db, entity_type, id).await
	}

	pub async fn find_first(
		&self,
		entity_type: EntityType,
		filter: &EntityFilter,
	) -> Result<Option<EntityPayload>, Error> {
		EntityStore::find_first(&self.db, entity_type, filter).await
	}

	pub async fn count(&self, entity_type: EntityType, filter: &EntityFilter) -> Result<u64, Error> {
		EntityStore::count(&self.db, entity_type, filter).await
	}

	/// Drops change records up to `through`. Feeds resuming from an older cursor are refused.
	#[instrument(skip(self), err)]
	pub async fn prune_log(&self, through: u64) -> Result<u64, Error> {
		let txn = self.db.begin().await?;
		let deleted = ChangeLog::prune_through(&txn, through).await?;
		txn.commit().await?;

		self.bus.emit(SyncEvent::Pruned { through });

		Ok(deleted)
	}

	async fn commit(&self, txn: DatabaseTransaction, records: Vec<ChangeRecord>) -> Result<(), Error> {
		txn.commit().await?;

		if let Some(last) = records.last() {
			debug!(
				cursor = last.sequence,
				count = records.len(),
				"Committed change records"
			);

			self.bus.emit(SyncEvent::Appended {
				cursor: last.sequence,
				count: records.len(),
			});
		}

		Ok(())
	}
}

/// When the change described by a create/update happened: the entity's own `updatedAt`, or now
/// if it has none.
fn occurred_at(entity: &EntityPayload) -> DateTime<Utc> {
	entity
		.field("updatedAt")
		.and_then(Value::as_str)
		.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
		.map_or_else(Utc::now, |date| date.with_timezone(&Utc))
}

struct Args {
	operation: Operation,
	args: Map<String, Value>,
}

impl Args {
	fn new(operation: Operation, args: Value) -> Result<Self, Error> {
		match args {
			Value::Object(args) => Ok(Self { operation, args }),
			Value::Null => Ok(Self {
				operation,
				args: Map::new(),
			}),
			other => Err(Error::InvalidArguments {
				operation,
				reason: format!("expected an object, got {other}"),
			}),
		}
	}

	fn invalid(&self, reason: impl Into<String>) -> Error {
		Error::InvalidArguments {
			operation: self.operation,
			reason: reason.into(),
		}
	}

	fn id(&self) -> Result<String, Error> {
		self.args
			.get("where")
			.and_then(|clause| clause.get("id"))
			.and_then(Value::as_str)
			.map(ToString::to_string)
			.ok_or_else(|| self.invalid("missing `where.id`"))
	}

	fn data(&mut self) -> Result<Map<String, Value>, Error> {
		match self.args.remove("data") {
			Some(Value::Object(data)) => Ok(data),
			_ => Err(self.invalid("missing `data` object")),
		}
	}

	fn filter(&mut self) -> Result<EntityFilter, Error> {
		match self.args.remove("where") {
			None | Some(Value::Null) => Ok(EntityFilter::default()),
			Some(clause) => {
				serde_json::from_value(clause).map_err(|e| self.invalid(e.to_string()))
			}
		}
	}
}
