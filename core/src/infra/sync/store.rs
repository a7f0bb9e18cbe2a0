//! Entity persistence
//!
//! Users and tasks live in a single `entities` table keyed by `(entity_type, id)`, their fields
//! stored as a JSON object. Every write is validated against the typed [`User`] / [`Task`] view
//! before it reaches the table.

use super::Error;

use sea_orm::{ConnectionTrait, DbBackend, QueryResult, Statement};
use serde::Deserialize;
use serde_json::{Map, Value};
use tb_sync::{now_iso, EntityPayload, EntityType, Task, TaskStatus, User, DELETED_MARKER};
use tracing::trace;
use uuid::Uuid;

/// Keys owned by the store; never taken from caller supplied data.
const RESERVED_FIELDS: [&str; 5] = ["id", "entityType", "createdAt", "updatedAt", DELETED_MARKER];

/// Narrows `find_many`, `find_first` and `count`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityFilter {
	/// Case-insensitive substring of the id, or of a user's full name / email, or of a task's
	/// title / description
	pub search: Option<String>,
	/// Only tasks assigned to this user
	pub user_id: Option<String>,
}

impl EntityFilter {
	pub fn search(term: impl Into<String>) -> Self {
		Self {
			search: Some(term.into()),
			..Default::default()
		}
	}

	pub fn assigned_to(user_id: impl Into<String>) -> Self {
		Self {
			user_id: Some(user_id.into()),
			..Default::default()
		}
	}

	fn matches(&self, entity: &EntityPayload) -> bool {
		if let Some(user_id) = &self.user_id {
			if entity.field("userId").and_then(Value::as_str) != Some(user_id.as_str()) {
				return false;
			}
		}

		let Some(term) = self.search.as_deref().map(str::to_lowercase) else {
			return true;
		};

		let searchable: &[&str] = match entity.entity_type {
			EntityType::User => &["fullName", "email"],
			EntityType::Task => &["title", "description"],
		};

		entity.id.to_lowercase().contains(&term)
			|| searchable.iter().any(|key| {
				entity
					.field(key)
					.and_then(Value::as_str)
					.is_some_and(|value| value.to_lowercase().contains(&term))
			})
	}
}

/// What a delete removed: the entity itself and anything that went with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Deleted {
	pub entity: EntityPayload,
	/// Tasks removed along with their user
	pub cascaded: Vec<EntityPayload>,
}

pub struct EntityStore;

impl EntityStore {
	pub async fn init_table<C: ConnectionTrait>(conn: &C) -> Result<(), sea_orm::DbErr> {
		conn.execute(Statement::from_string(
			DbBackend::Sqlite,
			r#"
			CREATE TABLE IF NOT EXISTS entities (
				entity_type TEXT NOT NULL,
				id TEXT NOT NULL,
				data TEXT NOT NULL,
				created_at TEXT NOT NULL,
				PRIMARY KEY (entity_type, id)
			)
			"#
			.to_string(),
		))
		.await?;

		conn.execute(Statement::from_string(
			DbBackend::Sqlite,
			r#"
			CREATE INDEX IF NOT EXISTS idx_entities_assignee
			ON entities(json_extract(data, '$.userId'))
			WHERE entity_type = 'task'
			"#
			.to_string(),
		))
		.await?;

		Ok(())
	}

	pub async fn create<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		data: Map<String, Value>,
	) -> Result<EntityPayload, Error> {
		let now = now_iso();
		let mut entity = EntityPayload::new(entity_type, Uuid::new_v4().to_string());
		entity.fields = without_reserved(data);
		if entity_type == EntityType::Task {
			entity
				.fields
				.entry("status")
				.or_insert_with(|| TaskStatus::Todo.as_str().into());
			entity
				.fields
				.entry("description")
				.or_insert_with(|| "".into());
			entity.fields.entry("userId").or_insert(Value::Null);
		}
		entity.fields.insert("createdAt".to_string(), now.clone().into());
		entity.fields.insert("updatedAt".to_string(), now.clone().into());

		Self::validate(conn, &entity).await?;

		conn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"INSERT INTO entities (entity_type, id, data, created_at) VALUES (?, ?, ?, ?)",
			vec![
				entity_type.as_str().into(),
				entity.id.clone().into(),
				serde_json::to_string(&entity.fields)?.into(),
				now.into(),
			],
		))
		.await?;

		trace!(%entity_type, id = %entity.id, "Created entity");

		Ok(entity)
	}

	/// Shallow-merges `data` onto the stored entity and bumps `updatedAt`.
	pub async fn update<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		id: &str,
		data: Map<String, Value>,
	) -> Result<EntityPayload, Error> {
		let existing = Self::find_unique(conn, entity_type, id)
			.await?
			.ok_or_else(|| not_found(entity_type, id))?;

		let mut patch = EntityPayload::new(entity_type, id);
		patch.fields = without_reserved(data);
		patch
			.fields
			.insert("updatedAt".to_string(), now_iso().into());

		let entity = patch.merged_onto(Some(&existing));
		Self::validate(conn, &entity).await?;

		conn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"UPDATE entities SET data = ? WHERE entity_type = ? AND id = ?",
			vec![
				serde_json::to_string(&entity.fields)?.into(),
				entity_type.as_str().into(),
				id.into(),
			],
		))
		.await?;

		trace!(%entity_type, id, "Updated entity");

		Ok(entity)
	}

	/// Removes the entity. Deleting a user also removes the tasks assigned to them.
	pub async fn delete<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		id: &str,
	) -> Result<Deleted, Error> {
		let entity = Self::find_unique(conn, entity_type, id)
			.await?
			.ok_or_else(|| not_found(entity_type, id))?;

		let cascaded = match entity_type {
			EntityType::User => Self::tasks_by_user(conn, id).await?,
			EntityType::Task => Vec::new(),
		};

		for task in &cascaded {
			Self::remove_row(conn, EntityType::Task, &task.id).await?;
		}
		Self::remove_row(conn, entity_type, id).await?;

		trace!(%entity_type, id, cascaded = cascaded.len(), "Deleted entity");

		Ok(Deleted { entity, cascaded })
	}

	pub async fn find_unique<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		id: &str,
	) -> Result<Option<EntityPayload>, Error> {
		conn.query_one(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"SELECT id, data FROM entities WHERE entity_type = ? AND id = ?",
			vec![entity_type.as_str().into(), id.into()],
		))
		.await?
		.map(|row| parse_row(entity_type, &row))
		.transpose()
	}

	/// Matching entities, oldest first.
	pub async fn find_many<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		filter: &EntityFilter,
	) -> Result<Vec<EntityPayload>, Error> {
		let rows = match (entity_type, &filter.user_id) {
			(EntityType::Task, Some(user_id)) => {
				conn.query_all(Statement::from_sql_and_values(
					DbBackend::Sqlite,
					r#"
					SELECT id, data FROM entities
					WHERE entity_type = 'task' AND json_extract(data, '$.userId') = ?
					ORDER BY created_at ASC, id ASC
					"#,
					vec![user_id.as_str().into()],
				))
				.await?
			}
			// Only tasks have an assignee
			(EntityType::User, Some(_)) => return Ok(Vec::new()),
			(_, None) => {
				conn.query_all(Statement::from_sql_and_values(
					DbBackend::Sqlite,
					r#"
					SELECT id, data FROM entities
					WHERE entity_type = ?
					ORDER BY created_at ASC, id ASC
					"#,
					vec![entity_type.as_str().into()],
				))
				.await?
			}
		};

		let mut entities = Vec::with_capacity(rows.len());
		for row in &rows {
			let entity = parse_row(entity_type, row)?;
			if filter.matches(&entity) {
				entities.push(entity);
			}
		}

		Ok(entities)
	}

	pub async fn find_first<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		filter: &EntityFilter,
	) -> Result<Option<EntityPayload>, Error> {
		Ok(Self::find_many(conn, entity_type, filter)
			.await?
			.into_iter()
			.next())
	}

	pub async fn count<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		filter: &EntityFilter,
	) -> Result<u64, Error> {
		if *filter == EntityFilter::default() {
			let row = conn
				.query_one(Statement::from_sql_and_values(
					DbBackend::Sqlite,
					"SELECT COUNT(*) AS total FROM entities WHERE entity_type = ?",
					vec![entity_type.as_str().into()],
				))
				.await?;

			let total: i64 = match row {
				Some(row) => row.try_get("", "total")?,
				None => 0,
			};

			return Ok(u64::try_from(total).unwrap_or_default());
		}

		Ok(Self::find_many(conn, entity_type, filter).await?.len() as u64)
	}

	pub async fn search<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		term: &str,
	) -> Result<Vec<EntityPayload>, Error> {
		Self::find_many(conn, entity_type, &EntityFilter::search(term)).await
	}

	pub async fn tasks_by_user<C: ConnectionTrait>(
		conn: &C,
		user_id: &str,
	) -> Result<Vec<EntityPayload>, Error> {
		Self::find_many(conn, EntityType::Task, &EntityFilter::assigned_to(user_id)).await
	}

	async fn remove_row<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		id: &str,
	) -> Result<(), Error> {
		conn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			"DELETE FROM entities WHERE entity_type = ? AND id = ?",
			vec![entity_type.as_str().into(), id.into()],
		))
		.await?;

		Ok(())
	}

	/// Checks the merged entity decodes into its typed view and that a task's assignee exists.
	async fn validate<C: ConnectionTrait>(conn: &C, entity: &EntityPayload) -> Result<(), Error> {
		let invalid = |reason: String| Error::InvalidPayload {
			entity_type: entity.entity_type,
			reason,
		};

		match entity.entity_type {
			EntityType::User => {
				User::try_from(entity).map_err(|e| invalid(e.to_string()))?;
			}
			EntityType::Task => {
				let task = Task::try_from(entity).map_err(|e| invalid(e.to_string()))?;

				if let Some(user_id) = &task.user_id {
					if Self::find_unique(conn, EntityType::User, user_id)
						.await?
						.is_none()
					{
						return Err(invalid(format!("assignee '{user_id}' does not exist")));
					}
				}
			}
		}

		Ok(())
	}
}

fn without_reserved(mut data: Map<String, Value>) -> Map<String, Value> {
	for key in RESERVED_FIELDS {
		data.remove(key);
	}
	data
}

fn not_found(entity_type: EntityType, id: &str) -> Error {
	Error::NotFound {
		entity_type,
		id: id.to_string(),
	}
}

fn parse_row(entity_type: EntityType, row: &QueryResult) -> Result<EntityPayload, Error> {
	let id: String = row.try_get("", "id")?;
	let data: String = row.try_get("", "data")?;

	let fields = match serde_json::from_str(&data)? {
		Value::Object(fields) => fields,
		other => {
			return Err(Error::Corrupted {
				table: "entities",
				reason: format!("{entity_type} '{id}' holds {other} instead of an object"),
			})
		}
	};

	let mut entity = EntityPayload::new(entity_type, id);
	entity.fields = fields;

	Ok(entity)
}
