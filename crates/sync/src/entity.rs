use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Key set on a payload once the entity it describes has been deleted.
pub const DELETED_MARKER: &str = "__isDeleted";

const ID_FIELD: &str = "id";
const ENTITY_TYPE_FIELD: &str = "entityType";

/// Current time formatted the way every timestamp on the wire is: RFC 3339, millisecond
/// precision, `Z` suffix.
#[must_use]
pub fn now_iso() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn iso(date: &DateTime<Utc>) -> String {
	date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
	User,
	Task,
}

impl EntityType {
	pub const ALL: [Self; 2] = [Self::User, Self::Task];

	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::User => "user",
			Self::Task => "task",
		}
	}
}

impl fmt::Display for EntityType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EntityType {
	type Err = PayloadError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"user" => Ok(Self::User),
			"task" => Ok(Self::Task),
			other => Err(PayloadError::UnknownEntityType(other.to_string())),
		}
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
	#[error("payload is not a JSON object")]
	NotAnObject,
	#[error("missing or non-string `id`")]
	MissingId,
	#[error("missing or non-string `entityType`")]
	MissingEntityType,
	#[error("unknown entity type: {0}")]
	UnknownEntityType(String),
	#[error("payload does not describe a valid {expected}: {reason}")]
	Mismatch {
		expected: EntityType,
		reason: String,
	},
}

/// A (possibly partial) entity as it travels through the feed and the registry.
///
/// `id` and `entity_type` are split out of the field map since they are immutable and used as
/// the registry key. The deletion marker becomes `deleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPayload {
	pub entity_type: EntityType,
	pub id: String,
	pub fields: Map<String, Value>,
	pub deleted: bool,
}

impl EntityPayload {
	#[must_use]
	pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
		Self {
			entity_type,
			id: id.into(),
			fields: Map::new(),
			deleted: false,
		}
	}

	#[must_use]
	pub fn tombstone(entity_type: EntityType, id: impl Into<String>) -> Self {
		Self::new(entity_type, id).into_tombstone()
	}

	#[must_use]
	pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.fields.insert(key.into(), value.into());
		self
	}

	#[must_use]
	pub fn into_tombstone(mut self) -> Self {
		self.deleted = true;
		self
	}

	#[must_use]
	pub fn field(&self, key: &str) -> Option<&Value> {
		self.fields.get(key)
	}

	#[must_use]
	pub fn key(&self) -> (EntityType, &str) {
		(self.entity_type, &self.id)
	}

	/// Builds a payload out of a JSON object, taking ownership of its fields.
	pub fn from_map(mut object: Map<String, Value>) -> Result<Self, PayloadError> {
		let entity_type = match object.remove(ENTITY_TYPE_FIELD) {
			Some(Value::String(tag)) => tag.parse()?,
			_ => return Err(PayloadError::MissingEntityType),
		};

		let Some(Value::String(id)) = object.remove(ID_FIELD) else {
			return Err(PayloadError::MissingId);
		};

		let deleted = matches!(object.remove(DELETED_MARKER), Some(Value::Bool(true)));

		Ok(Self {
			entity_type,
			id,
			fields: object,
			deleted,
		})
	}

	pub fn from_value(value: Value) -> Result<Self, PayloadError> {
		match value {
			Value::Object(object) => Self::from_map(object),
			_ => Err(PayloadError::NotAnObject),
		}
	}

	#[must_use]
	pub fn to_value(&self) -> Value {
		let mut object = Map::with_capacity(self.fields.len() + 3);
		object.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
		object.insert(
			ENTITY_TYPE_FIELD.to_string(),
			Value::String(self.entity_type.as_str().to_string()),
		);
		object.extend(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
		if self.deleted {
			object.insert(DELETED_MARKER.to_string(), Value::Bool(true));
		}

		Value::Object(object)
	}

	/// Shallow merge of `self` onto `previous`: fields present here override, fields only
	/// present in `previous` are kept. A tombstone stays a tombstone.
	#[must_use]
	pub fn merged_onto(&self, previous: Option<&Self>) -> Self {
		let Some(previous) = previous else {
			return self.clone();
		};

		let mut fields = previous.fields.clone();
		fields.extend(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())));

		Self {
			entity_type: self.entity_type,
			id: self.id.clone(),
			fields,
			deleted: previous.deleted || self.deleted,
		}
	}

	fn decode_as<T: de::DeserializeOwned>(&self, expected: EntityType) -> Result<T, PayloadError> {
		if self.entity_type != expected {
			return Err(PayloadError::Mismatch {
				expected,
				reason: format!("payload is a {}", self.entity_type),
			});
		}

		serde_json::from_value(self.to_value()).map_err(|e| PayloadError::Mismatch {
			expected,
			reason: e.to_string(),
		})
	}
}

impl Serialize for EntityPayload {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map =
			serializer.serialize_map(Some(self.fields.len() + 2 + usize::from(self.deleted)))?;
		map.serialize_entry(ID_FIELD, &self.id)?;
		map.serialize_entry(ENTITY_TYPE_FIELD, &self.entity_type)?;
		for (key, value) in &self.fields {
			map.serialize_entry(key, value)?;
		}
		if self.deleted {
			map.serialize_entry(DELETED_MARKER, &true)?;
		}
		map.end()
	}
}

impl<'de> Deserialize<'de> for EntityPayload {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		Self::from_map(Map::deserialize(deserializer)?).map_err(de::Error::custom)
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
	Todo,
	InProgress,
	InReview,
	Done,
}

impl TaskStatus {
	pub const ALL: [Self; 4] = [Self::Todo, Self::InProgress, Self::InReview, Self::Done];

	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Todo => "TODO",
			Self::InProgress => "IN_PROGRESS",
			Self::InReview => "IN_REVIEW",
			Self::Done => "DONE",
		}
	}
}

impl fmt::Display for TaskStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
	pub id: String,
	pub full_name: String,
	pub email: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_url: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl User {
	#[must_use]
	pub fn to_payload(&self) -> EntityPayload {
		let payload = EntityPayload::new(EntityType::User, &self.id)
			.with_field("fullName", self.full_name.clone())
			.with_field("email", self.email.clone())
			.with_field("createdAt", iso(&self.created_at))
			.with_field("updatedAt", iso(&self.updated_at));

		match &self.image_url {
			Some(url) => payload.with_field("imageUrl", url.clone()),
			None => payload,
		}
	}
}

impl TryFrom<&EntityPayload> for User {
	type Error = PayloadError;

	fn try_from(payload: &EntityPayload) -> Result<Self, Self::Error> {
		payload.decode_as(EntityType::User)
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
	pub id: String,
	pub title: String,
	#[serde(default)]
	pub description: String,
	pub status: TaskStatus,
	#[serde(default)]
	pub user_id: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Task {
	#[must_use]
	pub fn to_payload(&self) -> EntityPayload {
		EntityPayload::new(EntityType::Task, &self.id)
			.with_field("title", self.title.clone())
			.with_field("description", self.description.clone())
			.with_field("status", self.status.as_str())
			.with_field(
				"userId",
				self.user_id.clone().map_or(Value::Null, Value::String),
			)
			.with_field("createdAt", iso(&self.created_at))
			.with_field("updatedAt", iso(&self.updated_at))
	}
}

impl TryFrom<&EntityPayload> for Task {
	type Error = PayloadError;

	fn try_from(payload: &EntityPayload) -> Result<Self, Self::Error> {
		payload.decode_as(EntityType::Task)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde_json::json;

	#[test]
	fn splits_key_and_marker_out_of_fields() {
		let payload = EntityPayload::from_value(json!({
			"id": "t1",
			"entityType": "task",
			"status": "DONE",
			"__isDeleted": true,
		}))
		.unwrap();

		assert_eq!(payload.key(), (EntityType::Task, "t1"));
		assert!(payload.deleted);
		assert_eq!(payload.fields.len(), 1);
		assert_eq!(payload.field("status"), Some(&json!("DONE")));
	}

	#[test]
	fn rejects_unknown_entity_type() {
		let err = EntityPayload::from_value(json!({ "id": "x", "entityType": "project" }))
			.unwrap_err();

		assert_eq!(err, PayloadError::UnknownEntityType("project".to_string()));
	}

	#[test]
	fn serializes_back_to_the_wire_shape() {
		let payload = EntityPayload::tombstone(EntityType::User, "u1").with_field("email", "a@b.c");

		assert_eq!(
			serde_json::to_value(&payload).unwrap(),
			json!({ "id": "u1", "entityType": "user", "email": "a@b.c", "__isDeleted": true })
		);
		assert_eq!(payload.to_value(), serde_json::to_value(&payload).unwrap());
	}

	#[test]
	fn shallow_merge_keeps_unspecified_fields() {
		let stored = EntityPayload::new(EntityType::Task, "t1")
			.with_field("title", "Write docs")
			.with_field("status", "TODO");
		let partial = EntityPayload::new(EntityType::Task, "t1").with_field("status", "DONE");

		let merged = partial.merged_onto(Some(&stored));

		assert_eq!(merged.field("title"), Some(&json!("Write docs")));
		assert_eq!(merged.field("status"), Some(&json!("DONE")));
	}

	#[test]
	fn tombstones_are_sticky() {
		let tombstone = EntityPayload::tombstone(EntityType::Task, "t1");
		let late_update = EntityPayload::new(EntityType::Task, "t1").with_field("status", "DONE");

		assert!(late_update.merged_onto(Some(&tombstone)).deleted);
	}

	#[test]
	fn typed_views_round_trip_through_payloads() {
		let task = Task {
			id: "t1".to_string(),
			title: "Ship it".to_string(),
			description: String::new(),
			status: TaskStatus::InReview,
			user_id: Some("u1".to_string()),
			created_at: Utc::now(),
			updated_at: Utc::now(),
		};

		let payload = task.to_payload();
		let decoded = Task::try_from(&payload).unwrap();

		assert_eq!(decoded.status, TaskStatus::InReview);
		assert_eq!(decoded.user_id.as_deref(), Some("u1"));
		assert!(User::try_from(&payload).is_err());
	}
}
