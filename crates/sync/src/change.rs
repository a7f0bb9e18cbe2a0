use crate::EntityType;

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The mutating operations that produce a [`ChangeRecord`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
	Create,
	Update,
	Delete,
}

impl OperationKind {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Create => "create",
			Self::Update => "update",
			Self::Delete => "delete",
		}
	}
}

impl fmt::Display for OperationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OperationKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"create" => Ok(Self::Create),
			"update" => Ok(Self::Update),
			"delete" => Ok(Self::Delete),
			other => Err(other.to_string()),
		}
	}
}

/// A durable note that one entity was created, updated or deleted.
///
/// `sequence` is assigned by the change log on append, is strictly increasing and doubles as
/// the feed cursor. Records are never mutated after being written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
	pub sequence: u64,
	pub id: String,
	pub entity_type: EntityType,
	pub operation_kind: OperationKind,
	pub occurred_at: DateTime<Utc>,
}

impl ChangeRecord {
	#[must_use]
	pub const fn is_delete(&self) -> bool {
		matches!(self.operation_kind, OperationKind::Delete)
	}
}
