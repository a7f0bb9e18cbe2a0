use crate::{EntityPayload, PayloadError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
	#[error("malformed change batch: {0}")]
	Json(#[from] serde_json::Error),
	#[error("change batch carries no entities")]
	EmptyBatch,
	#[error("entity #{index} in change batch is invalid: {source}")]
	InvalidEntity {
		index: usize,
		#[source]
		source: PayloadError,
	},
}

/// One step of the change feed: the current state of every entity touched since the previous
/// batch, and the cursor to resume from after applying it.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChangeBatch {
	pub entities: Vec<EntityPayload>,
	pub cursor: u64,
}

#[derive(Deserialize)]
struct RawBatch {
	entities: Vec<Value>,
	cursor: u64,
}

impl ChangeBatch {
	/// Decodes a batch received over the wire, rejecting empty batches and entities that are
	/// not one of the known kinds.
	pub fn decode(raw: &str) -> Result<Self, DecodeError> {
		Self::from_value(serde_json::from_str(raw)?)
	}

	pub fn from_value(value: Value) -> Result<Self, DecodeError> {
		let RawBatch { entities, cursor } = serde_json::from_value(value)?;

		if entities.is_empty() {
			return Err(DecodeError::EmptyBatch);
		}

		let entities = entities
			.into_iter()
			.enumerate()
			.map(|(index, entity)| {
				EntityPayload::from_value(entity)
					.map_err(|source| DecodeError::InvalidEntity { index, source })
			})
			.collect::<Result<Vec<_>, _>>()?;

		Ok(Self { entities, cursor })
	}

	pub fn encode(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}
