//! Change recording infrastructure
//!
//! Every mutation that goes through the [`RecordingStore`] lands in the [`EntityStore`] and leaves
//! exactly one [`ChangeRecord`](tb_sync::ChangeRecord) per touched entity in the [`ChangeLog`],
//! inside the same database transaction. Feed producers learn about new records through the
//! [`SyncEventBus`].

pub mod change_log;
pub mod event_bus;
pub mod recorder;
pub mod store;

pub use change_log::ChangeLog;
pub use event_bus::{SyncEvent, SyncEventBus};
pub use recorder::{Operation, Outcome, RecordingStore};
pub use store::{Deleted, EntityFilter, EntityStore};

use tb_sync::EntityType;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("database error: {0}")]
	Database(#[from] sea_orm::DbErr),
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("unrecognized operation <operation='{operation}', entity_type={entity_type}>")]
	UnrecognizedOperation {
		operation: String,
		entity_type: EntityType,
	},
	#[error("{entity_type} not found <id='{id}'>")]
	NotFound { entity_type: EntityType, id: String },
	#[error("invalid {entity_type} payload: {reason}")]
	InvalidPayload {
		entity_type: EntityType,
		reason: String,
	},
	#[error("invalid arguments for {operation}: {reason}")]
	InvalidArguments {
		operation: Operation,
		reason: String,
	},
	#[error("corrupted row in {table}: {reason}")]
	Corrupted { table: &'static str, reason: String },
	#[error("cursor {cursor} points at records that were pruned <pruned_through={pruned_through}>")]
	CursorExpired { cursor: u64, pruned_through: u64 },
}
