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
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Wire and domain types shared by the task-board change feed and its clients.

mod batch;
mod change;
mod entity;
mod walk;

pub use batch::{ChangeBatch, DecodeError};
pub use change::{ChangeRecord, OperationKind};
pub use entity::{
	now_iso, EntityPayload, EntityType, PayloadError, Task, TaskStatus, User, DELETED_MARKER,
};
pub use walk::collect_entities;
