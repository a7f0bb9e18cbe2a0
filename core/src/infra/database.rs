//! Task board database connection
//!
//! Entity rows and the change log share one sqlite file so a mutation and the record describing
//! it commit in the same transaction.

use super::sync::{ChangeLog, EntityStore};

use std::path::Path;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use tracing::info;

/// Opens (creating if needed) the database at `path` and makes sure the schema exists.
pub async fn open(path: impl AsRef<Path>) -> Result<DatabaseConnection, DbErr> {
	let path = path.as_ref();

	let mut options = ConnectOptions::new(format!("sqlite://{}?mode=rwc", path.display()));
	options.max_connections(8).sqlx_logging(false);

	let db = Database::connect(options).await?;
	db.execute_unprepared("PRAGMA journal_mode = WAL").await?;
	init_schema(&db).await?;

	info!(path = %path.display(), "Opened task board database");

	Ok(db)
}

/// Single-connection in-memory database, for tests and throwaway nodes.
pub async fn open_in_memory() -> Result<DatabaseConnection, DbErr> {
	let mut options = ConnectOptions::new("sqlite::memory:".to_string());
	options
		.max_connections(1)
		.min_connections(1)
		.sqlx_logging(false);

	let db = Database::connect(options).await?;
	init_schema(&db).await?;

	Ok(db)
}

pub async fn init_schema<C: ConnectionTrait>(conn: &C) -> Result<(), DbErr> {
	EntityStore::init_table(conn).await?;
	ChangeLog::init_table(conn).await?;

	Ok(())
}
