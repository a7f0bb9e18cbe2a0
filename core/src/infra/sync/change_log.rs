//! Durable change log
//!
//! Append-only table of [`ChangeRecord`]s. `sequence` is an `AUTOINCREMENT` rowid: strictly
//! increasing, never reused (not even after pruning) and used verbatim as the feed cursor.

use super::Error;

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DbBackend, QueryResult, Statement};
use tb_sync::{ChangeRecord, EntityType, OperationKind};
use tracing::{debug, trace};

const TABLE: &str = "change_log";

pub struct ChangeLog;

impl ChangeLog {
	pub async fn init_table<C: ConnectionTrait>(conn: &C) -> Result<(), sea_orm::DbErr> {
		conn.execute(Statement::from_string(
			DbBackend::Sqlite,
			r#"
			CREATE TABLE IF NOT EXISTS change_log (
				sequence INTEGER PRIMARY KEY AUTOINCREMENT,
				entity_id TEXT NOT NULL,
				entity_type TEXT NOT NULL,
				operation_kind TEXT NOT NULL,
				occurred_at TEXT NOT NULL
			)
			"#
			.to_string(),
		))
		.await?;

		conn.execute(Statement::from_string(
			DbBackend::Sqlite,
			r#"
			CREATE TABLE IF NOT EXISTS change_log_meta (
				key TEXT PRIMARY KEY,
				value INTEGER NOT NULL
			)
			"#
			.to_string(),
		))
		.await?;

		Ok(())
	}

	/// Appends one record and returns it with its assigned sequence. Callers run this inside the
	/// transaction of the mutation it describes, so the record becomes visible on commit only.
	pub async fn append<C: ConnectionTrait>(
		conn: &C,
		entity_type: EntityType,
		id: &str,
		operation_kind: OperationKind,
		occurred_at: DateTime<Utc>,
	) -> Result<ChangeRecord, Error> {
		let result = conn
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				r#"
				INSERT INTO change_log (entity_id, entity_type, operation_kind, occurred_at)
				VALUES (?, ?, ?, ?)
				"#,
				vec![
					id.into(),
					entity_type.as_str().into(),
					operation_kind.as_str().into(),
					occurred_at.to_rfc3339().into(),
				],
			))
			.await?;

		let record = ChangeRecord {
			sequence: result.last_insert_id(),
			id: id.to_string(),
			entity_type,
			operation_kind,
			occurred_at,
		};

		trace!(sequence = record.sequence, %entity_type, %operation_kind, id, "Appended change record");

		Ok(record)
	}

	/// Records strictly after `cursor`, oldest first, at most `limit` of them.
	pub async fn read_after<C: ConnectionTrait>(
		conn: &C,
		cursor: u64,
		limit: u32,
	) -> Result<Vec<ChangeRecord>, Error> {
		let rows = conn
			.query_all(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				r#"
				SELECT sequence, entity_id, entity_type, operation_kind, occurred_at
				FROM change_log
				WHERE sequence > ?
				ORDER BY sequence ASC
				LIMIT ?
				"#,
				vec![to_sql_int(cursor).into(), i64::from(limit).into()],
			))
			.await?;

		rows.iter().map(parse_record).collect()
	}

	/// Sequence of the most recently appended record, 0 when nothing was ever appended.
	pub async fn head<C: ConnectionTrait>(conn: &C) -> Result<u64, Error> {
		// sqlite_sequence survives pruning, MAX(sequence) would not
		let row = conn
			.query_one(Statement::from_string(
				DbBackend::Sqlite,
				r#"
				SELECT COALESCE(
					(SELECT seq FROM sqlite_sequence WHERE name = 'change_log'),
					0
				) AS head
				"#
				.to_string(),
			))
			.await?;

		read_u64(row, "head")
	}

	/// Highest sequence removed by [`ChangeLog::prune_through`], 0 when never pruned.
	pub async fn pruned_through<C: ConnectionTrait>(conn: &C) -> Result<u64, Error> {
		let row = conn
			.query_one(Statement::from_string(
				DbBackend::Sqlite,
				r#"
				SELECT COALESCE(
					(SELECT value FROM change_log_meta WHERE key = 'pruned_through'),
					0
				) AS pruned_through
				"#
				.to_string(),
			))
			.await?;

		read_u64(row, "pruned_through")
	}

	/// Deletes every record with `sequence <= through` and remembers the watermark so feeds
	/// resuming from before it can be told their cursor expired.
	pub async fn prune_through<C: ConnectionTrait>(conn: &C, through: u64) -> Result<u64, Error> {
		let through = to_sql_int(through);

		let deleted = conn
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				"DELETE FROM change_log WHERE sequence <= ?",
				vec![through.into()],
			))
			.await?
			.rows_affected();

		conn.execute(Statement::from_sql_and_values(
			DbBackend::Sqlite,
			r#"
			INSERT INTO change_log_meta (key, value) VALUES ('pruned_through', ?)
			ON CONFLICT (key) DO UPDATE SET value = MAX(value, excluded.value)
			"#,
			vec![through.into()],
		))
		.await?;

		debug!(through, deleted, "Pruned change log");

		Ok(deleted)
	}
}

fn to_sql_int(value: u64) -> i64 {
	i64::try_from(value).unwrap_or(i64::MAX)
}

fn read_u64(row: Option<QueryResult>, column: &str) -> Result<u64, Error> {
	let Some(row) = row else {
		return Ok(0);
	};

	let value: i64 = row.try_get("", column)?;

	u64::try_from(value).map_err(|_| corrupted(format!("negative {column}: {value}")))
}

fn parse_record(row: &QueryResult) -> Result<ChangeRecord, Error> {
	let sequence: i64 = row.try_get("", "sequence")?;
	let id: String = row.try_get("", "entity_id")?;
	let entity_type: String = row.try_get("", "entity_type")?;
	let operation_kind: String = row.try_get("", "operation_kind")?;
	let occurred_at: String = row.try_get("", "occurred_at")?;

	Ok(ChangeRecord {
		sequence: u64::try_from(sequence)
			.map_err(|_| corrupted(format!("negative sequence: {sequence}")))?,
		id,
		entity_type: entity_type
			.parse()
			.map_err(|e| corrupted(format!("{e} <sequence={sequence}>")))?,
		operation_kind: operation_kind
			.parse()
			.map_err(|kind| corrupted(format!("unknown operation kind '{kind}'")))?,
		occurred_at: DateTime::parse_from_rfc3339(&occurred_at)
			.map_err(|e| corrupted(format!("bad timestamp '{occurred_at}': {e}")))?
			.with_timezone(&Utc),
	})
}

fn corrupted(reason: String) -> Error {
	Error::Corrupted {
		table: TABLE,
		reason,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::database;

	#[tokio::test]
	async fn sequences_increase_and_survive_pruning() {
		let db = database::open_in_memory().await.unwrap();

		assert_eq!(ChangeLog::head(&db).await.unwrap(), 0);

		for id in ["t1", "t2", "t3"] {
			ChangeLog::append(&db, EntityType::Task, id, OperationKind::Create, Utc::now())
				.await
				.unwrap();
		}
		assert_eq!(ChangeLog::head(&db).await.unwrap(), 3);

		assert_eq!(ChangeLog::prune_through(&db, 3).await.unwrap(), 3);
		assert_eq!(ChangeLog::pruned_through(&db).await.unwrap(), 3);

		let next = ChangeLog::append(&db, EntityType::User, "u1", OperationKind::Delete, Utc::now())
			.await
			.unwrap();
		assert_eq!(next.sequence, 4);
		assert_eq!(ChangeLog::head(&db).await.unwrap(), 4);
	}

	#[tokio::test]
	async fn reads_strictly_after_the_cursor() {
		let db = database::open_in_memory().await.unwrap();

		for id in ["t1", "t2", "t3", "t4"] {
			ChangeLog::append(&db, EntityType::Task, id, OperationKind::Update, Utc::now())
				.await
				.unwrap();
		}

		let records = ChangeLog::read_after(&db, 1, 2).await.unwrap();

		assert_eq!(
			records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
			vec![2, 3]
		);
		assert_eq!(records[0].id, "t2");
		assert_eq!(records[0].operation_kind, OperationKind::Update);
	}
}
