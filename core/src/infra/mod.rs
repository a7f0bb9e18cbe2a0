//! Server-side infrastructure: the sqlite database, the entity store and the change log that
//! feeds connected clients.

pub mod database;
pub mod sync;
