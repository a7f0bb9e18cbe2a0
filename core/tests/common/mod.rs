//! Shared setup for the integration tests

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use serde_json::{json, Map, Value};
use tb_core::{
	config::{AppConfig, SyncConfig},
	Node,
};
use tb_sync::{EntityPayload, EntityType};
use tempfile::TempDir;

/// A node backed by a sqlite file in a throwaway directory. Keep the `TempDir` alive.
pub async fn node() -> (Arc<Node>, TempDir) {
	let dir = tempfile::tempdir().unwrap();

	let mut config = AppConfig::default_with_dir(dir.path().to_path_buf());
	config.sync = SyncConfig {
		poll_interval_ms: 50,
		retry_delay_ms: 50,
		..SyncConfig::default()
	};

	(Node::with_config(config).await.unwrap(), dir)
}

pub fn object(value: Value) -> Map<String, Value> {
	match value {
		Value::Object(map) => map,
		_ => unreachable!("test data is always an object"),
	}
}

pub async fn create_user(node: &Node, name: &str) -> EntityPayload {
	node.store()
		.create(
			EntityType::User,
			object(json!({
				"fullName": name,
				"email": format!("{}@example.com", name.to_lowercase()),
			})),
		)
		.await
		.unwrap()
}

pub async fn create_task(node: &Node, title: &str, user_id: Option<&str>) -> EntityPayload {
	node.store()
		.create(
			EntityType::Task,
			object(json!({ "title": title, "userId": user_id })),
		)
		.await
		.unwrap()
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

	while !condition() {
		assert!(
			tokio::time::Instant::now() < deadline,
			"timed out waiting for {what}"
		);
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}
