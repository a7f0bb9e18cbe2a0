//! Change feed tests
//!
//! Runs the recording store and the feed server against a real sqlite file and checks what a
//! consumer of the feed observes.

mod common;

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tb_core::service::sync::{Feed, FeedError};
use tb_sync::{ChangeBatch, EntityType};
use tokio::time::timeout;

use common::{create_task, create_user, node, object};

async fn next_batch(feed: &mut Feed) -> ChangeBatch {
	timeout(Duration::from_secs(5), feed.next())
		.await
		.expect("a batch within the deadline")
		.expect("the feed is still open")
		.expect("a batch, not an error")
}

#[tokio::test(flavor = "multi_thread")]
async fn replays_history_folded_per_entity() {
	let (node, _dir) = node().await;

	let user = create_user(&node, "Ada").await;
	let task = create_task(&node, "Write docs", Some(&user.id)).await;
	node.store()
		.update(
			EntityType::Task,
			&task.id,
			object(json!({ "status": "IN_PROGRESS" })),
		)
		.await
		.unwrap();

	let (mut feed, handle) = node.feed().consume_feed(Some(0)).await.unwrap();
	let batch = next_batch(&mut feed).await;

	assert_eq!(batch.cursor, 3);
	assert_eq!(
		batch.entities.iter().map(|e| e.key()).collect::<Vec<_>>(),
		vec![(EntityType::User, user.id.as_str()), (EntityType::Task, task.id.as_str())]
	);
	assert_eq!(batch.entities[1].field("status"), Some(&json!("IN_PROGRESS")));

	handle.abort_without_error();
	assert!(feed.next().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn follows_new_mutations_live() {
	let (node, _dir) = node().await;
	create_user(&node, "Ada").await;

	// No cursor: only what happens from now on
	let (mut feed, _handle) = node.feed().consume_feed(None).await.unwrap();

	let task = create_task(&node, "Review", None).await;
	let batch = next_batch(&mut feed).await;

	assert_eq!(batch.cursor, 2);
	assert_eq!(batch.entities.len(), 1);
	assert_eq!(batch.entities[0].id, task.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn resuming_from_a_cursor_loses_nothing_written_in_between() {
	let (node, _dir) = node().await;
	let first = create_task(&node, "First", None).await;

	let (mut feed, handle) = node.feed().consume_feed(Some(0)).await.unwrap();
	let cursor = next_batch(&mut feed).await.cursor;
	handle.abort_without_error();
	drop(feed);

	// Written while nobody is listening
	let second = create_task(&node, "Second", None).await;
	node.store()
		.delete(EntityType::Task, &first.id)
		.await
		.unwrap();

	let (mut feed, _handle) = node.feed().consume_feed(Some(cursor)).await.unwrap();
	let batch = next_batch(&mut feed).await;

	assert_eq!(batch.cursor, 3);
	assert_eq!(batch.entities.len(), 2);
	assert_eq!(batch.entities[0].id, second.id);
	assert!(!batch.entities[0].deleted);
	assert_eq!(batch.entities[1].id, first.id);
	assert!(batch.entities[1].deleted);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_a_user_tombstones_their_tasks_on_the_feed() {
	let (node, _dir) = node().await;
	let user = create_user(&node, "Ada").await;
	let task = create_task(&node, "Plan", Some(&user.id)).await;

	let (mut feed, _handle) = node.feed().consume_feed(None).await.unwrap();
	node.store().delete(EntityType::User, &user.id).await.unwrap();

	let batch = next_batch(&mut feed).await;

	assert!(batch.entities.iter().all(|e| e.deleted));
	assert_eq!(
		batch.entities.iter().map(|e| e.key()).collect::<Vec<_>>(),
		vec![(EntityType::Task, task.id.as_str()), (EntityType::User, user.id.as_str())]
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_ends_the_feed_with_an_error() {
	let (node, _dir) = node().await;

	let (mut feed, handle) = node.feed().consume_feed(None).await.unwrap();
	handle.abort();
	handle.abort();

	assert_eq!(feed.next().await, Some(Err(FeedError::Aborted)));
	assert!(feed.next().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn pruned_cursors_are_refused() {
	let (node, _dir) = node().await;
	for title in ["a", "b", "c"] {
		create_task(&node, title, None).await;
	}

	node.store().prune_log(2).await.unwrap();

	assert!(matches!(
		node.feed().consume_feed(Some(1)).await,
		Err(FeedError::Permanent(_))
	));

	let (mut feed, _handle) = node.feed().consume_feed(Some(2)).await.unwrap();
	assert_eq!(next_batch(&mut feed).await.cursor, 3);
}
