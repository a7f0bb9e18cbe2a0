//! The change feed as seen by its consumer
//!
//! A [`Feed`] is a stream of [`ChangeBatch`]es fed through a bounded channel by whoever holds the
//! matching [`FeedSender`]. The [`FeedHandle`] ends it from the outside, either as a failure
//! ([`FeedHandle::abort`]) or quietly ([`FeedHandle::abort_without_error`]).

use crate::infra::sync::Error;

use std::{
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};

use futures::{task::AtomicWaker, Stream};
use tb_sync::ChangeBatch;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

pub type FeedItem = Result<ChangeBatch, FeedError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
	/// Network hiccup, database busy, server restarting: worth another attempt
	#[error("feed interrupted: {0}")]
	Transient(String),
	/// Protocol violation or rejected credentials: retrying will not help
	#[error("feed rejected: {0}")]
	Permanent(String),
	#[error("feed aborted")]
	Aborted,
}

impl FeedError {
	pub const fn is_transient(&self) -> bool {
		matches!(self, Self::Transient(_) | Self::Aborted)
	}
}

impl From<Error> for FeedError {
	fn from(e: Error) -> Self {
		match e {
			Error::Database(_) => Self::Transient(e.to_string()),
			_ => Self::Permanent(e.to_string()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedState {
	Open,
	/// Ended by [`FeedHandle::abort`]
	Aborted,
	/// Ended by [`FeedHandle::abort_without_error`]
	Closed,
	/// The producer went away on its own
	Finished,
}

impl FeedState {
	const fn is_open(self) -> bool {
		matches!(self, Self::Open)
	}
}

/// Ends a [`Feed`] from outside. Clones share the same feed; only the first call that finds the
/// feed still open has any effect.
#[derive(Debug, Clone)]
pub struct FeedHandle {
	shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
	state: watch::Sender<FeedState>,
	/// Consumer waiting on the channel, woken when the state changes under it
	consumer: AtomicWaker,
}

impl FeedHandle {
	/// Ends the feed with [`FeedError::Aborted`].
	pub fn abort(&self) {
		self.finish(FeedState::Aborted);
	}

	/// Ends the feed as if the producer had no more batches.
	pub fn abort_without_error(&self) {
		self.finish(FeedState::Closed);
	}

	pub fn is_finished(&self) -> bool {
		!self.shared.state.borrow().is_open()
	}

	fn finish(&self, next: FeedState) {
		let changed = self.shared.state.send_if_modified(|state| {
			if state.is_open() {
				*state = next;
				true
			} else {
				false
			}
		});

		if changed {
			self.shared.consumer.wake();
			trace!(state = ?next, "Feed finished");
		}
	}
}

/// Producer side of a [`Feed`].
#[derive(Debug)]
pub struct FeedSender {
	tx: mpsc::Sender<FeedItem>,
	state: watch::Receiver<FeedState>,
	handle: FeedHandle,
}

impl FeedSender {
	/// Delivers a batch, waiting for room in the channel. Returns `false` once the feed is over,
	/// after which nothing else will be delivered.
	pub async fn send(&mut self, batch: ChangeBatch) -> bool {
		if self.is_cancelled() {
			return false;
		}

		tokio::select! {
			sent = self.tx.send(Ok(batch)) => sent.is_ok(),
			() = wait_until_finished(&mut self.state) => false,
		}
	}

	/// Ends the feed with `error`.
	pub async fn fail(self, error: FeedError) {
		if !self.is_cancelled() {
			// A full channel means the consumer is slow, not gone; the error still has to land.
			let _ = self.tx.send(Err(error)).await;
		}
	}

	/// Resolves once the feed was aborted or the consumer dropped it.
	pub async fn cancelled(&mut self) {
		tokio::select! {
			() = self.tx.closed() => {}
			() = wait_until_finished(&mut self.state) => {}
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.tx.is_closed() || !self.state.borrow().is_open()
	}
}

impl Drop for FeedSender {
	fn drop(&mut self) {
		self.handle.finish(FeedState::Finished);
	}
}

async fn wait_until_finished(state: &mut watch::Receiver<FeedState>) {
	loop {
		if !state.borrow_and_update().is_open() {
			return;
		}
		if state.changed().await.is_err() {
			return;
		}
	}
}

pin_project_lite::pin_project! {
	/// Consumer side: a fused stream of batches that ends when the producer finishes or the handle
	/// aborts it. After an abort, batches still buffered in the channel are never yielded.
	pub struct Feed {
		#[pin]
		batches: ReceiverStream<FeedItem>,
		shared: Arc<Shared>,
		done: bool,
	}
}

impl Feed {
	/// Creates a connected producer, consumer and handle. `capacity` bounds the number of batches
	/// buffered between them.
	pub fn channel(capacity: usize) -> (FeedSender, Self, FeedHandle) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		let (state, state_rx) = watch::channel(FeedState::Open);
		let shared = Arc::new(Shared {
			state,
			consumer: AtomicWaker::new(),
		});

		let sender = FeedSender {
			tx,
			state: state_rx,
			handle: FeedHandle {
				shared: Arc::clone(&shared),
			},
		};
		let handle = FeedHandle {
			shared: Arc::clone(&shared),
		};

		let feed = Self {
			batches: ReceiverStream::new(rx),
			shared,
			done: false,
		};

		(sender, feed, handle)
	}
}

impl Stream for Feed {
	type Item = FeedItem;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.project();

		if *this.done {
			return Poll::Ready(None);
		}

		this.shared.consumer.register(cx.waker());

		let state = *this.shared.state.borrow();
		match state {
			FeedState::Aborted => {
				*this.done = true;
				return Poll::Ready(Some(Err(FeedError::Aborted)));
			}
			FeedState::Closed => {
				*this.done = true;
				return Poll::Ready(None);
			}
			FeedState::Open | FeedState::Finished => {}
		}

		match this.batches.poll_next(cx) {
			Poll::Ready(None) => {
				*this.done = true;
				// The producer may have exited because of an abort that raced this poll
				if *this.shared.state.borrow() == FeedState::Aborted {
					Poll::Ready(Some(Err(FeedError::Aborted)))
				} else {
					Poll::Ready(None)
				}
			}
			other => other,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use futures::StreamExt;

	fn batch(cursor: u64) -> ChangeBatch {
		ChangeBatch {
			entities: vec![tb_sync::EntityPayload::tombstone(
				tb_sync::EntityType::Task,
				format!("t{cursor}"),
			)],
			cursor,
		}
	}

	#[tokio::test]
	async fn delivers_batches_in_order_then_ends() {
		let (mut sender, mut feed, handle) = Feed::channel(4);

		assert!(sender.send(batch(1)).await);
		assert!(sender.send(batch(2)).await);
		drop(sender);

		assert_eq!(feed.next().await.unwrap().unwrap().cursor, 1);
		assert_eq!(feed.next().await.unwrap().unwrap().cursor, 2);
		assert!(feed.next().await.is_none());
		assert!(handle.is_finished());
	}

	#[tokio::test]
	async fn abort_surfaces_an_error_and_discards_buffered_batches() {
		let (mut sender, mut feed, handle) = Feed::channel(4);

		assert!(sender.send(batch(1)).await);
		handle.abort();

		assert_eq!(feed.next().await, Some(Err(FeedError::Aborted)));
		assert!(feed.next().await.is_none());
		assert!(!sender.send(batch(2)).await);
	}

	#[tokio::test]
	async fn abort_without_error_ends_quietly_and_is_idempotent() {
		let (mut sender, mut feed, handle) = Feed::channel(4);

		handle.abort_without_error();
		handle.abort_without_error();
		handle.abort();

		assert!(feed.next().await.is_none());
		sender.cancelled().await;
		assert!(sender.is_cancelled());
	}

	#[tokio::test]
	async fn aborting_a_finished_feed_is_a_no_op() {
		let (sender, mut feed, handle) = Feed::channel(1);
		drop(sender);

		handle.abort();

		assert!(feed.next().await.is_none());
	}

	#[tokio::test]
	async fn abort_wakes_a_consumer_parked_on_an_idle_producer() {
		let (_sender, mut feed, handle) = Feed::channel(1);

		let consumer = tokio::spawn(async move { feed.next().await });
		tokio::task::yield_now().await;
		handle.abort_without_error();

		assert!(consumer.await.unwrap().is_none());
	}

	#[tokio::test]
	async fn dropping_the_feed_cancels_the_producer() {
		let (mut sender, feed, _handle) = Feed::channel(1);

		drop(feed);

		sender.cancelled().await;
		assert!(!sender.send(batch(1)).await);
	}
}
