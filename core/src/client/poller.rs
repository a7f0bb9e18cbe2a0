//! Change feed consumption
//!
//! The [`Poller`] keeps one feed open against a [`FeedSource`] and merges every batch into the
//! [`Registry`]. Failures are retried after a fixed delay; after `max_attempts` consecutive
//! failures, or on the first permanent one, it parks in [`PollerState::Failed`] until started
//! again.

use super::Registry;

use crate::{
	config::SyncConfig,
	service::sync::{Feed, FeedError, FeedHandle, FeedServer},
};

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tb_sync::{EntityPayload, EntityType};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, error, trace, warn};

/// Where the client gets its data from.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
	async fn current_cursor(&self) -> Result<u64, FeedError>;

	async fn fetch_snapshot(&self, entity_type: EntityType)
		-> Result<Vec<EntityPayload>, FeedError>;

	/// Opens a feed of the changes after `cursor`, or from now on when `None`.
	async fn connect(&self, cursor: Option<u64>) -> Result<(Feed, FeedHandle), FeedError>;
}

#[async_trait]
impl FeedSource for FeedServer {
	async fn current_cursor(&self) -> Result<u64, FeedError> {
		Ok(FeedServer::current_cursor(self).await?)
	}

	async fn fetch_snapshot(
		&self,
		entity_type: EntityType,
	) -> Result<Vec<EntityPayload>, FeedError> {
		Ok(FeedServer::fetch_snapshot(self, entity_type).await?)
	}

	async fn connect(&self, cursor: Option<u64>) -> Result<(Feed, FeedHandle), FeedError> {
		self.consume_feed(cursor).await
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
	Idle,
	Connecting,
	Consuming,
	/// Waiting out the retry delay after the `attempt`-th consecutive failure
	Backoff { attempt: u32 },
	Failed { reason: String },
}

pub struct Poller {
	source: Arc<dyn FeedSource>,
	registry: Arc<Registry>,
	retry_delay: Duration,
	max_attempts: u32,
	state: Arc<watch::Sender<PollerState>>,
	cursor: Arc<Mutex<Option<u64>>>,
	running: tokio::sync::Mutex<Option<Running>>,
}

struct Running {
	control: Arc<Control>,
	task: JoinHandle<()>,
}

/// Stop signal shared between [`Poller::stop`] and the consumption loop.
struct Control {
	current: Mutex<Option<FeedHandle>>,
	stop: watch::Sender<bool>,
}

impl Control {
	fn new() -> Self {
		Self {
			current: Mutex::new(None),
			stop: watch::Sender::new(false),
		}
	}

	fn stop(&self) {
		let mut current = self.current.lock();
		self.stop.send_replace(true);
		if let Some(feed) = current.take() {
			feed.abort_without_error();
		}
	}

	/// Tracks the open feed so [`Control::stop`] can close it. A feed opened after a stop is closed
	/// right away.
	fn attach(&self, feed: &FeedHandle) {
		let mut current = self.current.lock();
		if *self.stop.borrow() {
			feed.abort_without_error();
		} else {
			*current = Some(feed.clone());
		}
	}

	fn detach(&self) {
		self.current.lock().take();
	}

	fn is_stopped(&self) -> bool {
		*self.stop.borrow()
	}

	async fn stopped(&self) {
		let mut stop = self.stop.subscribe();
		loop {
			if *stop.borrow_and_update() {
				return;
			}
			if stop.changed().await.is_err() {
				return;
			}
		}
	}
}

impl Poller {
	pub fn new(source: Arc<dyn FeedSource>, registry: Arc<Registry>, config: &SyncConfig) -> Self {
		Self {
			source,
			registry,
			retry_delay: config.retry_delay(),
			max_attempts: config.max_attempts.max(1),
			state: Arc::new(watch::Sender::new(PollerState::Idle)),
			cursor: Arc::new(Mutex::new(None)),
			running: tokio::sync::Mutex::new(None),
		}
	}

	/// Cursor of the last applied batch, `None` before anything was applied or hydrated.
	pub fn cursor(&self) -> Option<u64> {
		*self.cursor.lock()
	}

	/// Where the next connection resumes. Takes effect on the next (re)connect.
	pub fn set_cursor(&self, cursor: Option<u64>) {
		*self.cursor.lock() = cursor;
	}

	pub fn state(&self) -> PollerState {
		self.state.borrow().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<PollerState> {
		self.state.subscribe()
	}

	/// Starts consuming. A loop that is already running is stopped and awaited first, so there is
	/// never more than one.
	pub async fn start(&self) {
		let mut running = self.running.lock().await;

		if let Some(previous) = running.take() {
			previous.shutdown().await;
		}

		let control = Arc::new(Control::new());
		let consumer = Consumer {
			source: Arc::clone(&self.source),
			registry: Arc::clone(&self.registry),
			control: Arc::clone(&control),
			state: Arc::clone(&self.state),
			cursor: Arc::clone(&self.cursor),
			retry_delay: self.retry_delay,
			max_attempts: self.max_attempts,
		};

		debug!(cursor = ?self.cursor(), "Starting change feed consumer");

		*running = Some(Running {
			control,
			task: tokio::spawn(consumer.run()),
		});
	}

	/// Closes the feed without an error, skipping any pending retry, and returns to
	/// [`PollerState::Idle`] once the loop has exited.
	pub async fn stop(&self) {
		if let Some(running) = self.running.lock().await.take() {
			running.shutdown().await;
		}

		set_state(&self.state, PollerState::Idle);
	}
}

impl Running {
	async fn shutdown(self) {
		self.control.stop();

		if let Err(e) = self.task.await {
			error!(?e, "Change feed consumer panicked");
		}
	}
}

impl Drop for Poller {
	fn drop(&mut self) {
		if let Some(running) = self.running.get_mut().take() {
			running.control.stop();
		}
	}
}

struct Consumer {
	source: Arc<dyn FeedSource>,
	registry: Arc<Registry>,
	control: Arc<Control>,
	state: Arc<watch::Sender<PollerState>>,
	cursor: Arc<Mutex<Option<u64>>>,
	retry_delay: Duration,
	max_attempts: u32,
}

impl Consumer {
	async fn run(self) {
		let mut failures = 0_u32;

		while !self.control.is_stopped() {
			set_state(&self.state, PollerState::Connecting);

			let e = match self.consume(&mut failures).await {
				Ok(_) if self.control.is_stopped() => break,
				Ok(0) => {
					// Not a failure, but still paced
					set_state(&self.state, PollerState::Connecting);
					debug!("Change feed closed before delivering anything, reconnecting after the retry delay");
					tokio::select! {
						() = sleep(self.retry_delay) => {}
						() = self.control.stopped() => break,
					}
					continue;
				}
				Ok(_) => {
					debug!("Change feed closed by the server, reconnecting");
					continue;
				}
				Err(e) => e,
			};

			if !e.is_transient() {
				error!(?e, "Change feed failed permanently");
				set_state(
					&self.state,
					PollerState::Failed {
						reason: e.to_string(),
					},
				);
				return;
			}

			failures += 1;
			if failures >= self.max_attempts {
				error!(?e, attempts = failures, "Giving up on the change feed");
				set_state(
					&self.state,
					PollerState::Failed {
						reason: format!("gave up after {failures} attempts: {e}"),
					},
				);
				return;
			}

			warn!(?e, attempt = failures, "Change feed failed, retrying");
			set_state(&self.state, PollerState::Backoff { attempt: failures });

			tokio::select! {
				() = sleep(self.retry_delay) => {}
				() = self.control.stopped() => break,
			}
		}

		set_state(&self.state, PollerState::Idle);
	}

	/// One connection: `Ok` with the number of applied batches when the feed ended without an
	/// error (server closed it, or we were stopped).
	async fn consume(&self, failures: &mut u32) -> Result<usize, FeedError> {
		let cursor = *self.cursor.lock();

		let (mut feed, handle) = tokio::select! {
			connected = self.source.connect(cursor) => connected?,
			() = self.control.stopped() => return Ok(0),
		};

		self.control.attach(&handle);
		set_state(&self.state, PollerState::Consuming);

		let mut applied = 0;
		let result = loop {
			match feed.next().await {
				Some(Ok(batch)) => {
					let count = batch.entities.len();
					self.registry.merge_entities(batch.entities);
					*self.cursor.lock() = Some(batch.cursor);
					*failures = 0;
					applied += 1;
					trace!(cursor = batch.cursor, count, "Applied change batch");
				}
				Some(Err(e)) => break Err(e),
				None => break Ok(applied),
			}
		};

		self.control.detach();
		result
	}
}

fn set_state(state: &watch::Sender<PollerState>, next: PollerState) {
	state.send_if_modified(|current| {
		if *current == next {
			return false;
		}
		trace!(from = ?current, to = ?next, "Poller state changed");
		*current = next;
		true
	});
}
