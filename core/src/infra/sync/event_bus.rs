//! Dedicated event bus for change log activity
//!
//! Feed producers park on this bus between reads instead of hammering the database. Events only
//! say "look again"; the change log stays the source of truth, so a lagging subscriber loses
//! nothing but a wakeup.

use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 1_024;

#[derive(Debug, Clone)]
pub struct SyncEventBus {
	sender: broadcast::Sender<SyncEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
	/// A mutation committed `count` records, the last of which has sequence `cursor`
	Appended { cursor: u64, count: usize },

	/// Records up to and including `through` were removed from the log
	Pruned { through: u64 },
}

impl SyncEvent {
	pub fn event_type(&self) -> &'static str {
		match self {
			SyncEvent::Appended { .. } => "Appended",
			SyncEvent::Pruned { .. } => "Pruned",
		}
	}
}

impl SyncEventBus {
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		debug!("Created sync event bus with capacity {}", capacity);
		Self { sender }
	}

	/// Emit an event to all subscribers
	///
	/// Returns the number of active subscribers that received the event.
	pub fn emit(&self, event: SyncEvent) -> usize {
		let event_type = event.event_type();

		match self.sender.send(event) {
			Ok(count) => {
				debug!(event_type, subscribers = count, "Sync event emitted");
				count
			}
			Err(_) => {
				// Nobody is consuming the feed right now
				debug!(event_type, "Sync event emitted but no subscribers");
				0
			}
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.sender.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl Default for SyncEventBus {
	fn default() -> Self {
		Self::new()
	}
}
