//! Optimistic overlay
//!
//! Presentation-only overrides layered on top of the registry while a mutation is in flight.
//! Nothing in here is ever written to the registry: once the server answers, the registry (fed by
//! the response or the change feed) is authoritative again and the override goes away.

use std::{
	collections::HashMap,
	error::Error as StdError,
	fmt,
	future::Future,
	sync::Arc,
	time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch, time::sleep};
use tracing::{debug, trace};

/// A direct mutation failed; its optimistic value was rolled back.
#[derive(Debug)]
pub struct MutationRejected<E> {
	pub id: String,
	pub source: E,
}

impl<E: fmt::Display> fmt::Display for MutationRejected<E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "mutation rejected <id='{}'>: {}", self.id, self.source)
	}
}

impl<E: StdError + 'static> StdError for MutationRejected<E> {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		Some(&self.source)
	}
}

/// An override and the interaction that set it. Every `set` gets a fresh generation, so a stale
/// grace timer can tell a newer override apart even when the values are equal.
#[derive(Debug)]
struct Entry<V> {
	value: V,
	generation: u64,
}

#[derive(Debug)]
struct Entries<V> {
	map: HashMap<String, Entry<V>>,
	next_generation: u64,
}

#[derive(Debug)]
struct Inner<V> {
	entries: Mutex<Entries<V>>,
	/// Bumped on every change so views know to re-read
	version: watch::Sender<u64>,
}

impl<V> Inner<V> {
	fn bump(&self) {
		self.version.send_modify(|version| *version = version.wrapping_add(1));
	}

	fn insert(&self, id: String, value: V) -> u64 {
		let generation = {
			let mut entries = self.entries.lock();
			entries.next_generation += 1;
			let generation = entries.next_generation;
			entries.map.insert(id, Entry { value, generation });
			generation
		};

		self.bump();
		generation
	}

	/// Removes the override for `id` only if it is still the one tagged `generation`.
	fn remove_if(&self, id: &str, generation: u64) -> bool {
		let removed = {
			let mut entries = self.entries.lock();
			if entries
				.map
				.get(id)
				.is_some_and(|entry| entry.generation == generation)
			{
				entries.map.remove(id);
				true
			} else {
				false
			}
		};

		if removed {
			self.bump();
		}
		removed
	}
}

#[derive(Debug)]
pub struct Overlay<V> {
	inner: Arc<Inner<V>>,
	grace: Duration,
}

impl<V> Clone for Overlay<V> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
			grace: self.grace,
		}
	}
}

impl<V> Overlay<V>
where
	V: Clone + Send + Sync + 'static,
{
	/// `grace` is how long a rolled back value stays visible before the authoritative one shows
	/// through again.
	pub fn new(grace: Duration) -> Self {
		Self {
			inner: Arc::new(Inner {
				entries: Mutex::new(Entries {
					map: HashMap::new(),
					next_generation: 0,
				}),
				version: watch::Sender::new(0),
			}),
			grace,
		}
	}

	pub fn set(&self, id: impl Into<String>, value: V) {
		self.inner.insert(id.into(), value);
	}

	pub fn clear(&self, id: &str) -> bool {
		let cleared = self.inner.entries.lock().map.remove(id).is_some();
		if cleared {
			self.inner.bump();
		}
		cleared
	}

	pub fn get(&self, id: &str) -> Option<V> {
		self.inner
			.entries
			.lock()
			.map
			.get(id)
			.map(|entry| entry.value.clone())
	}

	/// The override when there is one, `authoritative` otherwise.
	pub fn effective_value(&self, id: &str, authoritative: V) -> V {
		self.get(id).unwrap_or(authoritative)
	}

	pub fn is_empty(&self) -> bool {
		self.inner.entries.lock().map.is_empty()
	}

	/// Changes whenever an override is set or cleared.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.inner.version.subscribe()
	}

	/// Shows `target` while `mutation` runs. On success the override is dropped and the registry
	/// takes over. On failure `previous` is shown for the grace window, then cleared, unless a
	/// newer interaction replaced it in the meantime. Dropping the returned future before the
	/// mutation settles counts as a failure.
	pub async fn apply<T, E, Fut>(
		&self,
		id: &str,
		target: V,
		previous: V,
		mutation: Fut,
	) -> Result<T, MutationRejected<E>>
	where
		Fut: Future<Output = Result<T, E>>,
		E: fmt::Display,
	{
		let mut pending = Pending {
			generation: self.inner.insert(id.to_string(), target),
			inner: &self.inner,
			grace: self.grace,
			id,
			previous: Some(previous),
		};

		match mutation.await {
			Ok(value) => {
				pending.settle();
				trace!(id, "Optimistic value settled");
				Ok(value)
			}
			Err(source) => {
				debug!(id, %source, "Mutation failed, rolling back optimistic value");
				pending.roll_back();

				Err(MutationRejected {
					id: id.to_string(),
					source,
				})
			}
		}
	}
}

/// The override set by one [`Overlay::apply`] call, rolled back if the call never settles.
struct Pending<'a, V: Send + Sync + 'static> {
	inner: &'a Arc<Inner<V>>,
	grace: Duration,
	id: &'a str,
	generation: u64,
	/// `None` once settled or rolled back
	previous: Option<V>,
}

impl<V: Send + Sync + 'static> Pending<'_, V> {
	fn settle(&mut self) {
		self.previous = None;
		self.inner.remove_if(self.id, self.generation);
	}

	fn roll_back(&mut self) {
		let Some(previous) = self.previous.take() else {
			return;
		};

		let generation = self.inner.insert(self.id.to_string(), previous);
		clear_after_grace(Arc::clone(self.inner), self.id.to_string(), generation, self.grace);
	}
}

impl<V: Send + Sync + 'static> Drop for Pending<'_, V> {
	fn drop(&mut self) {
		if self.previous.is_some() {
			debug!(id = self.id, "Mutation abandoned, rolling back optimistic value");
			self.roll_back();
		}
	}
}

fn clear_after_grace<V: Send + Sync + 'static>(
	inner: Arc<Inner<V>>,
	id: String,
	generation: u64,
	grace: Duration,
) {
	// Outside a runtime there is no timer to wait on
	let Ok(runtime) = Handle::try_current() else {
		inner.remove_if(&id, generation);
		return;
	};

	runtime.spawn(async move {
		sleep(grace).await;
		inner.remove_if(&id, generation);
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::future::pending;

	use tb_sync::TaskStatus;
	use tokio::time::timeout;

	const GRACE: Duration = Duration::from_millis(300);

	#[tokio::test]
	async fn settles_to_the_authoritative_value_on_success() {
		let overlay = Overlay::new(GRACE);

		let result = overlay
			.apply("t1", TaskStatus::Done, TaskStatus::Todo, async {
				assert_eq!(overlay.get("t1"), Some(TaskStatus::Done));
				Ok::<_, String>(())
			})
			.await;

		assert!(result.is_ok());
		assert!(overlay.is_empty());
		assert_eq!(
			overlay.effective_value("t1", TaskStatus::Done),
			TaskStatus::Done
		);
	}

	#[tokio::test(start_paused = true)]
	async fn rolls_back_then_clears_after_the_grace_window() {
		let overlay = Overlay::new(GRACE);

		let err = overlay
			.apply("t1", TaskStatus::Done, TaskStatus::Todo, async {
				Err::<(), _>("conflict".to_string())
			})
			.await
			.unwrap_err();

		assert_eq!(err.id, "t1");
		assert_eq!(err.source, "conflict");
		// The registry may still say DONE from a stale merge, the rollback wins for now
		assert_eq!(
			overlay.effective_value("t1", TaskStatus::Done),
			TaskStatus::Todo
		);

		sleep(GRACE + Duration::from_millis(1)).await;

		assert_eq!(overlay.get("t1"), None);
	}

	#[tokio::test(start_paused = true)]
	async fn a_newer_interaction_survives_an_older_grace_timer() {
		let overlay = Overlay::new(GRACE);

		let _ = overlay
			.apply("t1", TaskStatus::Done, TaskStatus::Todo, async {
				Err::<(), _>("offline")
			})
			.await;

		overlay.set("t1", TaskStatus::InReview);
		sleep(GRACE * 2).await;

		assert_eq!(overlay.get("t1"), Some(TaskStatus::InReview));
	}

	#[tokio::test(start_paused = true)]
	async fn an_older_grace_timer_leaves_a_newer_rollback_alone() {
		let overlay = Overlay::new(GRACE);
		let offline = || async { Err::<(), _>("offline") };

		let _ = overlay
			.apply("t1", TaskStatus::Done, TaskStatus::Todo, offline())
			.await;
		sleep(GRACE / 2).await;
		let _ = overlay
			.apply("t1", TaskStatus::InReview, TaskStatus::Todo, offline())
			.await;

		// The first timer has fired by now, the second rollback must still show
		sleep(GRACE / 2 + Duration::from_millis(10)).await;
		assert_eq!(overlay.get("t1"), Some(TaskStatus::Todo));

		sleep(GRACE).await;
		assert_eq!(overlay.get("t1"), None);
	}

	#[tokio::test(start_paused = true)]
	async fn abandoning_a_mutation_rolls_back_like_a_failure() {
		let overlay = Overlay::new(GRACE);

		let abandoned = timeout(
			Duration::from_millis(50),
			overlay.apply(
				"t7",
				TaskStatus::InProgress,
				TaskStatus::Todo,
				pending::<Result<(), String>>(),
			),
		)
		.await;

		assert!(abandoned.is_err());
		assert_eq!(overlay.get("t7"), Some(TaskStatus::Todo));

		sleep(Duration::from_secs(3600)).await;
		assert_eq!(overlay.get("t7"), None);
	}

	#[tokio::test]
	async fn subscribers_see_every_change() {
		let overlay = Overlay::new(GRACE);
		let mut version = overlay.subscribe();

		overlay.set("t1", TaskStatus::Done);
		assert!(version.has_changed().unwrap());
		version.borrow_and_update();

		assert!(!overlay.clear("t2"));
		assert!(!version.has_changed().unwrap());
	}
}
