//! Normalized entity registry
//!
//! One bucket per [`EntityType`], each mapping id to the latest known payload. Every response,
//! snapshot and feed batch is merged in here; views read from it and subscribe to it.
//!
//! Snapshots are immutable and shared: a merge that changes nothing publishes nothing, a bucket
//! that did not change keeps its `Arc`, and an entity whose merged value is deep-equal to the
//! stored one keeps its `Arc` too. Views can therefore compare by pointer.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use tb_sync::{collect_entities, EntityPayload, EntityType, Task, User};
use tokio::sync::watch;
use tracing::{debug, trace};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
	entries: HashMap<String, Arc<EntityPayload>>,
}

impl Bucket {
	/// Looks up an id, tombstones included.
	pub fn get(&self, id: &str) -> Option<&Arc<EntityPayload>> {
		self.entries.get(id)
	}

	/// Entities that were not deleted, in no particular order.
	pub fn live(&self) -> impl Iterator<Item = &Arc<EntityPayload>> {
		self.entries.values().filter(|entity| !entity.deleted)
	}

	pub fn tombstones(&self) -> impl Iterator<Item = &Arc<EntityPayload>> {
		self.entries.values().filter(|entity| entity.deleted)
	}

	/// Number of entries, tombstones included.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
	users: Arc<Bucket>,
	tasks: Arc<Bucket>,
}

impl RegistrySnapshot {
	pub fn bucket(&self, entity_type: EntityType) -> &Arc<Bucket> {
		match entity_type {
			EntityType::User => &self.users,
			EntityType::Task => &self.tasks,
		}
	}

	fn bucket_mut(&mut self, entity_type: EntityType) -> &mut Arc<Bucket> {
		match entity_type {
			EntityType::User => &mut self.users,
			EntityType::Task => &mut self.tasks,
		}
	}

	pub fn get(&self, entity_type: EntityType, id: &str) -> Option<&Arc<EntityPayload>> {
		self.bucket(entity_type).get(id)
	}

	/// Live users decoded into their typed view, oldest first.
	pub fn users(&self) -> Vec<User> {
		typed(&self.users)
	}

	/// Live tasks decoded into their typed view, oldest first.
	pub fn tasks(&self) -> Vec<Task> {
		typed(&self.tasks)
	}
}

/// Entries that do not (yet) decode, e.g. partial payloads merged before any full one, are
/// left out.
fn typed<'a, T>(bucket: &'a Bucket) -> Vec<T>
where
	T: TryFrom<&'a EntityPayload> + Ordered,
{
	let mut items = bucket
		.live()
		.filter_map(|entity| T::try_from(entity.as_ref()).ok())
		.collect::<Vec<_>>();
	items.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
	items
}

trait Ordered {
	fn order_key(&self) -> (chrono::DateTime<chrono::Utc>, &str);
}

impl Ordered for User {
	fn order_key(&self) -> (chrono::DateTime<chrono::Utc>, &str) {
		(self.created_at, &self.id)
	}
}

impl Ordered for Task {
	fn order_key(&self) -> (chrono::DateTime<chrono::Utc>, &str) {
		(self.created_at, &self.id)
	}
}

#[derive(Debug)]
pub struct Registry {
	state: watch::Sender<Arc<RegistrySnapshot>>,
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

impl Registry {
	pub fn new() -> Self {
		Self {
			state: watch::Sender::new(Arc::default()),
		}
	}

	/// Merges every entity found anywhere inside `payload`. Returns whether the registry changed.
	/// Shapes that are not entities are ignored, so this never fails.
	pub fn merge(&self, payload: &Value) -> bool {
		self.merge_entities(collect_entities(payload))
	}

	/// Merges already decoded entities, in order.
	pub fn merge_entities(&self, entities: impl IntoIterator<Item = EntityPayload>) -> bool {
		let mut merged = 0_usize;

		let changed = self.state.send_if_modified(|snapshot| {
			let mut next = RegistrySnapshot::clone(snapshot);
			let mut changed = false;

			for entity in entities {
				merged += 1;
				let bucket = next.bucket_mut(entity.entity_type);

				let previous = bucket.get(&entity.id).cloned();
				let value = entity.merged_onto(previous.as_deref());
				if previous.as_deref() == Some(&value) {
					continue;
				}

				Arc::make_mut(bucket)
					.entries
					.insert(value.id.clone(), Arc::new(value));
				changed = true;
			}

			if changed {
				*snapshot = Arc::new(next);
			}
			changed
		});

		trace!(merged, changed, "Merged entities into registry");

		changed
	}

	/// Initial load: merges both snapshots as one `{ users, tasks }` payload.
	pub fn hydrate(&self, users: Vec<EntityPayload>, tasks: Vec<EntityPayload>) -> bool {
		let counts = (users.len(), tasks.len());
		let changed = self.merge_entities(users.into_iter().chain(tasks));
		debug!(users = counts.0, tasks = counts.1, changed, "Hydrated registry");
		changed
	}

	pub fn get_snapshot(&self) -> Arc<RegistrySnapshot> {
		self.state.borrow().clone()
	}

	pub fn get(&self, entity_type: EntityType, id: &str) -> Option<Arc<EntityPayload>> {
		self.state.borrow().get(entity_type, id).cloned()
	}

	pub fn users(&self) -> Vec<User> {
		self.get_snapshot().users()
	}

	pub fn tasks(&self) -> Vec<Task> {
		self.get_snapshot().tasks()
	}

	/// Receives every published snapshot. The current one counts as already seen.
	pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
		self.state.subscribe()
	}

	/// Watches a value derived from the registry, waking only when that value changes.
	pub fn subscribe_with<T, F>(&self, selector: F) -> Selection<T, F>
	where
		T: PartialEq,
		F: Fn(&RegistrySnapshot) -> T,
	{
		let mut snapshots = self.subscribe();
		let current = selector(&snapshots.borrow_and_update());

		Selection {
			snapshots,
			selector,
			current,
		}
	}

	/// Forgets an entry entirely, tombstone or not.
	pub fn purge(&self, entity_type: EntityType, id: &str) -> bool {
		self.state.send_if_modified(|snapshot| {
			if snapshot.get(entity_type, id).is_none() {
				return false;
			}

			let mut next = RegistrySnapshot::clone(snapshot);
			Arc::make_mut(next.bucket_mut(entity_type)).entries.remove(id);
			*snapshot = Arc::new(next);
			true
		})
	}

	/// Forgets every tombstone. Returns how many were dropped.
	pub fn purge_tombstones(&self) -> usize {
		let mut purged = 0;

		self.state.send_if_modified(|snapshot| {
			let mut next = RegistrySnapshot::clone(snapshot);

			for entity_type in EntityType::ALL {
				let bucket = next.bucket_mut(entity_type);
				let tombstones = bucket.tombstones().count();
				if tombstones > 0 {
					Arc::make_mut(bucket)
						.entries
						.retain(|_, entity| !entity.deleted);
					purged += tombstones;
				}
			}

			if purged > 0 {
				*snapshot = Arc::new(next);
			}
			purged > 0
		});

		purged
	}
}

/// A derived value kept in sync with the registry. Dropping it unsubscribes.
pub struct Selection<T, F> {
	snapshots: watch::Receiver<Arc<RegistrySnapshot>>,
	selector: F,
	current: T,
}

impl<T, F> Selection<T, F>
where
	T: PartialEq + Clone,
	F: Fn(&RegistrySnapshot) -> T,
{
	pub fn get(&self) -> &T {
		&self.current
	}

	/// Waits until the selected value differs from the current one and returns it. `None` once
	/// the registry is gone.
	pub async fn changed(&mut self) -> Option<T> {
		loop {
			self.snapshots.changed().await.ok()?;

			let snapshot = self.snapshots.borrow_and_update().clone();
			let next = (self.selector)(&snapshot);
			if next != self.current {
				self.current = next.clone();
				return Some(next);
			}
		}
	}
}
