//! Kanban board: tasks grouped into one column per [`TaskStatus`], with drag-and-drop moves shown
//! optimistically.

use super::{MutationRejected, Overlay, Registry};

use std::{fmt, future::Future, sync::Arc, time::Duration};

use tb_sync::{EntityType, Task, TaskStatus};
use tracing::debug;

pub type StatusOverlay = Overlay<TaskStatus>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
	pub status: TaskStatus,
	pub tasks: Vec<Task>,
}

/// The status to display for `task`: the optimistic one while a move is in flight.
pub fn effective_status(overlay: &StatusOverlay, task: &Task) -> TaskStatus {
	overlay.effective_value(&task.id, task.status)
}

/// One column per status, in workflow order, each task placed by its effective status (which is
/// also what its `status` field is set to). Tasks keep their relative order.
pub fn distribute(tasks: &[Task], overlay: &StatusOverlay) -> Vec<Column> {
	let mut columns = TaskStatus::ALL.map(|status| Column {
		status,
		tasks: Vec::new(),
	});

	for task in tasks {
		let status = effective_status(overlay, task);
		if let Some(column) = columns.iter_mut().find(|column| column.status == status) {
			column.tasks.push(Task {
				status,
				..task.clone()
			});
		}
	}

	columns.into()
}

#[derive(Debug, PartialEq, Eq)]
pub enum Moved<T> {
	/// The task is gone or already shows the target status
	Unchanged,
	Moved(T),
}

pub struct Board {
	registry: Arc<Registry>,
	overlay: StatusOverlay,
}

impl Board {
	pub fn new(registry: Arc<Registry>, grace: Duration) -> Self {
		Self {
			registry,
			overlay: Overlay::new(grace),
		}
	}

	pub fn overlay(&self) -> &StatusOverlay {
		&self.overlay
	}

	pub fn columns(&self) -> Vec<Column> {
		distribute(&self.registry.tasks(), &self.overlay)
	}

	/// Drops `task_id` into the `target` column. The card moves immediately; `mutate` persists the
	/// change and its result comes back as [`Moved::Moved`]. If `mutate` fails the card snaps back
	/// to where it was.
	pub async fn move_task<F, Fut, T, E>(
		&self,
		task_id: &str,
		target: TaskStatus,
		mutate: F,
	) -> Result<Moved<T>, MutationRejected<E>>
	where
		F: FnOnce(String, TaskStatus) -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: fmt::Display,
	{
		let Some(task) = self
			.registry
			.get(EntityType::Task, task_id)
			.filter(|entity| !entity.deleted)
			.and_then(|entity| Task::try_from(entity.as_ref()).ok())
		else {
			debug!(task_id, "Ignoring move of an unknown task");
			return Ok(Moved::Unchanged);
		};

		let previous = effective_status(&self.overlay, &task);
		if previous == target {
			return Ok(Moved::Unchanged);
		}

		self.overlay
			.apply(task_id, target, previous, mutate(task.id, target))
			.await
			.map(Moved::Moved)
	}
}
